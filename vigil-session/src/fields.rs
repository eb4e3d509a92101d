use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Highest position for regular registered fields.
pub const FIELDS_MAX: u16 = 256;
/// Count pseudo-fields live at `FIELDS_CNT_MIN + pos` and match on the
/// cardinality of the underlying field.
pub const FIELDS_CNT_MIN: u16 = 256;
/// Session pseudo-fields (endpoints, counters, flow hash) start here.
pub const FIELDS_SPECIAL_START: u16 = 512;

pub const FIELD_SRC_IP: u16 = 512;
pub const FIELD_SRC_PORT: u16 = 513;
pub const FIELD_DST_IP: u16 = 514;
pub const FIELD_DST_PORT: u16 = 515;
pub const FIELD_TCPFLAGS_SYN: u16 = 516;
pub const FIELD_TCPFLAGS_SYN_ACK: u16 = 517;
pub const FIELD_TCPFLAGS_ACK: u16 = 518;
pub const FIELD_TCPFLAGS_PSH: u16 = 519;
pub const FIELD_TCPFLAGS_RST: u16 = 520;
pub const FIELD_TCPFLAGS_FIN: u16 = 521;
pub const FIELD_TCPFLAGS_URG: u16 = 522;
pub const FIELD_PACKETS_SRC: u16 = 523;
pub const FIELD_PACKETS_DST: u16 = 524;
pub const FIELD_DATABYTES_SRC: u16 = 525;
pub const FIELD_DATABYTES_DST: u16 = 526;
pub const FIELD_COMMUNITY_ID: u16 = 527;
pub const FIELD_MAX_PACKETS_TO_SAVE: u16 = 528;
pub const FIELD_MIN_PACKETS_BEFORE_SAVING: u16 = 529;

const FIELDS_TOTAL: u16 = 530;

/// Marks definitions that only describe synthesized output names and do not
/// back a matchable session field.
pub const FIELD_FLAG_FAKE: u32 = 0x01;
/// The field also exposes a `.cnt` pseudo-field.
pub const FIELD_FLAG_CNT: u32 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    IntArray,
    IntSet,
    Float,
    FloatArray,
    Str,
    StrArray,
    StrSet,
    Ip,
    IpSet,
    Object,
}

impl FieldKind {
    pub fn is_int(&self) -> bool {
        matches!(self, FieldKind::Int | FieldKind::IntArray | FieldKind::IntSet)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, FieldKind::Float | FieldKind::FloatArray)
    }

    pub fn is_string(&self) -> bool {
        matches!(self, FieldKind::Str | FieldKind::StrArray | FieldKind::StrSet)
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, FieldKind::Ip | FieldKind::IpSet)
    }
}

#[derive(Debug)]
pub struct FieldDef {
    pub pos: u16,
    pub group: String,
    pub kind: FieldKind,
    pub name: String,
    pub expression: String,
    pub description: String,
    pub flags: u32,
}

struct SpecialField {
    pos: u16,
    expression: &'static str,
    kind: FieldKind,
}

const SPECIAL_FIELDS: &[SpecialField] = &[
    SpecialField { pos: FIELD_SRC_IP, expression: "srcIp", kind: FieldKind::Ip },
    SpecialField { pos: FIELD_SRC_PORT, expression: "srcPort", kind: FieldKind::Int },
    SpecialField { pos: FIELD_DST_IP, expression: "dstIp", kind: FieldKind::Ip },
    SpecialField { pos: FIELD_DST_PORT, expression: "dstPort", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_SYN, expression: "tcpflags.syn", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_SYN_ACK, expression: "tcpflags.syn-ack", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_ACK, expression: "tcpflags.ack", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_PSH, expression: "tcpflags.psh", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_RST, expression: "tcpflags.rst", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_FIN, expression: "tcpflags.fin", kind: FieldKind::Int },
    SpecialField { pos: FIELD_TCPFLAGS_URG, expression: "tcpflags.urg", kind: FieldKind::Int },
    SpecialField { pos: FIELD_PACKETS_SRC, expression: "packets.src", kind: FieldKind::Int },
    SpecialField { pos: FIELD_PACKETS_DST, expression: "packets.dst", kind: FieldKind::Int },
    SpecialField { pos: FIELD_DATABYTES_SRC, expression: "databytes.src", kind: FieldKind::Int },
    SpecialField { pos: FIELD_DATABYTES_DST, expression: "databytes.dst", kind: FieldKind::Int },
    SpecialField { pos: FIELD_COMMUNITY_ID, expression: "communityId", kind: FieldKind::Str },
    SpecialField { pos: FIELD_MAX_PACKETS_TO_SAVE, expression: "_maxPacketsToSave", kind: FieldKind::Int },
    SpecialField { pos: FIELD_MIN_PACKETS_BEFORE_SAVING, expression: "_minPacketsBeforeSavingSPI", kind: FieldKind::Int },
];

/// The registry of session fields. Append-only while the pipeline starts
/// up, then shared read-only; only the per-field rule-enabled bits are
/// flipped afterwards, which is why they are atomics.
pub struct FieldRegistry {
    fields: Vec<FieldDef>,
    by_expression: HashMap<String, u16>,
    rule_enabled: Vec<AtomicBool>,
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldRegistry {
    pub fn new() -> Self {
        let mut by_expression = HashMap::new();
        for special in SPECIAL_FIELDS {
            by_expression.insert(special.expression.to_string(), special.pos);
        }
        Self {
            fields: Vec::new(),
            by_expression,
            rule_enabled: (0..FIELDS_TOTAL).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Registers a field and returns its position. Definitions carrying
    /// [`FIELD_FLAG_FAKE`] only name synthesized output and are not
    /// resolvable from rule documents.
    pub fn define(
        &mut self,
        group: &str,
        kind: FieldKind,
        name: &str,
        expression: &str,
        description: &str,
        flags: u32,
    ) -> u16 {
        if flags & FIELD_FLAG_FAKE == 0 {
            if let Some(existing) = self.by_expression.get(expression) {
                return *existing;
            }
        }
        let pos = self.fields.len() as u16;
        assert!(pos < FIELDS_MAX, "field registry exhausted");
        self.fields.push(FieldDef {
            pos,
            group: group.to_string(),
            kind,
            name: name.to_string(),
            expression: expression.to_string(),
            description: description.to_string(),
            flags,
        });
        if flags & FIELD_FLAG_FAKE == 0 {
            self.by_expression.insert(expression.to_string(), pos);
        }
        pos
    }

    /// Registers a field holding opaque per-session objects. Hashing,
    /// equality and serialization come from the object's
    /// [`crate::SessionObject`] implementation.
    pub fn register_object(&mut self, name: &str, description: &str) -> u16 {
        self.define(name, FieldKind::Object, name, name, description, 0)
    }

    /// Resolves a rule-document field expression to a position. A `.cnt`
    /// suffix on a countable field resolves to the count pseudo-field.
    pub fn by_expression(&self, expression: &str) -> Option<u16> {
        if let Some(pos) = self.by_expression.get(expression) {
            return Some(*pos);
        }
        let base = expression.strip_suffix(".cnt")?;
        let pos = *self.by_expression.get(base)?;
        if pos >= FIELDS_MAX {
            return None;
        }
        Some(FIELDS_CNT_MIN + pos)
    }

    pub fn kind(&self, pos: u16) -> Option<FieldKind> {
        if pos >= FIELDS_SPECIAL_START {
            return SPECIAL_FIELDS.iter().find(|s| s.pos == pos).map(|s| s.kind);
        }
        if pos >= FIELDS_CNT_MIN {
            return Some(FieldKind::Int);
        }
        self.fields.get(pos as usize).map(|f| f.kind)
    }

    pub fn expression_of(&self, pos: u16) -> String {
        if pos >= FIELDS_SPECIAL_START {
            return SPECIAL_FIELDS
                .iter()
                .find(|s| s.pos == pos)
                .map(|s| s.expression.to_string())
                .unwrap_or_else(|| format!("field#{pos}"));
        }
        if pos >= FIELDS_CNT_MIN {
            let base = (pos - FIELDS_CNT_MIN) as usize;
            return match self.fields.get(base) {
                Some(field) => format!("{}.cnt", field.expression),
                None => format!("field#{pos}"),
            };
        }
        self.fields
            .get(pos as usize)
            .map(|f| f.expression.clone())
            .unwrap_or_else(|| format!("field#{pos}"))
    }

    pub fn rule_enabled(&self, pos: u16) -> bool {
        self.rule_enabled
            .get(pos as usize)
            .map(|bit| bit.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn set_rule_enabled(&self, pos: u16) {
        if let Some(bit) = self.rule_enabled.get(pos as usize) {
            bit.store(true, Ordering::Relaxed);
        }
    }

    pub fn defs(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }
}
