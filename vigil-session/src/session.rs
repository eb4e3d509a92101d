use crate::fields::{FieldKind, FIELDS_CNT_MIN, FIELDS_MAX, FIELD_MAX_PACKETS_TO_SAVE, FIELD_MIN_PACKETS_BEFORE_SAVING};
use crate::object::ObjectStore;
use std::collections::HashSet;
use std::net::IpAddr;

pub const TCPFLAG_SYN: usize = 0;
pub const TCPFLAG_SYN_ACK: usize = 1;
pub const TCPFLAG_ACK: usize = 2;
pub const TCPFLAG_PSH: usize = 3;
pub const TCPFLAG_RST: usize = 4;
pub const TCPFLAG_FIN: usize = 5;
pub const TCPFLAG_URG: usize = 6;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ESP: u8 = 50;
pub const IPPROTO_ICMPV6: u8 = 58;
pub const IPPROTO_SCTP: u8 = 132;

const DEFAULT_OBJECT_BUDGET: usize = 1_000_000;

/// A value stored in a regular session field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(u32),
    IntArray(Vec<u32>),
    IntSet(HashSet<u32>),
    Float(f32),
    FloatArray(Vec<f32>),
    Str(String),
    StrArray(Vec<String>),
    StrSet(HashSet<String>),
    Ip(IpAddr),
    IpSet(HashSet<IpAddr>),
}

impl FieldValue {
    /// Number of members present, as seen by count pseudo-fields.
    pub fn cardinality(&self) -> u32 {
        match self {
            FieldValue::Int(_) | FieldValue::Float(_) | FieldValue::Str(_) | FieldValue::Ip(_) => 1,
            FieldValue::IntArray(items) => items.len() as u32,
            FieldValue::IntSet(items) => items.len() as u32,
            FieldValue::FloatArray(items) => items.len() as u32,
            FieldValue::StrArray(items) => items.len() as u32,
            FieldValue::StrSet(items) => items.len() as u32,
            FieldValue::IpSet(items) => items.len() as u32,
        }
    }
}

/// A single write into a session field; the registered kind of the target
/// field decides whether it overwrites, appends or set-inserts.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldWrite {
    Int(u32),
    Float(f32),
    Str(String),
    Ip(IpAddr),
}

/// One network session, owned by exactly one packet worker for its whole
/// life, so nothing in here is synchronized.
pub struct Session {
    pub addr1: IpAddr,
    pub addr2: IpAddr,
    pub port1: u16,
    pub port2: u16,
    pub ip_protocol: u8,
    pub packets: [u32; 2],
    pub databytes: [u64; 2],
    pub tcp_flag_cnt: [u32; 7],
    /// Timestamp of the most recent packet, milliseconds since the epoch.
    pub last_packet_ms: u64,
    pub max_packets_to_save: u32,
    pub min_packets_before_saving: u32,
    protocols: Vec<String>,
    fields: Vec<Option<FieldValue>>,
    pub objects: ObjectStore,
}

impl Session {
    pub fn new(addr1: IpAddr, port1: u16, addr2: IpAddr, port2: u16, ip_protocol: u8) -> Self {
        Self {
            addr1,
            addr2,
            port1,
            port2,
            ip_protocol,
            packets: [0; 2],
            databytes: [0; 2],
            tcp_flag_cnt: [0; 7],
            last_packet_ms: 0,
            max_packets_to_save: 0,
            min_packets_before_saving: 0,
            protocols: Vec::new(),
            fields: Vec::new(),
            objects: ObjectStore::new(DEFAULT_OBJECT_BUDGET),
        }
    }

    pub fn with_object_budget(mut self, budget: usize) -> Self {
        self.objects = ObjectStore::new(budget);
        self
    }

    pub fn add_protocol(&mut self, label: &str) {
        if !self.has_protocol(label) {
            self.protocols.push(label.to_string());
        }
    }

    pub fn has_protocol(&self, label: &str) -> bool {
        self.protocols.iter().any(|p| p == label)
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn field(&self, pos: u16) -> Option<&FieldValue> {
        self.fields.get(pos as usize)?.as_ref()
    }

    /// Cardinality of the field behind a count pseudo-field position.
    pub fn field_cardinality(&self, cnt_pos: u16) -> u32 {
        let base = cnt_pos.wrapping_sub(FIELDS_CNT_MIN);
        if base >= FIELDS_MAX {
            return 0;
        }
        self.field(base).map(|v| v.cardinality()).unwrap_or(0)
    }

    /// Writes `value` into the field at `pos` according to the field's
    /// registered `kind`. Returns true when the write changed the field:
    /// scalar overwrites and array appends always do, set inserts only when
    /// the member is new. Positions of the writable session pseudo-fields
    /// update the session struct directly.
    pub fn write_field(&mut self, pos: u16, kind: FieldKind, value: FieldWrite) -> bool {
        match pos {
            FIELD_MAX_PACKETS_TO_SAVE => {
                if let FieldWrite::Int(n) = value {
                    self.max_packets_to_save = n;
                    return true;
                }
                return false;
            }
            FIELD_MIN_PACKETS_BEFORE_SAVING => {
                if let FieldWrite::Int(n) = value {
                    self.min_packets_before_saving = n;
                    return true;
                }
                return false;
            }
            _ => {}
        }
        if pos >= FIELDS_MAX {
            return false;
        }
        let slot = pos as usize;
        if self.fields.len() <= slot {
            self.fields.resize_with(slot + 1, || None);
        }
        match (kind, value) {
            (FieldKind::Int, FieldWrite::Int(n)) => {
                self.fields[slot] = Some(FieldValue::Int(n));
                true
            }
            (FieldKind::IntArray, FieldWrite::Int(n)) => {
                match self.fields[slot].get_or_insert(FieldValue::IntArray(Vec::new())) {
                    FieldValue::IntArray(items) => items.push(n),
                    _ => return false,
                }
                true
            }
            (FieldKind::IntSet, FieldWrite::Int(n)) => {
                match self.fields[slot].get_or_insert(FieldValue::IntSet(HashSet::new())) {
                    FieldValue::IntSet(items) => items.insert(n),
                    _ => false,
                }
            }
            (FieldKind::Float, FieldWrite::Float(f)) => {
                self.fields[slot] = Some(FieldValue::Float(f));
                true
            }
            (FieldKind::FloatArray, FieldWrite::Float(f)) => {
                match self.fields[slot].get_or_insert(FieldValue::FloatArray(Vec::new())) {
                    FieldValue::FloatArray(items) => items.push(f),
                    _ => return false,
                }
                true
            }
            (FieldKind::Str, FieldWrite::Str(s)) => {
                self.fields[slot] = Some(FieldValue::Str(s));
                true
            }
            (FieldKind::StrArray, FieldWrite::Str(s)) => {
                match self.fields[slot].get_or_insert(FieldValue::StrArray(Vec::new())) {
                    FieldValue::StrArray(items) => items.push(s),
                    _ => return false,
                }
                true
            }
            (FieldKind::StrSet, FieldWrite::Str(s)) => {
                match self.fields[slot].get_or_insert(FieldValue::StrSet(HashSet::new())) {
                    FieldValue::StrSet(items) => items.insert(s),
                    _ => false,
                }
            }
            (FieldKind::Ip, FieldWrite::Ip(ip)) => {
                self.fields[slot] = Some(FieldValue::Ip(ip));
                true
            }
            (FieldKind::IpSet, FieldWrite::Ip(ip)) => {
                match self.fields[slot].get_or_insert(FieldValue::IpSet(HashSet::new())) {
                    FieldValue::IpSet(items) => items.insert(ip),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Short endpoint summary used in rule-match log lines.
    pub fn pretty(&self) -> String {
        format!(
            "{}:{} -> {}:{}",
            self.addr1, self.port1, self.addr2, self.port2
        )
    }
}
