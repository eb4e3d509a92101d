use super::tables;
use serde_json::json;
use std::net::{IpAddr, Ipv6Addr};
use vigil_parser::{RData, RrSection};
use vigil_session::{Session, SessionObject};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// How much of a query/response exchange this transaction has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    QueryOnly = 1,
    ResponseOnly = 2,
    QueryAndResponse = 6,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub packet_uid: u16,
    pub opcode_id: u8,
    pub opcode: &'static str,
    pub hostname: String,
    /// Class and type ids stay 0 when the wire value has no known name.
    pub class_id: u16,
    pub class: Option<&'static str>,
    pub type_id: u16,
    pub type_name: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub rr_name: String,
    pub section: RrSection,
    pub rtype: u16,
    pub class: Option<&'static str>,
    pub type_name: Option<&'static str>,
    pub ttl: u32,
    pub packet_uid: u16,
    pub flags: Vec<&'static str>,
    pub rdata: RData,
}

impl DnsAnswer {
    /// Replayed responses are deduplicated on this identity.
    fn same_record(&self, other: &DnsAnswer) -> bool {
        self.rtype == other.rtype
            && self.rr_name == other.rr_name
            && self.rdata == other.rdata
            && self.ttl == other.ttl
    }
}

/// One DNS query and its correlated responses within a session. Keyed in
/// the session object store by the fingerprint/equality pair below so a
/// later response finds its query.
#[derive(Debug)]
pub struct DnsTransaction {
    pub query: DnsQuery,
    pub answers: Vec<DnsAnswer>,
    /// -1 until a response is seen.
    pub rcode_id: i8,
    pub rcode: Option<&'static str>,
    pub activity: Activity,
    pub query_ts_ms: Option<u64>,
    pub response_ts_ms: Option<u64>,
}

impl DnsTransaction {
    pub fn new(query: DnsQuery) -> Self {
        Self {
            query,
            answers: Vec::new(),
            rcode_id: -1,
            rcode: None,
            activity: Activity::QueryOnly,
            query_ts_ms: None,
            response_ts_ms: None,
        }
    }

    pub fn fingerprint(&self) -> u32 {
        let mut hostname_hash = FNV_OFFSET;
        for byte in self.query.hostname.as_bytes() {
            hostname_hash ^= *byte as u32;
            hostname_hash = hostname_hash.wrapping_mul(FNV_PRIME);
        }
        hostname_hash
            ^ ((self.query.opcode_id as u32) << 24 | (self.query.packet_uid as u32) << 8)
            ^ ((self.query.type_id as u32) << 16 | self.query.class_id as u32)
    }

    fn same_identity(&self, other: &DnsTransaction) -> bool {
        self.query.packet_uid == other.query.packet_uid
            && self.query.opcode_id == other.query.opcode_id
            && self.query.hostname == other.query.hostname
            && self.query.class_id == other.query.class_id
            && self.query.type_id == other.query.type_id
    }

    /// Appends an answer; when `dedupe` is set (merging into a preexisting
    /// transaction) an already-stored identical record is dropped.
    pub fn push_answer(&mut self, answer: DnsAnswer, dedupe: bool) {
        if dedupe && self.answers.iter().any(|a| a.same_record(&answer)) {
            return;
        }
        self.answers.push(answer);
    }

    pub fn rdata_string(rdata: &RData) -> String {
        match rdata {
            RData::A(packed) => format!(
                "{}.{}.{}.{}",
                packed & 0xff,
                (packed >> 8) & 0xff,
                (packed >> 16) & 0xff,
                (packed >> 24) & 0xff
            ),
            RData::Aaaa(bytes) => ip6_string(Ipv6Addr::from(*bytes)),
            RData::Ns(name) => name.clone(),
            RData::Cname(name) => name.clone(),
            RData::Mx {
                preference,
                exchange,
            } => format!("({preference}){exchange}"),
            RData::Txt(text) => String::from_utf8_lossy(text).into_owned(),
            RData::Caa { flags, tag, value } => format!("CAA {flags} {tag} {value}"),
        }
    }

    /// The emitted JSON event; OCSF-strict mode adds the schema framing and
    /// drops the record-section keys the schema has no place for.
    pub fn to_event(&self, session: &Session, strict: bool, now_ms: u64) -> serde_json::Value {
        let mut event = serde_json::Map::new();

        if strict {
            event.insert("category_uid".into(), json!(4));
            event.insert("class_uid".into(), json!(4003));
            event.insert("type_uid".into(), json!(400306));
            event.insert("severity_id".into(), json!(1));
            event.insert(
                "metadata".into(),
                json!({"product": {"vendor_name": "arkime"}, "version": "1.1.0"}),
            );
            event.insert("activity_uid".into(), json!(self.activity as u8));
            event.insert("time".into(), json!(now_ms));
            event.insert("query_time".into(), json!(self.query_ts_ms.unwrap_or(0)));
            event.insert(
                "response_time".into(),
                json!(self.response_ts_ms.unwrap_or(0)),
            );
        }

        let mut query = serde_json::Map::new();
        query.insert("opcode_id".into(), json!(self.query.opcode_id));
        query.insert("opcode".into(), json!(self.query.opcode));
        query.insert("packet_uid".into(), json!(self.query.packet_uid));
        query.insert("hostname".into(), json!(self.query.hostname));
        if let Some(class) = self.query.class {
            query.insert("class".into(), json!(class));
        }
        if let Some(type_name) = self.query.type_name {
            query.insert("type".into(), json!(type_name));
        }
        event.insert("query".into(), serde_json::Value::Object(query));

        if strict {
            event.insert(
                "dst_endpoint".into(),
                json!({"ip": ip_string(&session.addr2), "port": session.port2}),
            );
            event.insert(
                "src_endpoint".into(),
                json!({"ip": ip_string(&session.addr1), "port": session.port1}),
            );
        }

        if self.rcode_id != -1 {
            event.insert("rcode_id".into(), json!(self.rcode_id));
            if let Some(rcode) = self.rcode {
                event.insert("rcode".into(), json!(rcode));
            }
            event.insert("answersCnt".into(), json!(self.answers.len()));
            if !self.answers.is_empty() {
                let answers: Vec<serde_json::Value> = self
                    .answers
                    .iter()
                    .map(|answer| self.answer_event(answer, strict))
                    .collect();
                event.insert("answers".into(), serde_json::Value::Array(answers));
            }
        }

        serde_json::Value::Object(event)
    }

    fn answer_event(&self, answer: &DnsAnswer, strict: bool) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        out.insert("rdata".into(), json!(Self::rdata_string(&answer.rdata)));
        if let Some(class) = answer.class {
            out.insert("class".into(), json!(class));
        }
        if let Some(type_name) = answer.type_name {
            out.insert("type".into(), json!(type_name));
        }
        out.insert("packet_uid".into(), json!(answer.packet_uid));
        out.insert("ttl".into(), json!(answer.ttl));
        if !answer.flags.is_empty() {
            out.insert("flags".into(), json!(answer.flags));
        }
        if !strict {
            out.insert("rr_name".into(), json!(answer.rr_name));
            out.insert("rr_type".into(), json!(answer.section.label()));
        }
        serde_json::Value::Object(out)
    }
}

impl SessionObject for DnsTransaction {
    fn fingerprint(&self) -> u32 {
        DnsTransaction::fingerprint(self)
    }

    fn equals(&self, other: &dyn SessionObject) -> bool {
        other
            .as_any()
            .downcast_ref::<DnsTransaction>()
            .map(|other| self.same_identity(other))
            .unwrap_or(false)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn ip6_string(addr: Ipv6Addr) -> String {
    match addr.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => addr.to_string(),
    }
}

fn ip_string(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => ip6_string(*v6),
    }
}

/// Query record builder shared by the UDP and TCP paths.
pub fn query_record(id: u16, opcode: u8, hostname: String, qtype: u16, qclass: u16) -> DnsQuery {
    let class = tables::qclass_name(qclass);
    let type_name = tables::qtype_name(qtype);
    DnsQuery {
        packet_uid: id,
        opcode_id: opcode,
        opcode: tables::opcode_name(opcode),
        hostname,
        class_id: if class.is_some() { qclass } else { 0 },
        class,
        type_id: if type_name.is_some() { qtype } else { 0 },
        type_name,
    }
}
