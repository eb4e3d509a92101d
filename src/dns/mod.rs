mod tables;
mod transaction;
mod transport;

pub use transaction::*;
pub use transport::*;

use std::sync::atomic::{AtomicU64, Ordering};
use vigil_parser::{parse_message, MessageError, ParsedMessage};
use vigil_rules::RulesEngine;
use vigil_session::{
    FieldKind, FieldRegistry, FieldWrite, Session, FIELD_FLAG_CNT, FIELD_FLAG_FAKE,
};

/// Storage estimate applied when a transaction is admitted: a fixed part
/// for the query plus a per-record part plus any free-form text.
const OBJECT_BASE_SIZE: usize = 720;
const OBJECT_RECORD_SIZE: usize = 180;

/// Discard counters, reported through stats rather than logs: runtime wire
/// problems are business as usual on a capture link.
#[derive(Debug, Default)]
pub struct DnsStats {
    pub malformed: AtomicU64,
    pub policy: AtomicU64,
    pub truncated: AtomicU64,
    pub refused: AtomicU64,
    pub parsed: AtomicU64,
}

/// The DNS/LLMNR/mDNS session driver: feeds reassembled payloads through
/// the wire parser, correlates queries with responses in the session
/// object store and publishes the matchable fields.
pub struct DnsDriver {
    pub object_pos: u16,
    pub host_pos: u16,
    pub opcode_pos: u16,
    pub qtype_pos: u16,
    pub qclass_pos: u16,
    pub rcode_pos: u16,
    pub tags_pos: u16,
    strict: bool,
    stats: DnsStats,
}

impl DnsDriver {
    pub fn register(registry: &mut FieldRegistry, strict: bool) -> Self {
        let object_pos = registry.register_object("dns", "DNS query/response transactions");

        let host_pos = registry.define(
            "dns",
            FieldKind::StrSet,
            "host",
            "dns.host",
            "Hostnames queried or answered",
            0,
        );
        let opcode_pos = registry.define(
            "dns",
            FieldKind::StrSet,
            "opcode",
            "dns.opcode",
            "DNS opcode",
            0,
        );
        let qtype_pos = registry.define(
            "dns",
            FieldKind::StrSet,
            "query.type",
            "dns.query.type",
            "DNS query type",
            0,
        );
        let qclass_pos = registry.define(
            "dns",
            FieldKind::StrSet,
            "query.class",
            "dns.query.class",
            "DNS query class",
            0,
        );
        let rcode_pos = registry.define(
            "dns",
            FieldKind::StrSet,
            "rcode",
            "dns.rcode",
            "DNS response code",
            0,
        );
        let tags_pos = registry.define(
            "general",
            FieldKind::StrSet,
            "tags",
            "tags",
            "Session tags",
            0,
        );

        // Synthesized names describing the emitted event shape for
        // downstream consumers; they do not back matchable fields.
        for (kind, name, expression, description) in [
            (FieldKind::Int, "cnt", "dns.cnt", "Count of DNS events"),
            (FieldKind::Str, "query.hostname", "dns.query.hostname", "Queried hostname"),
            (FieldKind::Int, "query.packet_uid", "dns.query.packet_uid", "Query packet UID"),
            (FieldKind::Int, "answersCnt", "dns.answersCnt", "Count of answers"),
            (FieldKind::Str, "answers.type", "dns.answers.type", "Answer type"),
            (FieldKind::Str, "answers.class", "dns.answers.class", "Answer class"),
            (FieldKind::Int, "answers.packet_uid", "dns.answers.packet_uid", "Answer packet UID"),
            (FieldKind::Int, "answers.ttl", "dns.answers.ttl", "Answer TTL"),
            (FieldKind::Str, "answers.rdata", "dns.answers.rdata", "Answer RDATA"),
            (FieldKind::Str, "answers.rr_name", "dns.answers.rr_name", "Answer RR name"),
        ] {
            registry.define("dns", kind, name, expression, description, FIELD_FLAG_FAKE);
        }
        registry.define(
            "dns",
            FieldKind::StrSet,
            "answers.flags",
            "dns.answers.flags",
            "Answer header flags",
            FIELD_FLAG_FAKE | FIELD_FLAG_CNT,
        );

        Self {
            object_pos,
            host_pos,
            opcode_pos,
            qtype_pos,
            qclass_pos,
            rcode_pos,
            tags_pos,
            strict,
            stats: DnsStats::default(),
        }
    }

    pub fn stats(&self) -> &DnsStats {
        &self.stats
    }

    pub(crate) fn count_truncated(&self) {
        self.stats.truncated.fetch_add(1, Ordering::Relaxed);
    }

    /// One UDP datagram is one message.
    pub fn udp(
        &self,
        engine: &RulesEngine,
        session: &mut Session,
        payload: &[u8],
        _which: usize,
        dialect: DnsDialect,
    ) {
        self.message(engine, session, dialect, payload);
    }

    /// Runs one reassembled DNS message through parse, correlation and
    /// field publication. Failures never leave partial transactions.
    pub fn message(
        &self,
        engine: &RulesEngine,
        session: &mut Session,
        dialect: DnsDialect,
        data: &[u8],
    ) {
        let msg = match parse_message(data) {
            Ok(msg) => msg,
            Err(MessageError::QuestionCountNot1(_)) => {
                self.stats.policy.fetch_add(1, Ordering::Relaxed);
                engine.set_field(
                    session,
                    self.tags_pos,
                    FieldWrite::Str("dns-qdcount-not-1".into()),
                );
                return;
            }
            Err(MessageError::OpcodeOutOfRange(_)) => {
                self.stats.policy.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(MessageError::TooShort) | Err(MessageError::Malformed(_)) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.stats.parsed.fetch_add(1, Ordering::Relaxed);

        session.add_protocol(dialect.label());

        let query = query_record(
            msg.id,
            msg.opcode,
            msg.question.hostname.clone(),
            msg.question.qtype,
            msg.question.qclass,
        );

        if !msg.response {
            let mut txn = DnsTransaction::new(query);
            txn.query_ts_ms = Some(session.last_packet_ms);
            txn.activity = Activity::QueryOnly;
            if !session
                .objects
                .add(self.object_pos, Box::new(txn), OBJECT_BASE_SIZE)
            {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
            }
            self.publish_fields(engine, session, &msg, false);
            return;
        }

        let rcode_id = msg.rcode as i8;
        let rcode = tables::rcode_name(msg.rcode);
        let answers = build_answers(&msg);
        let estimate = OBJECT_BASE_SIZE
            + OBJECT_RECORD_SIZE * msg.declared_records as usize
            + msg.extra_text_bytes;

        let probe = DnsTransaction::new(query.clone());
        let merged = match session
            .objects
            .find_mut::<DnsTransaction>(self.object_pos, &probe)
        {
            Some(existing) => {
                existing.rcode_id = rcode_id;
                existing.rcode = Some(rcode);
                existing.response_ts_ms = Some(session.last_packet_ms);
                existing.activity = match existing.activity {
                    Activity::QueryOnly | Activity::QueryAndResponse => Activity::QueryAndResponse,
                    Activity::ResponseOnly => Activity::ResponseOnly,
                };
                for answer in answers.iter().cloned() {
                    existing.push_answer(answer, true);
                }
                true
            }
            None => false,
        };

        if merged {
            session
                .objects
                .charge(estimate - OBJECT_BASE_SIZE);
        } else {
            let mut txn = DnsTransaction::new(query);
            txn.rcode_id = rcode_id;
            txn.rcode = Some(rcode);
            txn.response_ts_ms = Some(session.last_packet_ms);
            txn.activity = Activity::ResponseOnly;
            for answer in answers {
                txn.push_answer(answer, false);
            }
            if !session.objects.add(self.object_pos, Box::new(txn), estimate) {
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.publish_fields(engine, session, &msg, true);
    }

    fn publish_fields(
        &self,
        engine: &RulesEngine,
        session: &mut Session,
        msg: &ParsedMessage,
        response: bool,
    ) {
        engine.set_field(
            session,
            self.host_pos,
            FieldWrite::Str(msg.question.hostname.clone()),
        );
        engine.set_field(
            session,
            self.opcode_pos,
            FieldWrite::Str(tables::opcode_name(msg.opcode).to_string()),
        );
        if let Some(qtype) = tables::qtype_name(msg.question.qtype) {
            engine.set_field(session, self.qtype_pos, FieldWrite::Str(qtype.to_string()));
        }
        if let Some(qclass) = tables::qclass_name(msg.question.qclass) {
            engine.set_field(session, self.qclass_pos, FieldWrite::Str(qclass.to_string()));
        }
        if response {
            engine.set_field(
                session,
                self.rcode_pos,
                FieldWrite::Str(tables::rcode_name(msg.rcode).to_string()),
            );
        }
    }

    /// The emitted events for every transaction stored on the session.
    pub fn events(&self, session: &Session, now_ms: u64) -> Vec<serde_json::Value> {
        session
            .objects
            .iter(self.object_pos)
            .filter_map(|object| object.as_any().downcast_ref::<DnsTransaction>())
            .map(|txn| txn.to_event(session, self.strict, now_ms))
            .collect()
    }
}

fn build_answers(msg: &ParsedMessage) -> Vec<DnsAnswer> {
    let mut flags = Vec::new();
    if msg.flags.aa {
        flags.push(tables::FLAG_AA);
    }
    if msg.flags.tc {
        flags.push(tables::FLAG_TC);
    }
    if msg.flags.rd {
        flags.push(tables::FLAG_RD);
    }
    if msg.flags.ra {
        flags.push(tables::FLAG_RA);
    }
    if msg.flags.ad {
        flags.push(tables::FLAG_AD);
    }
    if msg.flags.cd {
        flags.push(tables::FLAG_CD);
    }

    msg.records
        .iter()
        .map(|record| DnsAnswer {
            rr_name: record.name.clone(),
            section: record.section,
            rtype: record.rtype,
            class: tables::qclass_name(record.class),
            type_name: tables::qtype_name(record.rtype),
            ttl: record.ttl,
            packet_uid: msg.id,
            flags: flags.clone(),
            rdata: record.rdata.clone(),
        })
        .collect()
}
