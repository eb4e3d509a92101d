use crate::name::{decode_name, ROOT_NAME};
use crate::reader::{ReadError, WireReader};
use crate::record::{RData, RrSection, CLASS_IN};

/// Smallest well-formed message: 12 byte header, 1 byte root name, type and
/// class of the single question.
const MIN_MESSAGE_LEN: usize = 17;

const MAX_OPCODE: u8 = 5;

/// The header flag bits attached to every answer of a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFlags {
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub ad: bool,
    pub cd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub hostname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// One record kept from the answer, authoritative or additional section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRecord {
    pub name: String,
    pub section: RrSection,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

/// A whole decoded message, transport-independent.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub flags: HeaderFlags,
    pub rcode: u8,
    pub question: Question,
    pub records: Vec<WireRecord>,
    /// Record counts declared in the header, which may exceed what was
    /// actually decodable. Used for storage estimates.
    pub declared_records: u32,
    /// Free-form text bytes (TXT, CAA) across the kept records.
    pub extra_text_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    TooShort,
    OpcodeOutOfRange(u8),
    QuestionCountNot1(u16),
    Malformed(ReadError),
}

impl From<ReadError> for MessageError {
    fn from(value: ReadError) -> Self {
        MessageError::Malformed(value)
    }
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageError::TooShort => write!(f, "message below minimum length"),
            MessageError::OpcodeOutOfRange(op) => write!(f, "opcode {op} out of range"),
            MessageError::QuestionCountNot1(qd) => write!(f, "question count {qd} is not 1"),
            MessageError::Malformed(inner) => write!(f, "malformed message: {inner}"),
        }
    }
}

/// Decodes a full DNS message from one reassembled payload.
///
/// Enforces the per-message invariants (`opcode <= 5`, exactly one
/// question). Records that fail to validate are dropped individually; a
/// reader error stops record decoding but keeps the records already
/// decoded. No state outside the returned value is touched.
pub fn parse_message(data: &[u8]) -> Result<ParsedMessage, MessageError> {
    if data.len() < MIN_MESSAGE_LEN {
        return Err(MessageError::TooShort);
    }

    let mut reader = WireReader::new(data);
    let id = reader.read_u16()?;
    let b2 = reader.read_u8()?;
    let b3 = reader.read_u8()?;

    let response = (b2 >> 7) & 0x1 == 1;
    let opcode = (b2 >> 3) & 0xf;
    if opcode > MAX_OPCODE {
        return Err(MessageError::OpcodeOutOfRange(opcode));
    }

    let flags = HeaderFlags {
        aa: (b2 >> 2) & 0x1 == 1,
        tc: (b2 >> 1) & 0x1 == 1,
        rd: b2 & 0x1 == 1,
        ra: (b3 >> 7) & 0x1 == 1,
        ad: (b3 >> 5) & 0x1 == 1,
        cd: (b3 >> 4) & 0x1 == 1,
    };
    let rcode = b3 & 0xf;

    let qd_count = reader.read_u16()?;
    let an_count = reader.read_u16()?;
    let ns_count = reader.read_u16()?;
    let ar_count = reader.read_u16()?;

    if qd_count != 1 {
        return Err(MessageError::QuestionCountNot1(qd_count));
    }

    let mut hostname = String::new();
    decode_name(data, &mut reader, &mut hostname)?;
    if hostname.is_empty() {
        hostname.push_str(ROOT_NAME);
    }
    let qtype = reader.read_u16()?;
    let qclass = reader.read_u16()?;

    let mut message = ParsedMessage {
        id,
        response,
        opcode,
        flags,
        rcode,
        question: Question {
            hostname,
            qtype,
            qclass,
        },
        records: Vec::new(),
        declared_records: an_count as u32 + ns_count as u32 + ar_count as u32,
        extra_text_bytes: 0,
    };

    if !response {
        return Ok(message);
    }

    let sections = [
        (RrSection::Answer, an_count),
        (RrSection::Authoritative, ns_count),
        (RrSection::Additional, ar_count),
    ];

    'sections: for (section, count) in sections {
        for _ in 0..count {
            if reader.is_errored() {
                break 'sections;
            }
            let mut name = String::new();
            if decode_name(data, &mut reader, &mut name).is_err() {
                break 'sections;
            }

            let (rtype, class, ttl, rdlength) = match read_rr_header(&mut reader) {
                Ok(fixed) => fixed,
                Err(_) => break 'sections,
            };
            if reader.remaining() < rdlength {
                break 'sections;
            }

            if class != CLASS_IN {
                let _ = reader.skip(rdlength);
                continue;
            }

            let mut rdata_reader = reader.subreader(rdlength);
            let rdata = RData::decode(rtype, data, &mut rdata_reader);
            let _ = reader.skip(rdlength);

            let Some(rdata) = rdata else { continue };

            if name.is_empty() {
                name.push_str(ROOT_NAME);
            }
            message.extra_text_bytes += rdata.text_len();
            message.records.push(WireRecord {
                name,
                section,
                rtype,
                class,
                ttl,
                rdata,
            });
        }
    }

    Ok(message)
}

fn read_rr_header(reader: &mut WireReader<'_>) -> Result<(u16, u16, u32, usize), ReadError> {
    let rtype = reader.read_u16()?;
    let class = reader.read_u16()?;
    let ttl = reader.read_u32()?;
    let rdlength = reader.read_u16()?;
    Ok((rtype, class, ttl, rdlength as usize))
}
