use crate::name::decode_name;
use crate::reader::WireReader;

pub const RR_TYPE_A: u16 = 1;
pub const RR_TYPE_NS: u16 = 2;
pub const RR_TYPE_CNAME: u16 = 5;
pub const RR_TYPE_MX: u16 = 15;
pub const RR_TYPE_TXT: u16 = 16;
pub const RR_TYPE_AAAA: u16 = 28;
pub const RR_TYPE_CAA: u16 = 257;

pub const CLASS_IN: u16 = 1;

/// Which answer section a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrSection {
    Answer,
    Authoritative,
    Additional,
}

impl RrSection {
    pub fn label(&self) -> &'static str {
        match self {
            RrSection::Answer => "Answer",
            RrSection::Authoritative => "Authoritative",
            RrSection::Additional => "Additional",
        }
    }
}

/// Decoded rdata for the record types the pipeline understands.
///
/// A records keep the wire bytes packed low-to-high into a `u32` so that
/// emitting byte 0 first reconstructs the dotted quad on any host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RData {
    A(u32),
    Aaaa([u8; 16]),
    Ns(String),
    Cname(String),
    Mx { preference: u16, exchange: String },
    Txt(Vec<u8>),
    Caa { flags: u8, tag: String, value: String },
}

impl RData {
    /// Bytes of free-form text carried by this rdata, used when estimating
    /// the storage footprint of a transaction.
    pub fn text_len(&self) -> usize {
        match self {
            RData::Txt(text) => text.len(),
            RData::Caa { tag, value, .. } => tag.len() + value.len(),
            _ => 0,
        }
    }

    /// Decodes the rdata of a single record. `rdata` covers exactly
    /// `rdlength` bytes; `message` is the enclosing DNS message for
    /// compression pointer targets. Returns `None` for record types the
    /// pipeline does not keep and for records whose rdata does not validate
    /// against its declared length; either way the caller moves on to the
    /// next record.
    pub fn decode(rtype: u16, message: &[u8], rdata: &mut WireReader<'_>) -> Option<RData> {
        let rdlength = rdata.remaining();
        match rtype {
            RR_TYPE_A => {
                if rdlength != 4 {
                    return None;
                }
                let bytes = rdata.read_slice(4).ok()?;
                let packed = (bytes[3] as u32) << 24
                    | (bytes[2] as u32) << 16
                    | (bytes[1] as u32) << 8
                    | bytes[0] as u32;
                Some(RData::A(packed))
            }
            RR_TYPE_AAAA => {
                if rdlength != 16 {
                    return None;
                }
                let bytes = rdata.read_slice(16).ok()?;
                let mut addr = [0u8; 16];
                addr.copy_from_slice(bytes);
                Some(RData::Aaaa(addr))
            }
            RR_TYPE_NS => read_rdata_name(message, rdata).map(RData::Ns),
            RR_TYPE_CNAME => read_rdata_name(message, rdata).map(RData::Cname),
            RR_TYPE_MX => {
                let preference = rdata.read_u16().ok()?;
                let exchange = read_rdata_name(message, rdata)?;
                Some(RData::Mx {
                    preference,
                    exchange,
                })
            }
            RR_TYPE_TXT => {
                let len = rdata.read_u8().ok()?;
                let text = rdata.read_slice(len as usize).ok()?;
                Some(RData::Txt(text.to_vec()))
            }
            RR_TYPE_CAA => {
                if rdlength < 3 {
                    return None;
                }
                let flags = rdata.read_u8().ok()?;
                let tag_len = rdata.read_u8().ok()? as usize;
                if tag_len + 2 > rdlength {
                    return None;
                }
                let tag = rdata.read_slice(tag_len).ok()?;
                let value = rdata.read_slice(rdlength - tag_len - 2).ok()?;
                Some(RData::Caa {
                    flags,
                    tag: String::from_utf8_lossy(tag).into_owned(),
                    value: String::from_utf8_lossy(value).into_owned(),
                })
            }
            _ => None,
        }
    }
}

fn read_rdata_name(message: &[u8], rdata: &mut WireReader<'_>) -> Option<String> {
    let mut name = String::new();
    decode_name(message, rdata, &mut name).ok()?;
    if name.is_empty() {
        name.push_str(crate::name::ROOT_NAME);
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::{RData, RR_TYPE_A, RR_TYPE_CAA, RR_TYPE_MX, RR_TYPE_TXT};
    use crate::reader::WireReader;

    fn decode(rtype: u16, message: &[u8], rdata: &[u8]) -> Option<RData> {
        let mut reader = WireReader::new(rdata);
        RData::decode(rtype, message, &mut reader)
    }

    #[test]
    fn should_pack_a_record_in_wire_order() {
        let decoded = decode(RR_TYPE_A, &[], &[93, 184, 216, 34]).unwrap();
        match decoded {
            RData::A(packed) => {
                assert_eq!(packed & 0xff, 93);
                assert_eq!((packed >> 8) & 0xff, 184);
                assert_eq!((packed >> 16) & 0xff, 216);
                assert_eq!((packed >> 24) & 0xff, 34);
            }
            other => panic!("unexpected rdata: {other:?}"),
        }
    }

    #[test]
    fn should_refuse_a_record_with_bad_length() {
        assert!(decode(RR_TYPE_A, &[], &[1, 2, 3]).is_none());
        assert!(decode(RR_TYPE_A, &[], &[1, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn should_decode_mx() {
        let rdata = b"\x00\x0a\x04mail\x07example\x03com\x00";
        let decoded = decode(RR_TYPE_MX, rdata, rdata).unwrap();
        assert_eq!(
            decoded,
            RData::Mx {
                preference: 10,
                exchange: "mail.example.com".into()
            }
        );
    }

    #[test]
    fn should_truncate_txt_to_first_string() {
        let rdata = b"\x05hello\x05world";
        let decoded = decode(RR_TYPE_TXT, &[], rdata).unwrap();
        assert_eq!(decoded, RData::Txt(b"hello".to_vec()));
    }

    #[test]
    fn should_refuse_txt_with_overlong_length_byte() {
        let rdata = b"\x20abc";
        assert!(decode(RR_TYPE_TXT, &[], rdata).is_none());
    }

    #[test]
    fn should_decode_caa() {
        let rdata = b"\x00\x05issueletsencrypt.org";
        let decoded = decode(RR_TYPE_CAA, &[], rdata).unwrap();
        assert_eq!(
            decoded,
            RData::Caa {
                flags: 0,
                tag: "issue".into(),
                value: "letsencrypt.org".into()
            }
        );
    }

    #[test]
    fn should_allow_caa_with_empty_value() {
        let rdata = b"\x80\x01a";
        let decoded = decode(RR_TYPE_CAA, &[], rdata).unwrap();
        assert_eq!(
            decoded,
            RData::Caa {
                flags: 0x80,
                tag: "a".into(),
                value: String::new()
            }
        );
    }

    #[test]
    fn should_refuse_caa_shorter_than_header() {
        assert!(decode(RR_TYPE_CAA, &[], &[0, 1]).is_none());
        // tag length pointing past rdlength
        assert!(decode(RR_TYPE_CAA, &[], &[0, 9, b'a']).is_none());
    }

    #[test]
    fn should_decode_empty_rdata_name_as_root() {
        let rdata = b"\x00";
        let decoded = decode(super::RR_TYPE_NS, rdata, rdata).unwrap();
        assert_eq!(decoded, RData::Ns(crate::name::ROOT_NAME.into()));
    }

    #[test]
    fn should_skip_unknown_types() {
        assert!(decode(999, &[], &[1, 2, 3, 4]).is_none());
    }
}
