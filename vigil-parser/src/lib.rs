mod message;
mod name;
mod reader;
mod record;

pub use message::*;
pub use name::*;
pub use reader::*;
pub use record::*;

#[cfg(test)]
mod tests {
    #[test]
    fn should_parse_compressed_response() {
        // Response carrying an A and a CNAME answer, both names compressed.
        let mut data = Vec::new();
        data.extend_from_slice(&[0x9a, 0x01, 0x85, 0x80, 0x00, 0x01, 0x00, 0x02]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        data.extend_from_slice(b"\x03app\x05perdu\x03com\x00");
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
        data.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x05, 0x00, 0x01]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c, 0x00, 0x02, 0xc0, 0x10]);
        data.extend_from_slice(&[0xc0, 0x10, 0x00, 0x01, 0x00, 0x01]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x3c, 0x00, 0x04, 10, 0, 0, 7]);

        let message = crate::parse_message(&data).unwrap();
        assert_eq!(message.question.hostname, "app.perdu.com");
        assert!(message.flags.aa);
        assert_eq!(message.records.len(), 2);
        assert_eq!(
            message.records[0].rdata,
            crate::RData::Cname("perdu.com".into())
        );
        assert_eq!(message.records[1].name, "perdu.com");
    }
}
