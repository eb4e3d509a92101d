use crate::reader::{ReadError, WireReader};

/// Placeholder for an empty (root) domain name.
pub const ROOT_NAME: &str = "<root>";

/// Compression pointer chains longer than this abort decoding.
pub const MAX_POINTER_JUMPS: usize = 6;

/// Wire-format names are capped at 255 bytes; anything longer is hostile.
const MAX_WIRE_NAME: usize = 255;

enum Cursor {
    /// Still consuming from the caller's reader.
    Stream,
    /// Jumped through a compression pointer; reading message bytes directly.
    Absolute(usize),
}

/// Decodes a possibly-compressed domain name into `out` as dotted labels.
///
/// `message` is the full DNS message, used to resolve compression pointers;
/// `reader` is positioned at the name and is advanced past it (past the first
/// pointer if one occurs). Bytes are sanitized: non-ASCII bytes come out as
/// `M-` plus their low 7 bits, non-printable bytes are XOR-ed with 0x40 and
/// prefixed with `^`. The empty name decodes to an empty `out`; callers
/// substitute [`ROOT_NAME`] where a display form is needed.
pub fn decode_name(
    message: &[u8],
    reader: &mut WireReader<'_>,
    out: &mut String,
) -> Result<(), ReadError> {
    let mut cursor = Cursor::Stream;
    let mut jumps = 0;
    let mut wire_len = 0;

    loop {
        let len = read_byte(message, reader, &mut cursor)?;

        if len == 0 {
            return Ok(());
        }

        if (len & 0xc0) == 0xc0 {
            if jumps >= MAX_POINTER_JUMPS {
                return Err(ReadError::TooManyJumps(MAX_POINTER_JUMPS));
            }
            jumps += 1;
            let second = read_byte(message, reader, &mut cursor)?;
            let target = (((len & 0x3f) as usize) << 8) | second as usize;
            cursor = Cursor::Absolute(target);
            continue;
        }

        wire_len += len as usize + 1;
        if wire_len > MAX_WIRE_NAME {
            return Err(ReadError::NameTooLong);
        }

        if !out.is_empty() {
            out.push('.');
        }
        for _ in 0..len {
            let mut byte = read_byte(message, reader, &mut cursor)?;
            if !byte.is_ascii() {
                out.push_str("M-");
                byte &= 0x7f;
            }
            if !(0x20..=0x7e).contains(&byte) {
                out.push('^');
                byte ^= 0x40;
            }
            out.push(byte as char);
        }
    }
}

fn read_byte(
    message: &[u8],
    reader: &mut WireReader<'_>,
    cursor: &mut Cursor,
) -> Result<u8, ReadError> {
    match cursor {
        Cursor::Stream => reader.read_u8(),
        Cursor::Absolute(pos) => {
            let byte = message.get(*pos).copied().ok_or(ReadError::EndOfBuffer)?;
            *pos += 1;
            Ok(byte)
        }
    }
}
