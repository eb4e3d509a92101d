#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadError {
    EndOfBuffer,
    TooManyJumps(usize),
    NameTooLong,
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::EndOfBuffer => write!(f, "reading out of buffer"),
            ReadError::TooManyJumps(max) => write!(f, "too many jumps when reading: {max}"),
            ReadError::NameTooLong => write!(f, "name exceeds wire-format limit"),
        }
    }
}

impl From<ReadError> for std::io::Error {
    fn from(value: ReadError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, value.to_string())
    }
}

/// A bounded, non-owning cursor over a byte range.
///
/// All multi-byte reads are big-endian. Once any read runs past the end the
/// reader becomes sticky-errored: every later operation fails immediately,
/// so callers only need to check once at a convenient point.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    errored: bool,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            errored: false,
        }
    }

    pub fn remaining(&self) -> usize {
        if self.errored {
            0
        } else {
            self.data.len() - self.pos
        }
    }

    pub fn is_errored(&self) -> bool {
        self.errored
    }

    fn fail(&mut self) -> ReadError {
        self.errored = true;
        ReadError::EndOfBuffer
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        if self.remaining() < 1 {
            return Err(self.fail());
        }
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        let high = self.read_u8()? as u16;
        let low = self.read_u8()? as u16;
        Ok((high << 8) | low)
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        let high = self.read_u16()? as u32;
        let low = self.read_u16()? as u32;
        Ok((high << 16) | low)
    }

    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ReadError> {
        if self.remaining() < len {
            return Err(self.fail());
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ReadError> {
        if self.remaining() < len {
            return Err(self.fail());
        }
        self.pos += len;
        Ok(())
    }

    /// An independent cursor over the next `len` bytes. The parent does not
    /// advance; callers `skip(len)` the parent once done with the subrange.
    pub fn subreader(&mut self, len: usize) -> WireReader<'a> {
        if self.remaining() < len {
            self.errored = true;
            return WireReader {
                data: &[],
                pos: 0,
                errored: true,
            };
        }
        WireReader::new(&self.data[self.pos..self.pos + len])
    }
}
