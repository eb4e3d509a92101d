use super::DnsDriver;
use vigil_rules::RulesEngine;
use vigil_session::Session;

/// The UDP dialects sharing the DNS wire format, told apart by their
/// well-known ports and recorded as protocol labels on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsDialect {
    Dns,
    Llmnr,
    Mdns,
}

impl DnsDialect {
    pub fn label(self) -> &'static str {
        match self {
            DnsDialect::Dns => "dns",
            DnsDialect::Llmnr => "llmnr",
            DnsDialect::Mdns => "mdns",
        }
    }

    pub fn from_port(port: u16) -> Option<Self> {
        match port {
            53 => Some(DnsDialect::Dns),
            5355 => Some(DnsDialect::Llmnr),
            5353 => Some(DnsDialect::Mdns),
            _ => None,
        }
    }

    /// The classify cookie as handed over by the capture layer.
    pub fn from_cookie(cookie: u8) -> Option<Self> {
        match cookie {
            0 => Some(DnsDialect::Dns),
            1 => Some(DnsDialect::Llmnr),
            2 => Some(DnsDialect::Mdns),
            _ => None,
        }
    }
}

/// Anything shorter can not hold a header and one question.
const MIN_TCP_MESSAGE: usize = 18;

const MIN_REASSEMBLY_BUFFER: usize = 1024;

/// Per-session TCP reassembly for length-prefixed DNS messages, one buffer
/// per direction. Malformed streams kill their direction (or the whole
/// parser for impossible lengths); well-formed streams always make
/// progress. Buffered state never exceeds the declared message length.
#[derive(Default)]
pub struct DnsTcpParser {
    buffers: [Vec<u8>; 2],
    need: [usize; 2],
    dead: [bool; 2],
}

impl DnsTcpParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dead(&self, which: usize) -> bool {
        self.dead[which & 1]
    }

    pub fn segment(
        &mut self,
        driver: &DnsDriver,
        engine: &RulesEngine,
        session: &mut Session,
        data: &[u8],
        which: usize,
    ) {
        let which = which & 1;
        if self.dead[which] {
            return;
        }
        let mut data = data;
        loop {
            if self.need[which] == 0 {
                if data.is_empty() {
                    return;
                }
                if data.len() < 2 {
                    // Can not even read the length prefix; this side of the
                    // stream is beyond recovery.
                    self.dead[which] = true;
                    driver.count_truncated();
                    return;
                }
                let declared = ((data[0] as usize) << 8) | data[1] as usize;
                if declared < MIN_TCP_MESSAGE {
                    self.dead = [true, true];
                    driver.count_truncated();
                    return;
                }
                if declared <= data.len() - 2 {
                    driver.message(engine, session, DnsDialect::Dns, &data[2..2 + declared]);
                    data = &data[2 + declared..];
                    continue;
                }
                let buffer = &mut self.buffers[which];
                buffer.clear();
                buffer.reserve(declared.max(MIN_REASSEMBLY_BUFFER));
                buffer.extend_from_slice(&data[2..]);
                self.need[which] = declared;
                return;
            }

            let missing = self.need[which] - self.buffers[which].len();
            if missing > data.len() {
                self.buffers[which].extend_from_slice(data);
                return;
            }
            self.buffers[which].extend_from_slice(&data[..missing]);
            data = &data[missing..];
            self.need[which] = 0;
            let body = std::mem::take(&mut self.buffers[which]);
            driver.message(engine, session, DnsDialect::Dns, &body);
            self.buffers[which] = body;
            self.buffers[which].clear();
        }
    }
}
