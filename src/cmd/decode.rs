use vigil::pipeline::Pipeline;
use clap::Args;
use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr};
use vigil_rules::NullBpfCompiler;
use vigil_session::IPPROTO_UDP;

/// Decodes hex-encoded DNS payloads through the full pipeline and prints
/// the emitted events, one JSON document per transaction.
#[derive(Args, Debug)]
pub struct Command {
    /// Hex payloads; with none given, stdin is read line by line.
    payloads: Vec<String>,
    /// Dialect cookie: 0=dns, 1=llmnr, 2=mdns
    #[arg(short, long, default_value = "0")]
    kind: u8,
}

impl Command {
    pub fn run(&self, config: vigil::config::Config) {
        let pipeline = Pipeline::new(&config);
        if !config.rules_files.is_empty() {
            if let Err(error) = pipeline.load_rules(&NullBpfCompiler) {
                eprintln!("{error}");
                std::process::exit(1);
            }
        }

        let mut session = pipeline.new_session(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            3933,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            53,
            IPPROTO_UDP,
        );
        pipeline.session_start(&mut session, &[]);

        let payloads = if self.payloads.is_empty() {
            std::io::stdin()
                .lock()
                .lines()
                .map_while(Result::ok)
                .filter(|line| !line.trim().is_empty())
                .collect()
        } else {
            self.payloads.clone()
        };

        for payload in payloads {
            match from_hex(&payload) {
                Some(bytes) => pipeline.dns_udp(&mut session, &bytes, 0, self.kind),
                None => {
                    eprintln!("not a hex payload: {payload}");
                    std::process::exit(1);
                }
            }
        }
        pipeline.after_classify(&mut session);

        for event in pipeline.save(&mut session, true) {
            println!("{event}");
        }
    }
}

fn from_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        })
        .collect::<Option<_>>()?;
    if digits.len() % 2 != 0 {
        return None;
    }
    Some(
        digits
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect(),
    )
}
