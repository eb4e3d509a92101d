use crate::session::{Session, IPPROTO_ICMP, IPPROTO_ICMPV6};
use sha1::{Digest, Sha1};
use std::net::IpAddr;

const SEED: u16 = 0;

fn addr_bytes(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Community ID v1 flow hash for this session, shared with other network
/// tools so that rules can pivot on a common key. Undefined for ICMP.
pub fn community_id(session: &Session) -> Option<String> {
    if session.ip_protocol == IPPROTO_ICMP || session.ip_protocol == IPPROTO_ICMPV6 {
        return None;
    }

    let src = addr_bytes(&session.addr1);
    let dst = addr_bytes(&session.addr2);

    // Endpoints are ordered so both directions hash identically.
    let flipped = match src.cmp(&dst) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Equal => session.port1 > session.port2,
        std::cmp::Ordering::Less => false,
    };
    let (a, a_port, b, b_port) = if flipped {
        (&dst, session.port2, &src, session.port1)
    } else {
        (&src, session.port1, &dst, session.port2)
    };

    let mut bytes = Vec::with_capacity(2 + a.len() + b.len() + 8);
    bytes.extend_from_slice(&SEED.to_be_bytes());
    bytes.extend_from_slice(a);
    bytes.extend_from_slice(b);
    bytes.push(session.ip_protocol);
    bytes.push(0);
    bytes.extend_from_slice(&a_port.to_be_bytes());
    bytes.extend_from_slice(&b_port.to_be_bytes());

    let digest = Sha1::new().chain_update(&bytes).finalize();
    Some(format!("1:{}", base64::encode(digest)))
}
