/// Presentation names for the DNS numerology. Type ids are authoritative
/// everywhere; these tables only supply display strings, and unknown ids
/// simply have no name.
pub fn qclass_name(id: u16) -> Option<&'static str> {
    match id {
        1 => Some("IN"),
        2 => Some("CS"),
        3 => Some("CH"),
        4 => Some("HS"),
        255 => Some("ANY"),
        _ => None,
    }
}

// http://en.wikipedia.org/wiki/List_of_DNS_record_types
pub fn qtype_name(id: u16) -> Option<&'static str> {
    match id {
        1 => Some("A"),
        2 => Some("NS"),
        3 => Some("MD"),
        4 => Some("MF"),
        5 => Some("CNAME"),
        6 => Some("SOA"),
        7 => Some("MB"),
        8 => Some("MG"),
        9 => Some("MR"),
        10 => Some("NULL"),
        11 => Some("WKS"),
        12 => Some("PTR"),
        13 => Some("HINFO"),
        14 => Some("MINFO"),
        15 => Some("MX"),
        16 => Some("TXT"),
        17 => Some("RP"),
        18 => Some("AFSDB"),
        19 => Some("X25"),
        20 => Some("ISDN"),
        21 => Some("RT"),
        22 => Some("NSAP"),
        23 => Some("NSAPPTR"),
        24 => Some("SIG"),
        25 => Some("KEY"),
        26 => Some("PX"),
        27 => Some("GPOS"),
        28 => Some("AAAA"),
        29 => Some("LOC"),
        30 => Some("NXT"),
        31 => Some("EID"),
        32 => Some("NIMLOC"),
        33 => Some("SRV"),
        34 => Some("ATMA"),
        35 => Some("NAPTR"),
        36 => Some("KX"),
        37 => Some("CERT"),
        38 => Some("A6"),
        39 => Some("DNAME"),
        40 => Some("SINK"),
        41 => Some("OPT"),
        42 => Some("APL"),
        43 => Some("DS"),
        44 => Some("SSHFP"),
        46 => Some("RRSIG"),
        47 => Some("NSEC"),
        48 => Some("DNSKEY"),
        49 => Some("DHCID"),
        50 => Some("NSEC3"),
        51 => Some("NSEC3PARAM"),
        52 => Some("TLSA"),
        55 => Some("HIP"),
        99 => Some("SPF"),
        249 => Some("TKEY"),
        250 => Some("TSIG"),
        252 => Some("AXFR"),
        253 => Some("MAILB"),
        254 => Some("MAILA"),
        255 => Some("ANY"),
        257 => Some("CAA"),
        _ => None,
    }
}

const RCODES: [&str; 16] = [
    "NOERROR", "FORMERR", "SERVFAIL", "NXDOMAIN", "NOTIMPL", "REFUSED", "YXDOMAIN", "YXRRSET",
    "NXRRSET", "NOTAUTH", "NOTZONE", "DSOTYPENI", "12", "13", "14", "15",
];

pub fn rcode_name(id: u8) -> &'static str {
    RCODES[(id & 0xf) as usize]
}

const OPCODES: [&str; 6] = ["QUERY", "IQUERY", "STATUS", "3", "NOTIFY", "UPDATE"];

pub fn opcode_name(id: u8) -> &'static str {
    OPCODES.get(id as usize).copied().unwrap_or("UNKNOWN")
}

pub const FLAG_AA: &str = "AUTHORITATIVE ANSWER";
pub const FLAG_TC: &str = "TRUNCATED RESPONSE";
pub const FLAG_RD: &str = "RECURSION DESIRED";
pub const FLAG_RA: &str = "RECURSION AVAILABLE";
pub const FLAG_AD: &str = "AUTHENTIC DATA";
pub const FLAG_CD: &str = "CHECKING DISABLED";
