use similar_asserts::assert_eq;
use std::net::{IpAddr, Ipv4Addr};
use vigil::config::Config;
use vigil::pipeline::Pipeline;
use vigil_rules::NullBpfCompiler;
use vigil_session::{FieldValue, Session, IPPROTO_UDP};

fn query_payload(hostname: &str, id: u16) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&id.to_be_bytes());
    data.extend_from_slice(&[0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    for label in hostname.split('.') {
        data.push(label.len() as u8);
        data.extend_from_slice(label.as_bytes());
    }
    data.push(0);
    data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);
    data
}

fn response_payload(hostname: &str, id: u16) -> Vec<u8> {
    let mut data = query_payload(hostname, id);
    data[2] = 0x81;
    data[3] = 0x80;
    data[7] = 0x01; // one answer
    data.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01]);
    data.extend_from_slice(&[0x00, 0x00, 0x0e, 0x10, 0x00, 0x04]);
    data.extend_from_slice(&[0x5d, 0xb8, 0xd8, 0x22]);
    data
}

fn dns_session(pipeline: &Pipeline, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Session {
    let mut session = pipeline.new_session(
        IpAddr::V4(Ipv4Addr::from(src)),
        sport,
        IpAddr::V4(Ipv4Addr::from(dst)),
        dport,
        IPPROTO_UDP,
    );
    session.last_packet_ms = 1_000;
    session
}

fn tags_of(pipeline: &Pipeline, session: &Session) -> Vec<String> {
    match session.field(pipeline.dns().tags_pos) {
        Some(FieldValue::StrSet(tags)) => {
            let mut tags: Vec<String> = tags.iter().cloned().collect();
            tags.sort();
            tags
        }
        _ => Vec::new(),
    }
}

fn write_rules(name: &str, content: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("vigil-test-{name}-{}.yaml", std::process::id()));
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn should_emit_event_for_minimal_a_exchange() {
    let pipeline = Pipeline::new(&Config::default());
    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);

    pipeline.dns_udp(&mut session, &query_payload("www.example.com", 0x1234), 0, 0);
    session.last_packet_ms = 2_000;
    pipeline.dns_udp(&mut session, &response_payload("www.example.com", 0x1234), 1, 0);

    let events = pipeline.save(&mut session, true);
    assert_eq!(events.len(), 1);
    let event = &events[0];

    assert_eq!(event["query"]["opcode_id"], 0);
    assert_eq!(event["query"]["opcode"], "QUERY");
    assert_eq!(event["query"]["packet_uid"], 4660);
    assert_eq!(event["query"]["hostname"], "www.example.com");
    assert_eq!(event["query"]["class"], "IN");
    assert_eq!(event["query"]["type"], "A");
    assert_eq!(event["rcode_id"], 0);
    assert_eq!(event["rcode"], "NOERROR");
    assert_eq!(event["answersCnt"], 1);
    assert_eq!(event["answers"][0]["rdata"], "93.184.216.34");
    assert_eq!(event["answers"][0]["ttl"], 3600);
    assert_eq!(event["answers"][0]["type"], "A");
    assert_eq!(event["answers"][0]["class"], "IN");
    assert!(session.has_protocol("dns"));
}

#[test]
fn should_refuse_compression_pointer_loops() {
    let pipeline = Pipeline::new(&Config::default());
    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);

    // Question name is a pointer chasing itself.
    let mut payload = Vec::new();
    payload.extend_from_slice(&[0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00]);
    payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00]);

    for _ in 0..64 {
        pipeline.dns_udp(&mut session, &payload, 0, 0);
    }
    assert!(pipeline.save(&mut session, true).is_empty());
    assert_eq!(session.objects.used(), 0);
}

#[test]
fn should_reassemble_tcp_identically_to_udp() {
    let pipeline = Pipeline::new(&Config::default());

    let mut udp_session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
    let response = response_payload("www.example.com", 0x1234);
    pipeline.dns_udp(&mut udp_session, &response, 1, 0);
    let udp_events = pipeline.save(&mut udp_session, true);

    let mut tcp_session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
    let mut stream = Vec::new();
    stream.extend_from_slice(&(response.len() as u16).to_be_bytes());
    stream.extend_from_slice(&response);

    let mut parser = pipeline.dns_tcp_classify(&mut tcp_session).unwrap();
    let split = stream.len() / 3;
    pipeline.dns_tcp_segment(&mut parser, &mut tcp_session, &stream[..split], 0);
    assert!(pipeline.save(&mut tcp_session, false).is_empty());
    pipeline.dns_tcp_segment(&mut parser, &mut tcp_session, &stream[split..], 0);

    let tcp_events = pipeline.save(&mut tcp_session, true);
    assert_eq!(udp_events, tcp_events);
}

#[test]
fn should_fire_rule_on_hostname_suffix() {
    let rules = write_rules(
        "suffix",
        r#"
version: 1
rules:
  - name: ads
    when: fieldSet
    fields:
      dns.host,tail: ".ads.example"
    ops:
      tags: ad
"#,
    );
    let config = Config {
        rules_files: vec![rules.clone()],
        ..Config::default()
    };
    let pipeline = Pipeline::new(&config);
    pipeline.load_rules(&NullBpfCompiler).unwrap();

    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
    pipeline.dns_udp(&mut session, &query_payload("trk.ads.example", 7), 0, 0);

    assert_eq!(tags_of(&pipeline, &session), vec!["ad".to_string()]);
    let stats = pipeline.engine().stats();
    assert_eq!(stats[0].name, "ads");
    assert_eq!(stats[0].matched, 1);

    std::fs::remove_file(rules).unwrap();
}

#[test]
fn should_match_cidr_and_port_range_rules() {
    let rules = write_rules(
        "cidr",
        r#"
version: 1
rules:
  - name: internal
    when: sessionSetup
    fields:
      srcIp: "10.0.0.0/8"
      dstPort: "1024-65535"
    ops:
      tags: internal
"#,
    );
    let config = Config {
        rules_files: vec![rules.clone()],
        ..Config::default()
    };
    let pipeline = Pipeline::new(&config);
    pipeline.load_rules(&NullBpfCompiler).unwrap();

    let mut matching = dns_session(&pipeline, [10, 1, 2, 3], 40000, [10, 1, 2, 4], 5555);
    pipeline.session_start(&mut matching, &[]);
    assert_eq!(tags_of(&pipeline, &matching), vec!["internal".to_string()]);

    let mut other = dns_session(&pipeline, [192, 168, 0, 1], 40000, [10, 1, 2, 4], 5555);
    pipeline.session_start(&mut other, &[]);
    assert!(tags_of(&pipeline, &other).is_empty());

    std::fs::remove_file(rules).unwrap();
}

#[test]
fn should_reload_rules_atomically() {
    let rules = write_rules(
        "reload",
        r#"
version: 1
rules:
  - name: ads
    when: fieldSet
    fields:
      dns.host,tail: ".ads.example"
    ops:
      tags: ad
"#,
    );
    let config = Config {
        rules_files: vec![rules.clone()],
        ..Config::default()
    };
    let pipeline = Pipeline::new(&config);
    pipeline.load_rules(&NullBpfCompiler).unwrap();

    // A reload referencing an unknown field fails and must leave the live
    // rules untouched.
    std::fs::write(
        &rules,
        r#"
version: 1
rules:
  - name: broken
    when: fieldSet
    fields:
      no.such.field: x
    ops:
      tags: t
"#,
    )
    .unwrap();
    assert!(pipeline.load_rules(&NullBpfCompiler).is_err());

    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
    pipeline.dns_udp(&mut session, &query_payload("trk.ads.example", 7), 0, 0);
    assert_eq!(tags_of(&pipeline, &session), vec!["ad".to_string()]);

    // A valid reload takes effect for the next event.
    std::fs::write(
        &rules,
        r#"
version: 1
rules:
  - name: trackers
    when: fieldSet
    fields:
      dns.host,head: "trk."
    ops:
      tags: tracker
"#,
    )
    .unwrap();
    pipeline.load_rules(&NullBpfCompiler).unwrap();

    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
    pipeline.dns_udp(&mut session, &query_payload("trk.ads.example", 8), 0, 0);
    assert_eq!(tags_of(&pipeline, &session), vec!["tracker".to_string()]);

    std::fs::remove_file(rules).unwrap();
}

#[test]
fn should_emit_strict_events_with_endpoints() {
    let config = Config {
        ocsf_strict_mode: true,
        ..Config::default()
    };
    let pipeline = Pipeline::new(&config);
    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);

    pipeline.dns_udp(&mut session, &query_payload("www.example.com", 0x1234), 0, 0);
    session.last_packet_ms = 2_000;
    pipeline.dns_udp(&mut session, &response_payload("www.example.com", 0x1234), 1, 0);

    let events = pipeline.save(&mut session, true);
    let event = &events[0];
    assert_eq!(event["category_uid"], 4);
    assert_eq!(event["class_uid"], 4003);
    assert_eq!(event["type_uid"], 400306);
    assert_eq!(event["activity_uid"], 6);
    assert_eq!(event["query_time"], 1000);
    assert_eq!(event["response_time"], 2000);
    assert_eq!(event["src_endpoint"]["ip"], "10.0.0.1");
    assert_eq!(event["dst_endpoint"]["port"], 53);
    assert!(event["answers"][0].get("rr_name").is_none());
}

#[test]
fn should_apply_dont_save_bpf_lists() {
    struct MatchAll;
    struct AlwaysProgram;
    impl vigil_rules::BpfProgram for AlwaysProgram {
        fn matches(&self, _packet: &[u8]) -> bool {
            true
        }
    }
    impl vigil_rules::BpfCompiler for MatchAll {
        fn compile(
            &self,
            _expression: &str,
        ) -> Result<std::sync::Arc<dyn vigil_rules::BpfProgram>, String> {
            Ok(std::sync::Arc::new(AlwaysProgram))
        }
    }

    let config = Config {
        dont_save_bpfs: vec!["port 9999: 7".to_string()],
        ..Config::default()
    };
    let pipeline = Pipeline::new(&config);
    pipeline.load_rules(&MatchAll).unwrap();

    let mut session = dns_session(&pipeline, [10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
    pipeline.session_start(&mut session, b"frame");
    assert_eq!(session.max_packets_to_save, 7);
}
