use crate::bpf::BpfCompiler;
use crate::document::RuleFile;
use crate::index::{FieldMatcher, Rule, RuleSet, Trigger};
use crate::loader::{compile, LoadError, SyntheticLists};
use crate::matcher::HashKey;
use crate::ops::FieldOps;
use crate::patricia::{v4_key, v6_key};
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use vigil_session::{
    community_id, FieldRegistry, FieldValue, FieldWrite, Session, FIELDS_CNT_MIN,
    FIELDS_SPECIAL_START, FIELD_COMMUNITY_ID, FIELD_DATABYTES_DST, FIELD_DATABYTES_SRC,
    FIELD_DST_IP, FIELD_DST_PORT, FIELD_PACKETS_DST, FIELD_PACKETS_SRC, FIELD_SRC_IP,
    FIELD_SRC_PORT, FIELD_TCPFLAGS_ACK, FIELD_TCPFLAGS_FIN, FIELD_TCPFLAGS_PSH,
    FIELD_TCPFLAGS_RST, FIELD_TCPFLAGS_SYN, FIELD_TCPFLAGS_SYN_ACK, FIELD_TCPFLAGS_URG,
    IPPROTO_ESP, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_SCTP, IPPROTO_TCP, IPPROTO_UDP,
    TCPFLAG_ACK, TCPFLAG_FIN, TCPFLAG_PSH, TCPFLAG_RST, TCPFLAG_SYN, TCPFLAG_SYN_ACK,
    TCPFLAG_URG,
};

/// Ops writing to rule-enabled fields re-enter field-set evaluation; this
/// bounds pathological rule graphs.
const MAX_OP_DEPTH: u8 = 8;

/// A field value as the evaluator sees it at a field-set point.
#[derive(Debug, Clone)]
pub enum RuleValue<'a> {
    Int(u64),
    Float(f32),
    Str(&'a str),
    Ip(IpAddr),
}

#[derive(Debug, Clone)]
pub struct RuleStats {
    pub source: String,
    pub name: String,
    pub matched: u64,
}

/// The rule evaluator. Holds the live rule-set generation behind a
/// reader-writer lock; every entry point captures the generation once, so
/// a single event never sees rules from two generations. Replaced
/// generations die when their last in-flight reader drops its handle.
pub struct RulesEngine {
    registry: Arc<FieldRegistry>,
    current: RwLock<Arc<RuleSet>>,
}

impl RulesEngine {
    pub fn new(registry: Arc<FieldRegistry>) -> Self {
        Self {
            registry,
            current: RwLock::new(Arc::new(RuleSet::empty())),
        }
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn current(&self) -> Arc<RuleSet> {
        self.current.read().clone()
    }

    /// Compiles `files` plus the synthetic lists and, only on success,
    /// swaps the result in as the live generation. Returns the number of
    /// loaded rules.
    pub fn load(
        &self,
        files: &[(String, RuleFile)],
        lists: &SyntheticLists,
        compiler: &dyn BpfCompiler,
    ) -> Result<usize, LoadError> {
        let loading = compile(files, lists, &self.registry, compiler)?;
        let count = loading.rule_count();
        *self.current.write() = Arc::new(loading);
        tracing::info!("installed {count} rules");
        Ok(count)
    }

    /// Installs an already-compiled generation.
    pub fn install(&self, set: RuleSet) {
        *self.current.write() = Arc::new(set);
    }

    /// Recompiles every rule's packet filter, e.g. after the link layer
    /// changed. Expressions stay; only the programs are replaced.
    pub fn recompile_bpf(&self, compiler: &dyn BpfCompiler) -> Result<(), LoadError> {
        let set = self.current();
        for rule in set.iter_rules() {
            if let Some(bpf) = rule.bpf.as_ref() {
                let program = compiler.compile(&bpf.expression).map_err(|err| {
                    LoadError::Config {
                        file: rule.source.clone(),
                        message: format!(
                            "Couldn't compile bpf filter '{}': {err}",
                            bpf.expression
                        ),
                    }
                })?;
                bpf.replace(program);
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> Vec<RuleStats> {
        self.current()
            .iter_rules()
            .map(|rule| RuleStats {
                source: rule.source.clone(),
                name: rule.name.clone(),
                matched: rule.matched.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Packet admission: filter-only rules, evaluated per packet.
    pub fn on_packet(&self, session: &mut Session, packet: &[u8]) {
        let set = self.current();
        for rule in set.rules[Trigger::EveryPacket.index()].iter() {
            if let Some(bpf) = rule.bpf.as_ref() {
                if bpf.matches(packet) {
                    self.rule_matched(&set, session, rule, 0);
                }
            }
        }
    }

    /// Field-set sweep over the session pseudo-fields, run once when the
    /// session is created.
    pub fn on_session_init(&self, session: &mut Session) {
        let set = self.current();
        match session.ip_protocol {
            IPPROTO_TCP | IPPROTO_UDP | IPPROTO_SCTP => {
                if self.registry.rule_enabled(FIELD_SRC_PORT) {
                    let value = RuleValue::Int(session.port1 as u64);
                    self.run_field_set(&set, session, FIELD_SRC_PORT, &value, 0);
                }
                if self.registry.rule_enabled(FIELD_DST_PORT) {
                    let value = RuleValue::Int(session.port2 as u64);
                    self.run_field_set(&set, session, FIELD_DST_PORT, &value, 0);
                }
            }
            IPPROTO_ESP | IPPROTO_ICMP | IPPROTO_ICMPV6 => {}
            _ => return,
        }
        if self.registry.rule_enabled(FIELD_SRC_IP) {
            let value = RuleValue::Ip(session.addr1);
            self.run_field_set(&set, session, FIELD_SRC_IP, &value, 0);
        }
        if self.registry.rule_enabled(FIELD_DST_IP) {
            let value = RuleValue::Ip(session.addr2);
            self.run_field_set(&set, session, FIELD_DST_IP, &value, 0);
        }
    }

    pub fn on_session_setup(&self, session: &mut Session, packet: &[u8]) {
        let set = self.current();
        for rule in set.rules[Trigger::SessionSetup.index()].iter() {
            if !rule.fields.is_empty() {
                if self.check_rule_fields(session, rule, None, None) {
                    self.rule_matched(&set, session, rule, 0);
                }
            } else if let Some(bpf) = rule.bpf.as_ref() {
                if bpf.matches(packet) {
                    self.rule_matched(&set, session, rule, 0);
                }
            }
        }
    }

    pub fn on_after_classify(&self, session: &mut Session) {
        let set = self.current();
        for rule in set.rules[Trigger::AfterClassify.index()].iter() {
            if !rule.fields.is_empty() && self.check_rule_fields(session, rule, None, None) {
                self.rule_matched(&set, session, rule, 0);
            }
        }
    }

    pub fn on_before_save(&self, session: &mut Session, final_save: bool) {
        let mask = 1u8 << (final_save as u8);
        let set = self.current();
        for rule in set.rules[Trigger::BeforeSave.index()].iter() {
            if rule.save_flags & mask == 0 {
                continue;
            }
            if !rule.fields.is_empty() && self.check_rule_fields(session, rule, None, None) {
                self.rule_matched(&set, session, rule, 0);
            }
        }
    }

    /// The single funnel for session field writes. Stores the value, then
    /// evaluates the rules indexed under this position for it.
    pub fn set_field(&self, session: &mut Session, pos: u16, value: FieldWrite) {
        let set = self.current();
        self.set_field_inner(&set, session, pos, value, 0);
    }

    fn set_field_inner(
        &self,
        set: &RuleSet,
        session: &mut Session,
        pos: u16,
        value: FieldWrite,
        depth: u8,
    ) {
        let Some(kind) = self.registry.kind(pos) else {
            return;
        };
        let changed = session.write_field(pos, kind, value.clone());
        if !changed || !self.registry.rule_enabled(pos) {
            return;
        }
        let observed = match &value {
            FieldWrite::Int(n) => RuleValue::Int(*n as u64),
            FieldWrite::Float(f) => RuleValue::Float(*f),
            FieldWrite::Str(s) => RuleValue::Str(s.as_str()),
            FieldWrite::Ip(ip) => RuleValue::Ip(*ip),
        };
        self.run_field_set(set, session, pos, &observed, depth);
    }

    fn run_field_set(
        &self,
        set: &RuleSet,
        session: &mut Session,
        pos: u16,
        value: &RuleValue<'_>,
        depth: u8,
    ) {
        match value {
            RuleValue::Ip(ip) => {
                let (is_v4, key) = ip_key(*ip);
                let tree = if is_v4 {
                    set.fields_tree4.get(&pos)
                } else {
                    set.fields_tree6.get(&pos)
                };
                let Some(tree) = tree else { return };
                for (_, _, rules) in tree.search_all(key) {
                    self.run_field_set_rules(set, session, pos, rules, depth);
                }
            }
            other => {
                if let Some(table) = set.fields_match.get(&pos) {
                    match other {
                        RuleValue::Int(n) => {
                            for (range, rules) in table.ranges.iter() {
                                if range.contains(*n) {
                                    self.run_field_set_rules(set, session, pos, rules, depth);
                                }
                            }
                        }
                        RuleValue::Str(s) => {
                            for (affix, rules) in table.affixes.iter() {
                                if affix.matches(s) {
                                    self.run_field_set_rules(set, session, pos, rules, depth);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                if let Some(hash) = set.fields_hash.get(&pos) {
                    let key = match other {
                        RuleValue::Int(n) => HashKey::Int(*n),
                        RuleValue::Float(f) => HashKey::float(*f),
                        RuleValue::Str(s) => HashKey::Str(s.to_string()),
                        RuleValue::Ip(_) => return,
                    };
                    if let Some(rules) = hash.get(&key) {
                        self.run_field_set_rules(set, session, pos, rules, depth);
                    }
                }
            }
        }
    }

    fn run_field_set_rules(
        &self,
        set: &RuleSet,
        session: &mut Session,
        pos: u16,
        rules: &[Arc<Rule>],
        depth: u8,
    ) {
        for rule in rules {
            // A single-field rule already matched through the index lookup.
            if rule.fields.len() == 1 {
                self.rule_matched(set, session, rule, depth);
                continue;
            }
            if self.check_rule_fields(session, rule, Some(pos), None) {
                self.rule_matched(set, session, rule, depth);
            }
        }
    }

    fn rule_matched(&self, set: &RuleSet, session: &mut Session, rule: &Arc<Rule>, depth: u8) {
        if rule.log {
            let mut line = String::new();
            self.check_rule_fields(session, rule, None, Some(&mut line));
            let line = line.trim_end_matches(", ");
            tracing::info!("{} - {} - {}", rule.name, session.pretty(), line);
        }
        rule.matched.fetch_add(1, Ordering::Relaxed);
        self.apply_ops(set, session, &rule.ops, depth);
    }

    fn apply_ops(&self, set: &RuleSet, session: &mut Session, ops: &FieldOps, depth: u8) {
        if depth >= MAX_OP_DEPTH {
            tracing::warn!("rule ops nested deeper than {MAX_OP_DEPTH}, stopping");
            return;
        }
        for op in ops.ops.iter() {
            self.set_field_inner(set, session, op.pos, op.value.to_write(), depth + 1);
        }
    }

    /// AND over the rule's fields, short-circuiting on the first miss.
    /// With `log` set this is a side-effect-free reporting pass instead:
    /// matched values are appended as `expr: value, ` pairs.
    fn check_rule_fields(
        &self,
        session: &Session,
        rule: &Rule,
        skip: Option<u16>,
        mut log: Option<&mut String>,
    ) -> bool {
        let mut flow_hash: Option<Option<String>> = None;
        for &pos in rule.fields.iter() {
            if Some(pos) == skip {
                continue;
            }
            let Some(matcher) = rule.matcher(pos) else {
                return false;
            };
            let ok = if pos >= FIELDS_SPECIAL_START {
                self.check_special(session, pos, matcher, &mut flow_hash, log.as_deref_mut())
            } else if pos >= FIELDS_CNT_MIN {
                let count = session.field_cardinality(pos) as u64;
                self.check_int(pos, matcher, count, log.as_deref_mut())
            } else {
                match session.field(pos) {
                    None => false,
                    Some(value) => self.check_value(pos, matcher, value, log.as_deref_mut()),
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn check_special(
        &self,
        session: &Session,
        pos: u16,
        matcher: &FieldMatcher,
        flow_hash: &mut Option<Option<String>>,
        log: Option<&mut String>,
    ) -> bool {
        match pos {
            FIELD_SRC_IP => self.check_ip(pos, matcher, session.addr1, log),
            FIELD_DST_IP => self.check_ip(pos, matcher, session.addr2, log),
            FIELD_SRC_PORT => self.check_int(pos, matcher, session.port1 as u64, log),
            FIELD_DST_PORT => self.check_int(pos, matcher, session.port2 as u64, log),
            FIELD_TCPFLAGS_SYN => {
                self.check_int(pos, matcher, session.tcp_flag_cnt[TCPFLAG_SYN] as u64, log)
            }
            FIELD_TCPFLAGS_SYN_ACK => self.check_int(
                pos,
                matcher,
                session.tcp_flag_cnt[TCPFLAG_SYN_ACK] as u64,
                log,
            ),
            FIELD_TCPFLAGS_ACK => {
                self.check_int(pos, matcher, session.tcp_flag_cnt[TCPFLAG_ACK] as u64, log)
            }
            FIELD_TCPFLAGS_PSH => {
                self.check_int(pos, matcher, session.tcp_flag_cnt[TCPFLAG_PSH] as u64, log)
            }
            FIELD_TCPFLAGS_RST => {
                self.check_int(pos, matcher, session.tcp_flag_cnt[TCPFLAG_RST] as u64, log)
            }
            FIELD_TCPFLAGS_FIN => {
                self.check_int(pos, matcher, session.tcp_flag_cnt[TCPFLAG_FIN] as u64, log)
            }
            FIELD_TCPFLAGS_URG => {
                self.check_int(pos, matcher, session.tcp_flag_cnt[TCPFLAG_URG] as u64, log)
            }
            FIELD_PACKETS_SRC => self.check_int(pos, matcher, session.packets[0] as u64, log),
            FIELD_PACKETS_DST => self.check_int(pos, matcher, session.packets[1] as u64, log),
            FIELD_DATABYTES_SRC => self.check_int(pos, matcher, session.databytes[0], log),
            FIELD_DATABYTES_DST => self.check_int(pos, matcher, session.databytes[1], log),
            FIELD_COMMUNITY_ID => {
                // Computed at most once per evaluation; several rules can
                // ask for it.
                let id = flow_hash.get_or_insert_with(|| community_id(session));
                match id.as_deref() {
                    None => false,
                    Some(id) => {
                        let hit = matcher.hash.contains(&HashKey::Str(id.to_string()));
                        if hit {
                            if let Some(log) = log {
                                let _ =
                                    write!(log, "{}: {id}, ", self.registry.expression_of(pos));
                            }
                        }
                        hit
                    }
                }
            }
            _ => false,
        }
    }

    fn check_value(
        &self,
        pos: u16,
        matcher: &FieldMatcher,
        value: &FieldValue,
        mut log: Option<&mut String>,
    ) -> bool {
        match value {
            FieldValue::Int(v) => self.check_int(pos, matcher, *v as u64, log),
            FieldValue::IntArray(items) => items
                .iter()
                .any(|v| self.check_int(pos, matcher, *v as u64, log.as_deref_mut())),
            FieldValue::IntSet(items) => items
                .iter()
                .any(|v| self.check_int(pos, matcher, *v as u64, log.as_deref_mut())),
            FieldValue::Float(f) => self.check_float(pos, matcher, *f, log),
            FieldValue::FloatArray(items) => items
                .iter()
                .any(|f| self.check_float(pos, matcher, *f, log.as_deref_mut())),
            FieldValue::Str(s) => self.check_str(pos, matcher, s, log),
            FieldValue::StrArray(items) => items
                .iter()
                .any(|s| self.check_str(pos, matcher, s, log.as_deref_mut())),
            FieldValue::StrSet(items) => items
                .iter()
                .any(|s| self.check_str(pos, matcher, s, log.as_deref_mut())),
            FieldValue::Ip(ip) => self.check_ip(pos, matcher, *ip, log),
            FieldValue::IpSet(items) => items
                .iter()
                .any(|ip| self.check_ip(pos, matcher, *ip, log.as_deref_mut())),
        }
    }

    fn check_int(
        &self,
        pos: u16,
        matcher: &FieldMatcher,
        value: u64,
        log: Option<&mut String>,
    ) -> bool {
        let hit = matcher.hash.contains(&HashKey::Int(value))
            || matcher.ranges.iter().any(|range| range.contains(value));
        if hit {
            if let Some(log) = log {
                let _ = write!(log, "{}: {value}, ", self.registry.expression_of(pos));
            }
        }
        hit
    }

    fn check_float(
        &self,
        pos: u16,
        matcher: &FieldMatcher,
        value: f32,
        log: Option<&mut String>,
    ) -> bool {
        let hit = matcher.hash.contains(&HashKey::float(value));
        if hit {
            if let Some(log) = log {
                let _ = write!(log, "{}: {value}, ", self.registry.expression_of(pos));
            }
        }
        hit
    }

    fn check_str(
        &self,
        pos: u16,
        matcher: &FieldMatcher,
        value: &str,
        log: Option<&mut String>,
    ) -> bool {
        if matcher.hash.contains(&HashKey::Str(value.to_string())) {
            if let Some(log) = log {
                let _ = write!(log, "{}: {value}, ", self.registry.expression_of(pos));
            }
            return true;
        }
        match matcher.affixes.iter().find(|affix| affix.matches(value)) {
            Some(affix) => {
                if let Some(log) = log {
                    let _ = write!(
                        log,
                        "{},{}: {}, ",
                        self.registry.expression_of(pos),
                        affix.kind.label(),
                        affix.pattern()
                    );
                }
                true
            }
            None => false,
        }
    }

    fn check_ip(
        &self,
        pos: u16,
        matcher: &FieldMatcher,
        ip: IpAddr,
        log: Option<&mut String>,
    ) -> bool {
        let (is_v4, key) = ip_key(ip);
        let found = if is_v4 {
            matcher.tree4.search_best(key)
        } else {
            matcher.tree6.search_best(key)
        };
        match found {
            None => false,
            Some((prefix, bitlen, _)) => {
                if let Some(log) = log {
                    let _ = write!(
                        log,
                        "{}: {}/{bitlen}, ",
                        self.registry.expression_of(pos),
                        prefix_display(is_v4, prefix)
                    );
                }
                true
            }
        }
    }
}

fn ip_key(ip: IpAddr) -> (bool, u128) {
    match ip {
        IpAddr::V4(v4) => (true, v4_key(v4)),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => (true, v4_key(v4)),
            None => (false, v6_key(v6)),
        },
    }
}

fn prefix_display(is_v4: bool, prefix: u128) -> String {
    if is_v4 {
        std::net::Ipv4Addr::from((prefix >> 96) as u32).to_string()
    } else {
        std::net::Ipv6Addr::from(prefix).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::RulesEngine;
    use crate::bpf::{BpfCompiler, BpfProgram, NullBpfCompiler};
    use crate::document::RuleFile;
    use crate::loader::SyntheticLists;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use vigil_session::{FieldKind, FieldRegistry, FieldValue, FieldWrite, Session};

    fn registry() -> Arc<FieldRegistry> {
        let mut registry = FieldRegistry::new();
        registry.define("dns", FieldKind::StrSet, "host", "dns.host", "Hostnames", 0);
        registry.define("general", FieldKind::StrSet, "tags", "tags", "Tags", 0);
        registry.define("test", FieldKind::Int, "num", "test.num", "A number", 0);
        Arc::new(registry)
    }

    fn engine_with(registry: Arc<FieldRegistry>, yaml: &str) -> RulesEngine {
        let engine = RulesEngine::new(registry);
        let file: RuleFile = serde_yaml::from_str(yaml).unwrap();
        engine
            .load(
                &[("test.yaml".to_string(), file)],
                &SyntheticLists::default(),
                &NullBpfCompiler,
            )
            .unwrap();
        engine
    }

    fn udp_session(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Session {
        Session::new(
            IpAddr::V4(Ipv4Addr::from(src)),
            sport,
            IpAddr::V4(Ipv4Addr::from(dst)),
            dport,
            17,
        )
    }

    fn tags_of(session: &Session, registry: &FieldRegistry) -> Vec<String> {
        let pos = registry.by_expression("tags").unwrap();
        match session.field(pos) {
            Some(FieldValue::StrSet(items)) => {
                let mut tags: Vec<String> = items.iter().cloned().collect();
                tags.sort();
                tags
            }
            _ => Vec::new(),
        }
    }

    #[test]
    fn should_fire_on_hostname_suffix() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
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
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("trk.ads.example".into()));

        assert_eq!(tags_of(&session, &registry), vec!["ad".to_string()]);
        let stats = engine.stats();
        assert_eq!(stats[0].matched, 1);
    }

    #[test]
    fn should_not_fire_on_other_hostnames() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
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
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("ads.example.org".into()));

        assert!(tags_of(&session, &registry).is_empty());
        assert_eq!(engine.stats()[0].matched, 0);
    }

    #[test]
    fn should_match_ip_range_and_port_range() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: internal-high-ports
    when: sessionSetup
    fields:
      srcIp: "10.0.0.0/8"
      dstPort: "1024-65535"
    ops:
      tags: internal
"#,
        );

        let mut matching = udp_session([10, 1, 2, 3], 40000, [10, 1, 2, 4], 5555);
        engine.on_session_init(&mut matching);
        assert_eq!(tags_of(&matching, &registry), vec!["internal".to_string()]);

        let mut other = udp_session([192, 168, 0, 1], 40000, [10, 1, 2, 4], 5555);
        engine.on_session_init(&mut other);
        assert!(tags_of(&other, &registry).is_empty());
    }

    #[test]
    fn should_evaluate_session_setup_fields() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: resolver
    when: sessionSetup
    fields:
      dstPort: 53
    ops:
      tags: resolver
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        engine.on_session_setup(&mut session, &[]);
        assert_eq!(tags_of(&session, &registry), vec!["resolver".to_string()]);
    }

    #[test]
    fn should_respect_before_save_masks() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: middle-only
    when: beforeMiddleSave
    fields:
      dstPort: 53
    ops:
      tags: middle
  - name: final-only
    when: beforeFinalSave
    fields:
      dstPort: 53
    ops:
      tags: final
  - name: both
    when: beforeBothSave
    fields:
      dstPort: 53
    ops:
      tags: both
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        engine.on_before_save(&mut session, false);
        assert_eq!(
            tags_of(&session, &registry),
            vec!["both".to_string(), "middle".to_string()]
        );
        engine.on_before_save(&mut session, true);
        assert_eq!(
            tags_of(&session, &registry),
            vec!["both".to_string(), "final".to_string(), "middle".to_string()]
        );
    }

    #[test]
    fn should_reenter_field_set_from_ops() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: first
    when: fieldSet
    fields:
      dns.host: "bad.example"
    ops:
      tags: flagged
  - name: second
    when: fieldSet
    fields:
      tags: flagged
    ops:
      test.num: 7
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("bad.example".into()));

        let num_pos = registry.by_expression("test.num").unwrap();
        assert_eq!(session.field(num_pos), Some(&FieldValue::Int(7)));
    }

    #[test]
    fn should_match_count_pseudo_fields() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: two-hosts
    when: beforeFinalSave
    fields:
      dns.host.cnt: 2
    ops:
      tags: busy
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("a.example".into()));
        engine.on_before_save(&mut session, true);
        assert!(tags_of(&session, &registry).is_empty());

        engine.set_field(&mut session, host_pos, FieldWrite::Str("b.example".into()));
        engine.on_before_save(&mut session, true);
        assert_eq!(tags_of(&session, &registry), vec!["busy".to_string()]);
    }

    #[test]
    fn should_keep_previous_rules_when_reload_fails() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
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

        let broken: RuleFile = serde_yaml::from_str(
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
        assert!(engine
            .load(
                &[("broken.yaml".to_string(), broken)],
                &SyntheticLists::default(),
                &NullBpfCompiler
            )
            .is_err());

        // Old generation still live and firing.
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("trk.ads.example".into()));
        assert_eq!(tags_of(&session, &registry), vec!["ad".to_string()]);
    }

    #[test]
    fn should_fire_new_rules_after_successful_reload() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
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

        let replacement: RuleFile = serde_yaml::from_str(
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
        engine
            .load(
                &[("v2.yaml".to_string(), replacement)],
                &SyntheticLists::default(),
                &NullBpfCompiler,
            )
            .unwrap();

        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("trk.ads.example".into()));
        assert_eq!(tags_of(&session, &registry), vec!["tracker".to_string()]);
    }

    struct SubstringCompiler;

    struct SubstringProgram(Vec<u8>);

    impl BpfProgram for SubstringProgram {
        fn matches(&self, packet: &[u8]) -> bool {
            packet
                .windows(self.0.len().max(1))
                .any(|w| w == self.0.as_slice())
        }
    }

    impl BpfCompiler for SubstringCompiler {
        fn compile(&self, expression: &str) -> Result<Arc<dyn BpfProgram>, String> {
            Ok(Arc::new(SubstringProgram(expression.as_bytes().to_vec())))
        }
    }

    #[test]
    fn should_run_bpf_rules_per_packet() {
        let registry = registry();
        let engine = RulesEngine::new(registry.clone());
        let file: RuleFile = serde_yaml::from_str(
            r#"
version: 1
rules:
  - name: marker
    when: everyPacket
    bpf: "XYZ"
    ops:
      tags: marked
"#,
        )
        .unwrap();
        engine
            .load(
                &[("bpf.yaml".to_string(), file)],
                &SyntheticLists::default(),
                &SubstringCompiler,
            )
            .unwrap();

        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        engine.on_packet(&mut session, b"aaXYZbb");
        engine.on_packet(&mut session, b"nothing");
        assert_eq!(tags_of(&session, &registry), vec!["marked".to_string()]);
        assert_eq!(engine.stats()[0].matched, 1);
    }

    #[test]
    fn should_cap_synthetic_rule_ops() {
        let registry = registry();
        let engine = RulesEngine::new(registry.clone());
        engine
            .load(
                &[],
                &SyntheticLists {
                    dont_save_bpfs: vec!["ABC: 4".to_string()],
                    min_packets_save_bpfs: vec![],
                },
                &SubstringCompiler,
            )
            .unwrap();

        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        engine.on_session_setup(&mut session, b"xxABCxx");
        assert_eq!(session.max_packets_to_save, 4);
    }

    #[test]
    fn should_match_community_id_field() {
        let registry = registry();
        let session = udp_session([1, 2, 3, 4], 1122, [5, 6, 7, 8], 3344);
        let id = vigil_session::community_id(&session).unwrap();

        let yaml = format!(
            r#"
version: 1
rules:
  - name: flow
    when: beforeFinalSave
    fields:
      communityId: "{id}"
    ops:
      tags: known-flow
"#
        );
        let engine = engine_with(registry.clone(), &yaml);
        let mut session = session;
        engine.on_before_save(&mut session, true);
        assert_eq!(tags_of(&session, &registry), vec!["known-flow".to_string()]);
    }

    #[test]
    fn should_expose_values_through_rule_value() {
        // Field-set entry used directly, e.g. by parsers publishing values.
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: nums
    when: fieldSet
    fields:
      test.num: 5
    ops:
      tags: five
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        let pos = registry.by_expression("test.num").unwrap();
        engine.set_field(&mut session, pos, FieldWrite::Int(4));
        assert!(tags_of(&session, &registry).is_empty());
        engine.set_field(&mut session, pos, FieldWrite::Int(5));
        assert_eq!(tags_of(&session, &registry), vec!["five".to_string()]);
        assert_eq!(engine.stats()[0].matched, 1);
    }

    #[test]
    fn should_evaluate_after_classify_rules() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: classified
    when: afterClassify
    fields:
      dns.host: "seen.example"
    ops:
      tags: classified
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        engine.on_after_classify(&mut session);
        assert!(tags_of(&session, &registry).is_empty());

        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("seen.example".into()));
        engine.on_after_classify(&mut session);
        assert_eq!(tags_of(&session, &registry), vec!["classified".to_string()]);
    }

    #[test]
    fn should_match_float_fields_by_bit_pattern() {
        let mut registry = FieldRegistry::new();
        registry.define("general", FieldKind::StrSet, "tags", "tags", "Tags", 0);
        registry.define("test", FieldKind::Float, "ratio", "test.ratio", "A ratio", 0);
        let registry = Arc::new(registry);
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: half
    when: fieldSet
    fields:
      test.ratio: "0.5"
    ops:
      tags: half
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 1, [10, 0, 0, 2], 2);
        let pos = registry.by_expression("test.ratio").unwrap();
        engine.set_field(&mut session, pos, FieldWrite::Float(0.25));
        assert!(tags_of(&session, &registry).is_empty());
        engine.set_field(&mut session, pos, FieldWrite::Float(0.5));
        assert_eq!(tags_of(&session, &registry), vec!["half".to_string()]);
    }

    #[test]
    fn should_not_change_outcome_when_logging() {
        let registry = registry();
        let engine = engine_with(
            registry.clone(),
            r#"
version: 1
rules:
  - name: loud
    when: fieldSet
    fields:
      dns.host,tail: ".ads.example"
    ops:
      tags: ad
    log: true
"#,
        );
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        let host_pos = registry.by_expression("dns.host").unwrap();
        engine.set_field(&mut session, host_pos, FieldWrite::Str("trk.ads.example".into()));
        assert_eq!(tags_of(&session, &registry), vec!["ad".to_string()]);
        assert_eq!(engine.stats()[0].matched, 1);
    }

    #[test]
    fn should_recompile_bpf_programs() {
        let registry = registry();
        let engine = RulesEngine::new(registry.clone());
        let file: RuleFile = serde_yaml::from_str(
            r#"
version: 1
rules:
  - name: marker
    when: everyPacket
    bpf: "XYZ"
    ops:
      tags: marked
"#,
        )
        .unwrap();
        engine
            .load(
                &[("bpf.yaml".to_string(), file)],
                &SyntheticLists::default(),
                &NullBpfCompiler,
            )
            .unwrap();

        // Null programs never match.
        let mut session = udp_session([10, 0, 0, 1], 3933, [10, 0, 0, 2], 53);
        engine.on_packet(&mut session, b"aaXYZbb");
        assert!(tags_of(&session, &registry).is_empty());

        engine.recompile_bpf(&SubstringCompiler).unwrap();
        engine.on_packet(&mut session, b"aaXYZbb");
        assert_eq!(tags_of(&session, &registry), vec!["marked".to_string()]);
    }
}
