use crate::config::Config;
use crate::dns::{DnsDialect, DnsDriver, DnsTcpParser};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use vigil_rules::{BpfCompiler, LoadError, RulesEngine, SyntheticLists};
use vigil_session::{FieldRegistry, Session};

/// Wires the field registry, the rule engine and the protocol drivers
/// together and exposes the session lifecycle hooks the capture layer
/// invokes. One instance serves every packet worker.
pub struct Pipeline {
    registry: Arc<FieldRegistry>,
    engine: RulesEngine,
    dns: DnsDriver,
    rules_files: Vec<PathBuf>,
    lists: SyntheticLists,
    max_object_bytes: usize,
}

impl Pipeline {
    pub fn new(config: &Config) -> Self {
        let mut registry = FieldRegistry::new();
        let dns = DnsDriver::register(&mut registry, config.ocsf_strict_mode);
        let registry = Arc::new(registry);
        let engine = RulesEngine::new(registry.clone());
        Self {
            registry,
            engine,
            dns,
            rules_files: config.rules_files.clone(),
            lists: SyntheticLists {
                dont_save_bpfs: config.dont_save_bpfs.clone(),
                min_packets_save_bpfs: config.min_packets_save_bpfs.clone(),
            },
            max_object_bytes: config.max_object_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<FieldRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &RulesEngine {
        &self.engine
    }

    pub fn dns(&self) -> &DnsDriver {
        &self.dns
    }

    /// (Re)loads the configured rule files. On error the live rules keep
    /// serving.
    pub fn load_rules(&self, compiler: &dyn BpfCompiler) -> Result<usize, LoadError> {
        let files = vigil_rules::load_paths(&self.rules_files)?;
        self.engine.load(&files, &self.lists, compiler)
    }

    pub fn new_session(
        &self,
        addr1: IpAddr,
        port1: u16,
        addr2: IpAddr,
        port2: u16,
        ip_protocol: u8,
    ) -> Session {
        Session::new(addr1, port1, addr2, port2, ip_protocol)
            .with_object_budget(self.max_object_bytes)
    }

    /// Session creation: the pseudo-field sweep plus the session-setup
    /// rules against the first packet.
    pub fn session_start(&self, session: &mut Session, packet: &[u8]) {
        self.engine.on_session_init(session);
        self.engine.on_session_setup(session, packet);
    }

    pub fn packet(&self, session: &mut Session, packet: &[u8]) {
        self.engine.on_packet(session, packet);
    }

    pub fn after_classify(&self, session: &mut Session) {
        self.engine.on_after_classify(session);
    }

    /// UDP classify callback; the cookie selects the dialect label.
    pub fn dns_udp(&self, session: &mut Session, payload: &[u8], which: usize, cookie: u8) {
        let Some(dialect) = DnsDialect::from_cookie(cookie) else {
            return;
        };
        self.dns.udp(&self.engine, session, payload, which, dialect);
    }

    /// TCP classify callback: registers a stream parser on the first
    /// matching segment of a port-53 session.
    pub fn dns_tcp_classify(&self, session: &mut Session) -> Option<DnsTcpParser> {
        if session.port2 != 53 || session.has_protocol("dns") {
            return None;
        }
        session.add_protocol("dns");
        Some(DnsTcpParser::new())
    }

    pub fn dns_tcp_segment(
        &self,
        parser: &mut DnsTcpParser,
        session: &mut Session,
        data: &[u8],
        which: usize,
    ) {
        parser.segment(&self.dns, &self.engine, session, data, which);
    }

    /// Runs the before-save rules, then returns the session's emitted
    /// events.
    pub fn save(&self, session: &mut Session, final_save: bool) -> Vec<serde_json::Value> {
        self.engine.on_before_save(session, final_save);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.dns.events(session, now_ms)
    }
}
