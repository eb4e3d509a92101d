use parking_lot::RwLock;
use std::sync::Arc;

/// A compiled packet filter program. Compilation lives outside this crate;
/// the capture backend supplies a compiler matching its link layer.
pub trait BpfProgram: Send + Sync {
    fn matches(&self, packet: &[u8]) -> bool;
}

pub trait BpfCompiler {
    fn compile(&self, expression: &str) -> Result<Arc<dyn BpfProgram>, String>;
}

/// A rule's filter: the expression survives reloads of the compiled program
/// when the link layer changes.
pub struct RuleBpf {
    pub expression: String,
    program: RwLock<Arc<dyn BpfProgram>>,
}

impl std::fmt::Debug for RuleBpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleBpf")
            .field("expression", &self.expression)
            .finish()
    }
}

impl RuleBpf {
    pub fn new(expression: String, program: Arc<dyn BpfProgram>) -> Self {
        Self {
            expression,
            program: RwLock::new(program),
        }
    }

    pub fn matches(&self, packet: &[u8]) -> bool {
        self.program.read().matches(packet)
    }

    pub fn replace(&self, program: Arc<dyn BpfProgram>) {
        *self.program.write() = program;
    }
}

struct NullProgram;

impl BpfProgram for NullProgram {
    fn matches(&self, _packet: &[u8]) -> bool {
        false
    }
}

/// Accepts every expression and matches no packet. Used when no capture
/// backend is wired in, so rule files referencing filters still validate.
pub struct NullBpfCompiler;

impl BpfCompiler for NullBpfCompiler {
    fn compile(&self, _expression: &str) -> Result<Arc<dyn BpfProgram>, String> {
        Ok(Arc::new(NullProgram))
    }
}
