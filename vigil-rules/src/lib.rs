mod bpf;
mod document;
mod engine;
mod index;
mod loader;
mod matcher;
mod ops;
mod patricia;

pub use bpf::*;
pub use document::*;
pub use engine::*;
pub use index::*;
pub use loader::*;
pub use matcher::*;
pub use ops::*;
pub use patricia::*;
