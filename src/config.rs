use std::path::{Path, PathBuf};

#[derive(Debug, serde::Deserialize)]
pub struct Config {
    /// Emit OCSF-strict DNS activity events instead of the compact shape.
    #[serde(default)]
    pub ocsf_strict_mode: bool,
    /// `<bpf>[: <n>]` entries; matching sessions save at most n packets.
    #[serde(default)]
    pub dont_save_bpfs: Vec<String>,
    /// `<bpf>[: <n>]` entries; matching sessions need n packets before
    /// being saved.
    #[serde(default)]
    pub min_packets_save_bpfs: Vec<String>,
    /// Rule documents, reloaded when they change on disk.
    #[serde(default)]
    pub rules_files: Vec<PathBuf>,
    /// Per-session byte budget for parsed protocol objects.
    #[serde(default = "Config::default_max_object_bytes")]
    pub max_object_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ocsf_strict_mode: false,
            dont_save_bpfs: Vec::new(),
            min_packets_save_bpfs: Vec::new(),
            rules_files: Vec::new(),
            max_object_bytes: Self::default_max_object_bytes(),
        }
    }
}

impl Config {
    fn default_max_object_bytes() -> usize {
        1_000_000
    }

    pub fn load(path: &Path) -> Self {
        let conf = ::config::Config::builder()
            .add_source(::config::File::from(path).required(false))
            .add_source(::config::Environment::default().separator("_"))
            .build()
            .expect("unable to read configuration");
        conf.try_deserialize()
            .expect("configuration format invalid")
    }
}
