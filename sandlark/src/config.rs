use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Adapter personality a sandbox is wrapped in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Source,
    Decoder,
    #[default]
    Filter,
    Encoder,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PluginKind::Source => "source",
            PluginKind::Decoder => "decoder",
            PluginKind::Filter => "filter",
            PluginKind::Encoder => "encoder",
        };
        f.write_str(name)
    }
}

/// Opaque per-script configuration value, surfaced through `read_config`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(f64),
    String(String),
}

/// Sandbox creation options. All limits are hard ceilings.
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    pub script_path: PathBuf,
    /// Read-only directory searched by `require` for non-core modules.
    #[serde(default)]
    pub module_directory: Option<PathBuf>,
    /// Interpreter memory ceiling in bytes. 0 disables the ceiling.
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    /// Per-call virtual instruction ceiling. 0 disables the hook.
    #[serde(default = "default_instruction_limit")]
    pub instruction_limit: u64,
    /// Output buffer ceiling in bytes.
    #[serde(default = "default_output_limit")]
    pub output_limit: usize,
    #[serde(default)]
    pub preserve_data: bool,
    #[serde(default)]
    pub plugin_type: PluginKind,
    #[serde(default)]
    pub profile: bool,
    /// IANA zone name, surfaced to the script via `read_config("tz")`.
    #[serde(default)]
    pub tz: Option<String>,
    /// Instruction-hook granularity; the worst-case overrun past the
    /// instruction limit is bounded by this many instructions.
    #[serde(default = "default_instruction_chunk")]
    pub instruction_chunk: u32,
    /// Injection cap per entry-point call. 0 removes the cap, except for
    /// filters: the filter adapter always enforces one and rewrites 0 to
    /// its default with a logged warning.
    #[serde(default = "default_max_inject")]
    pub max_inject_per_call: u32,
    #[serde(default)]
    pub config: HashMap<String, ConfigValue>,
}

impl SandboxConfig {
    pub fn new(script_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            module_directory: None,
            memory_limit: default_memory_limit(),
            instruction_limit: default_instruction_limit(),
            output_limit: default_output_limit(),
            preserve_data: false,
            plugin_type: PluginKind::default(),
            profile: false,
            tz: None,
            instruction_chunk: default_instruction_chunk(),
            max_inject_per_call: default_max_inject(),
            config: HashMap::new(),
        }
    }

    /// Load a sandbox configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading sandbox config {}", path.display()))?;
        let cfg: SandboxConfig = toml::from_str(&contents)
            .with_context(|| format!("parsing sandbox config {}", path.display()))?;
        Ok(cfg)
    }
}

fn default_memory_limit() -> usize {
    8 * 1024 * 1024
}
fn default_instruction_limit() -> u64 {
    1_000_000
}
fn default_output_limit() -> usize {
    64 * 1024
}
fn default_instruction_chunk() -> u32 {
    1000
}
fn default_max_inject() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"script_path = "scripts/counter.lua"
plugin_type = "decoder"

[config]
rows = 1440
label = "per-minute"
strict = true
"#;
        let cfg: SandboxConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.script_path, PathBuf::from("scripts/counter.lua"));
        assert_eq!(cfg.plugin_type, PluginKind::Decoder);
        assert_eq!(cfg.memory_limit, 8 * 1024 * 1024);
        assert_eq!(cfg.instruction_limit, 1_000_000);
        assert_eq!(cfg.output_limit, 64 * 1024);
        assert_eq!(cfg.instruction_chunk, 1000);
        assert_eq!(cfg.max_inject_per_call, 10);
        assert!(!cfg.preserve_data);
        assert!(!cfg.profile);
        assert_eq!(cfg.config.get("rows"), Some(&ConfigValue::Number(1440.0)));
        assert_eq!(
            cfg.config.get("label"),
            Some(&ConfigValue::String("per-minute".into()))
        );
        assert_eq!(cfg.config.get("strict"), Some(&ConfigValue::Bool(true)));
    }

    #[test]
    fn load_reads_overrides_from_disk() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "script_path = \"s.lua\"\nmemory_limit = 32767\ninstruction_limit = 1\npreserve_data = true"
        )
        .unwrap();
        let cfg = SandboxConfig::load(file.path()).unwrap();
        assert_eq!(cfg.memory_limit, 32767);
        assert_eq!(cfg.instruction_limit, 1);
        assert!(cfg.preserve_data);
    }

    #[test]
    fn plugin_kind_display_matches_wire_names() {
        assert_eq!(PluginKind::Source.to_string(), "source");
        assert_eq!(PluginKind::Encoder.to_string(), "encoder");
    }
}
