use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::read_to_string;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration, usually loaded from a TOML file.
///
/// Every field has a default, an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Value of the owner tag written into every launched process environment.
    pub owner: String,
    /// Interface debug backends are asked to listen on.
    pub host: String,
    pub timeouts: Timeouts,
    pub ports: PortConfig,
    pub reaper: ReaperConfig,
    pub trace: TraceConfig,
    /// Declarative language adapters, keyed by language name.
    pub adapters: HashMap<String, AdapterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner: "aidb".to_string(),
            host: "127.0.0.1".to_string(),
            timeouts: Timeouts::default(),
            ports: PortConfig::default(),
            reaper: ReaperConfig::default(),
            trace: TraceConfig::default(),
            adapters: HashMap::new(),
        }
    }
}

impl Config {
    const DEFAULT_PATH: &'static str = ".config/aidb/config.toml";
    const PATH_ENV: &'static str = "AIDB_CONFIG";

    /// Parse configuration from a TOML string.
    pub fn parse(data: &str) -> Result<Self> {
        let config: Self = toml::de::from_str(data).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but can not work.
    pub fn validate(&self) -> Result<()> {
        if self.reaper.interval_secs == 0 {
            return Err(Error::Config(
                "`reaper.interval_secs` must be at least 1".to_string(),
            ));
        }
        for (language, range) in &self.ports.ranges {
            if range.start >= range.end {
                return Err(Error::Config(format!(
                    "empty port range [{}, {}) for `{language}`",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }

    /// Load configuration.
    ///
    /// Lookup order: `path` argument, `$AIDB_CONFIG`, `~/.config/aidb/config.toml`.
    /// An explicitly given file must exist, a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(Self::PATH_ENV).map(PathBuf::from));

        match explicit {
            Some(path) => {
                let data = read_to_string(&path)
                    .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
                Self::parse(&data)
            }
            None => {
                let Some(home) = home::home_dir() else {
                    return Ok(Self::default());
                };
                match read_to_string(home.join(Self::DEFAULT_PATH)) {
                    Ok(data) => Self::parse(&data),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
                    Err(e) => Err(Error::Config(e.to_string())),
                }
            }
        }
    }
}

/// Bounded waits, all values are in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub request: u64,
    pub connect: u64,
    pub initialized_event: u64,
    pub launch_response: u64,
    pub disconnect: u64,
    pub process_stop: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request: 10_000,
            connect: 10_000,
            initialized_event: 5_000,
            launch_response: 10_000,
            disconnect: 2_000,
            process_stop: 5_000,
        }
    }
}

impl Timeouts {
    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect)
    }

    pub fn initialized_event(&self) -> Duration {
        Duration::from_millis(self.initialized_event)
    }

    pub fn launch_response(&self) -> Duration {
        Duration::from_millis(self.launch_response)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect)
    }

    pub fn process_stop(&self) -> Duration {
        Duration::from_millis(self.process_stop)
    }
}

/// Half-open port range `[start, end)`, written as a two element array in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u16, u16)", into = "(u16, u16)")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn iter(&self) -> Range<u16> {
        self.start..self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        self.iter().contains(&port)
    }
}

impl From<(u16, u16)> for PortRange {
    fn from((start, end): (u16, u16)) -> Self {
        Self { start, end }
    }
}

impl From<PortRange> for (u16, u16) {
    fn from(r: PortRange) -> Self {
        (r.start, r.end)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PortConfig {
    /// Coordinate ports with other engine instances through the on-disk registry.
    pub shared_registry: bool,
    /// Directory holding the shared port registry and its lock file,
    /// `$TMPDIR/aidb` when not set.
    pub registry_dir: Option<PathBuf>,
    /// Per-language fallback ranges, override adapter defaults.
    pub ranges: HashMap<String, PortRange>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            shared_registry: true,
            registry_dir: None,
            ranges: HashMap::new(),
        }
    }
}

impl PortConfig {
    /// Directory of the shared registry, `None` when sharing is off.
    pub fn registry_dir(&self) -> Option<PathBuf> {
        if !self.shared_registry {
            return None;
        }
        Some(
            self.registry_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("aidb")),
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Processes younger than this are never treated as orphans.
    pub min_age_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            min_age_secs: 60,
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn min_age(&self) -> Duration {
        Duration::from_secs(self.min_age_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceConfig {
    /// Trace DAP traffic into `log_file`.
    pub dap: bool,
    pub log_file: Option<PathBuf>,
}

/// How a backend speaks DAP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Stdio,
}

/// Hit-condition operators a backend accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitConditionSupport {
    /// Only exact counts (`5`, `==5`).
    Exact,
    /// Comparison and modulo operators.
    #[default]
    Full,
}

/// Declarative adapter description, see [`crate::adapter::TemplateAdapter`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    /// Command line template, `{host}`, `{port}` and `{program}` are substituted.
    pub command: Vec<String>,
    /// `adapterID` sent in `initialize`, the language name when not set.
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub fallback_ports: Option<PortRange>,
    #[serde(default)]
    pub hit_conditions: HitConditionSupport,
    #[serde(default = "default_true")]
    pub wait_for_initialized: bool,
    #[serde(default)]
    pub process_pattern: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}
