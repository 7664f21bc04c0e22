//! Configuration types for the VPN blocker.

use ipnet::IpNet;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_yaml::{Mapping, Value};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Placeholder API key written by `--print-config` and older configs.
pub const PLACEHOLDER_API_KEY: &str = "YOUR_API_KEY_HERE";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub settings: Settings,

    /// IPHub classification source.
    #[serde(default)]
    pub iphub: IpHubConfig,

    /// Persistent cache.
    #[serde(default)]
    pub store: StoreConfig,

    /// In-process cache.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Addresses and identities that are never checked.
    #[serde(default)]
    pub overrides: OverrideConfig,
}

/// Global settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Master enable/disable switch.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether flagged players are only reported or also enforced against.
    #[serde(default)]
    pub mode: EnforcementMode,

    /// Log flagged players at info level.
    #[serde(default = "default_true")]
    pub log_flagged: bool,

    /// Log clean players at info level.
    #[serde(default)]
    pub log_clean: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: EnforcementMode::default(),
            log_flagged: true,
            log_clean: false,
        }
    }
}

/// What happens when a player resolves as flagged.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Notify only.
    #[default]
    Monitor,
    /// Notify and invoke the enforcement callback.
    Enforce,
}

impl EnforcementMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementMode::Monitor => "monitor",
            EnforcementMode::Enforce => "enforce",
        }
    }
}

impl std::fmt::Display for EnforcementMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnforcementMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "monitor" | "1" => Ok(EnforcementMode::Monitor),
            "enforce" | "0" => Ok(EnforcementMode::Enforce),
            other => Err(format!("unknown mode '{}', expected monitor or enforce", other)),
        }
    }
}

// Accepts the names and the legacy numeric values (`1` monitor, `0` enforce),
// quoted or not.
impl<'de> Deserialize<'de> for EnforcementMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawMode {
            Name(String),
            Number(u64),
        }

        let raw = match RawMode::deserialize(deserializer)? {
            RawMode::Name(name) => name,
            RawMode::Number(n) => n.to_string(),
        };
        raw.parse().map_err(de::Error::custom)
    }
}

/// IPHub provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpHubConfig {
    /// Enable IPHub lookups. When disabled every lookup fails open.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API key (supports ${ENV_VAR} syntax).
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Request URL; `{ip}` is replaced by the address.
    #[serde(default = "default_url_template")]
    pub url_template: String,

    /// Flag when the reported `block` value is >= this.
    #[serde(default = "default_flag_threshold")]
    pub flag_threshold: u8,

    /// API request timeout in milliseconds.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for IpHubConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: default_api_key(),
            url_template: default_url_template(),
            flag_threshold: default_flag_threshold(),
            timeout_ms: default_timeout(),
        }
    }
}

impl IpHubConfig {
    /// Whether an API key has actually been configured.
    pub fn has_api_key(&self) -> bool {
        let key = self.api_key.trim();
        !key.is_empty() && key != PLACEHOLDER_API_KEY
    }
}

fn default_api_key() -> String {
    PLACEHOLDER_API_KEY.to_string()
}

fn default_url_template() -> String {
    "https://v2.api.iphub.info/ip/{ip}".to_string()
}

fn default_flag_threshold() -> u8 {
    1
}

fn default_timeout() -> u64 {
    5000
}

/// Persistent cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a stored classification stays valid.
    #[serde(default = "default_freshness_days")]
    pub freshness_days: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            freshness_days: default_freshness_days(),
        }
    }
}

impl StoreConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(u64::from(self.freshness_days) * 24 * 60 * 60)
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("vpn-blocker.db")
}

fn default_freshness_days() -> u32 {
    180
}

/// In-process cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Maximum number of addresses held in memory.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> usize {
    10000
}

/// Static exemptions.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OverrideConfig {
    /// Single addresses or CIDR networks.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Player identities (e.g. SteamID64).
    #[serde(default)]
    pub identities: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the runtime-editable state (`settings.mode` and `overrides`)
    /// back to the file at `path`.
    ///
    /// Every other field is kept as written, so `${VAR}` references are never
    /// replaced by their values. YAML comments are not preserved. A missing
    /// file is created with just those sections.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut doc = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str::<Value>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Null,
            Err(e) => return Err(e.into()),
        };
        if doc.is_null() {
            doc = Value::Mapping(Mapping::new());
        }
        let root = doc
            .as_mapping_mut()
            .ok_or_else(|| anyhow::anyhow!("{} is not a YAML mapping", path.display()))?;

        section(root, "settings")?.insert(
            Value::from("mode"),
            serde_yaml::to_value(self.settings.mode)?,
        );
        root.insert(
            Value::from("overrides"),
            serde_yaml::to_value(&self.overrides)?,
        );

        std::fs::write(path, serde_yaml::to_string(&doc)?)?;
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.iphub.enabled {
            if !self.iphub.url_template.starts_with("http://")
                && !self.iphub.url_template.starts_with("https://")
            {
                anyhow::bail!(
                    "iphub.url_template must be an http(s) URL: {}",
                    self.iphub.url_template
                );
            }
            if !self.iphub.url_template.contains("{ip}") {
                anyhow::bail!("iphub.url_template must contain the {{ip}} placeholder");
            }
            if self.iphub.flag_threshold == 0 {
                anyhow::bail!("iphub.flag_threshold must be at least 1");
            }
        }

        if self.store.freshness_days == 0 {
            anyhow::bail!("store.freshness_days must be at least 1");
        }

        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be at least 1");
        }

        for entry in &self.overrides.addresses {
            if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNet>().is_err() {
                anyhow::bail!("Invalid override address: {}", entry);
            }
        }

        for identity in &self.overrides.identities {
            if identity.trim().is_empty() {
                anyhow::bail!("Override identities must not be blank");
            }
        }

        Ok(())
    }

    /// Generate example configuration YAML.
    pub fn example() -> String {
        r#"# VPN Blocker Configuration

settings:
  enabled: true
  mode: monitor                # monitor (notify only) or enforce
  log_flagged: true
  log_clean: false

# IPHub classification source
iphub:
  enabled: true
  api_key: "${IPHUB_API_KEY}"  # Use environment variable
  url_template: "https://v2.api.iphub.info/ip/{ip}"
  flag_threshold: 1            # block=1 (non-residential) and block=2 (mixed) are flagged
  timeout_ms: 5000

# Persistent cache (SQLite)
store:
  path: "vpn-blocker.db"
  freshness_days: 180          # Re-query addresses older than this

# In-process cache
cache:
  max_entries: 10000

# Never checked. Addresses support CIDR notation.
overrides:
  addresses:
    - "203.0.113.7"
  identities:
    - "76561198000000000"
"#
        .to_string()
    }
}

/// Mapping stored under `name`, created (or replacing a non-mapping) if needed.
fn section<'a>(root: &'a mut Mapping, name: &str) -> anyhow::Result<&'a mut Mapping> {
    let entry = root.entry(Value::from(name)).or_insert(Value::Null);
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry
        .as_mapping_mut()
        .ok_or_else(|| anyhow::anyhow!("'{}' is not a YAML mapping", name))
}

/// Expand environment variables in the format ${VAR_NAME}.
fn expand_env_vars(content: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");

    re.replace_all(content, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
