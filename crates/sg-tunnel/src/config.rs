//! Tunnel Configuration
//!
//! Provides the server configuration a tunnel is built from, the cipher
//! method list, and the provider-level configuration file (store location,
//! controller policy, relay and route hook settings).

use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cipher methods understood by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    Chacha20IetfPoly1305,
    Xchacha20IetfPoly1305,
    Blake3Aes128Gcm,
    Blake3Aes256Gcm,
    Blake3Chacha20Poly1305,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Camellia128Cfb,
    Camellia192Cfb,
    Camellia256Cfb,
    BfCfb,
    Chacha20,
    Chacha20Ietf,
    Salsa20,
    Rc4Md5,
}

impl Method {
    /// Get all methods
    pub fn all() -> &'static [Method] {
        &[
            Method::Aes128Gcm,
            Method::Aes192Gcm,
            Method::Aes256Gcm,
            Method::Chacha20IetfPoly1305,
            Method::Xchacha20IetfPoly1305,
            Method::Blake3Aes128Gcm,
            Method::Blake3Aes256Gcm,
            Method::Blake3Chacha20Poly1305,
            Method::Aes128Cfb,
            Method::Aes192Cfb,
            Method::Aes256Cfb,
            Method::Aes128Ctr,
            Method::Aes192Ctr,
            Method::Aes256Ctr,
            Method::Camellia128Cfb,
            Method::Camellia192Cfb,
            Method::Camellia256Cfb,
            Method::BfCfb,
            Method::Chacha20,
            Method::Chacha20Ietf,
            Method::Salsa20,
            Method::Rc4Md5,
        ]
    }

    /// Wire identifier (as passed to the relay)
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Method::Xchacha20IetfPoly1305 => "xchacha20-ietf-poly1305",
            Method::Blake3Aes128Gcm => "2022-blake3-aes-128-gcm",
            Method::Blake3Aes256Gcm => "2022-blake3-aes-256-gcm",
            Method::Blake3Chacha20Poly1305 => "2022-blake3-chacha20-poly1305",
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::Camellia128Cfb => "camellia-128-cfb",
            Method::Camellia192Cfb => "camellia-192-cfb",
            Method::Camellia256Cfb => "camellia-256-cfb",
            Method::BfCfb => "bf-cfb",
            Method::Chacha20 => "chacha20",
            Method::Chacha20Ietf => "chacha20-ietf",
            Method::Salsa20 => "salsa20",
            Method::Rc4Md5 => "rc4-md5",
        }
    }

    /// Is this an AEAD cipher?
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            Method::Aes128Gcm
                | Method::Aes192Gcm
                | Method::Aes256Gcm
                | Method::Chacha20IetfPoly1305
                | Method::Xchacha20IetfPoly1305
                | Method::Blake3Aes128Gcm
                | Method::Blake3Aes256Gcm
                | Method::Blake3Chacha20Poly1305
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Method::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnsupportedMethod(s.to_string()))
    }
}

/// Server a tunnel relays traffic to
///
/// Payloads from the host are loosely typed, so every field may be missing
/// here; [`ServerConfiguration::validate`] decides whether a tunnel can be
/// built from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfiguration {
    /// Tunnel identifier assigned by the host app
    #[serde(default, alias = "tunnelId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server host name or IP
    #[serde(default)]
    pub host: String,
    /// Server port
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    /// Cipher method identifier
    #[serde(default)]
    pub method: String,
    /// Shared secret
    #[serde(default)]
    pub password: String,
    /// Salt prefix sent ahead of the first packet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Display name from the share link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Relay options (plugin, plugin_opts, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
    /// Must UDP be forwarded through the relay?
    #[serde(default)]
    pub udp_required: bool,
}

impl ServerConfiguration {
    /// Create a configuration with the required fields
    pub fn new(host: impl Into<String>, port: u16, method: Method, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            method: method.as_str().to_string(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Attach the host app's tunnel id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Require UDP forwarding
    pub fn with_udp_required(mut self, required: bool) -> Self {
        self.udp_required = required;
        self
    }

    /// Parsed cipher method
    pub fn cipher(&self) -> Result<Method, ConfigError> {
        if self.method.trim().is_empty() {
            return Err(ConfigError::MissingMethod);
        }
        self.method.parse()
    }

    /// `host:port` for display and relay arguments
    pub fn endpoint(&self) -> String {
        let port = self.port.map(|p| p.to_string()).unwrap_or_default();
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, port)
        } else {
            format!("{}:{}", self.host, port)
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if host.len() != self.host.len()
            || host.chars().any(|c| c.is_whitespace() || matches!(c, '/' | '@' | '#' | '?'))
        {
            return Err(ConfigError::InvalidHost(self.host.clone()));
        }
        match self.port {
            None => return Err(ConfigError::MissingPort),
            Some(0) => return Err(ConfigError::InvalidPort),
            Some(_) => {}
        }
        self.cipher()?;
        if self.password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u64),
    Text(String),
    Other(IgnoredAny),
}

/// Accepts `8388`, `"8388"` or nothing
///
/// Out of range or non-numeric ports are kept as `Some(0)` so the payload
/// still decodes and [`ServerConfiguration::validate`] rejects it.
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let port = match Option::<PortRepr>::deserialize(deserializer)? {
        None => None,
        Some(PortRepr::Number(n)) => Some(u16::try_from(n).unwrap_or(0)),
        Some(PortRepr::Text(s)) if s.trim().is_empty() => None,
        Some(PortRepr::Text(s)) => Some(s.trim().parse().unwrap_or(0)),
        Some(PortRepr::Other(_)) => Some(0),
    };
    Ok(port)
}

/// Controller timing and retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerPolicy {
    /// Interval between liveness probes while connected
    pub health_check_interval: Duration,
    /// Consecutive failures tolerated before giving up (retry cap)
    pub max_reassert_attempts: u32,
    /// Delay between reassert attempts
    pub reassert_delay: Duration,
    /// Upper bound for a single tunnel start or stop
    pub transition_timeout: Duration,
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(10),
            max_reassert_attempts: 3,
            reassert_delay: Duration::from_secs(2),
            transition_timeout: Duration::from_secs(30),
        }
    }
}

/// Policy section of the provider config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_health_check_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_max_reassert_attempts")]
    pub max_reassert_attempts: u32,
    #[serde(default = "default_reassert_delay_ms")]
    pub reassert_delay_ms: u64,
    #[serde(default = "default_transition_timeout_secs")]
    pub transition_timeout_secs: u64,
}

fn default_health_check_secs() -> u64 {
    10
}

fn default_max_reassert_attempts() -> u32 {
    3
}

fn default_reassert_delay_ms() -> u64 {
    2000
}

fn default_transition_timeout_secs() -> u64 {
    30
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_secs(),
            max_reassert_attempts: default_max_reassert_attempts(),
            reassert_delay_ms: default_reassert_delay_ms(),
            transition_timeout_secs: default_transition_timeout_secs(),
        }
    }
}

impl PolicyConfig {
    /// Convert to the controller's policy
    pub fn to_policy(&self) -> ControllerPolicy {
        ControllerPolicy {
            health_check_interval: Duration::from_secs(self.health_check_interval_secs.max(1)),
            max_reassert_attempts: self.max_reassert_attempts.max(1),
            reassert_delay: Duration::from_millis(self.reassert_delay_ms),
            transition_timeout: Duration::from_secs(self.transition_timeout_secs.max(1)),
        }
    }
}

/// Local relay process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Relay executable (ss-local compatible)
    #[serde(default = "default_relay_program")]
    pub program: PathBuf,
    /// Local listen address
    #[serde(default = "default_local_address")]
    pub local_address: IpAddr,
    /// Local SOCKS5 port
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Can the relay forward UDP?
    #[serde(default = "default_true")]
    pub udp_relay: bool,
    /// Exit within this window counts as a failed start
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Extra arguments appended to the command line
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_relay_program() -> PathBuf {
    PathBuf::from("ss-local")
}

fn default_local_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_local_port() -> u16 {
    1080
}

fn default_true() -> bool {
    true
}

fn default_startup_grace_ms() -> u64 {
    300
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            program: default_relay_program(),
            local_address: default_local_address(),
            local_port: default_local_port(),
            udp_relay: true,
            startup_grace_ms: default_startup_grace_ms(),
            extra_args: Vec::new(),
        }
    }
}

/// Route hook programs run on tunnel up/down
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookSettings {
    /// Installs routes; receives the settings as `SG_*` environment variables
    #[serde(default)]
    pub up: Option<PathBuf>,
    /// Removes routes
    #[serde(default)]
    pub down: Option<PathBuf>,
    /// Exits zero while the routes are still in the table
    #[serde(default)]
    pub check: Option<PathBuf>,
}

/// Provider configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Location of the tunnel store record
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub routes: HookSettings,
}

fn default_store_path() -> PathBuf {
    std::env::temp_dir().join("shadowguard").join("tunnel-store.json")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            policy: PolicyConfig::default(),
            relay: RelaySettings::default(),
            routes: HookSettings::default(),
        }
    }
}

impl ProviderConfig {
    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match ext {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing server host")]
    MissingHost,

    #[error("Invalid server host: {0}")]
    InvalidHost(String),

    #[error("Missing server port")]
    MissingPort,

    #[error("Invalid server port")]
    InvalidPort,

    #[error("Missing cipher method")]
    MissingMethod,

    #[error("Unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    #[error("Missing server credentials")]
    MissingCredentials,

    #[error("No server configuration available")]
    NoConfiguration,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,
}

impl ConfigError {
    /// Does this error describe the server configuration itself?
    pub fn is_server_config(&self) -> bool {
        !matches!(
            self,
            ConfigError::Io(_) | ConfigError::Parse(_) | ConfigError::UnsupportedFormat
        )
    }
}
