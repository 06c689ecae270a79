use aaisp_client::{Backoff, ClientSettings, Credentials};
use aaisp_common::types::Tier;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of environment overrides, e.g. `AAISP_EXPORTER_AUTH__CONTROL_LOGIN`.
pub const ENV_PREFIX: &str = "AAISP_EXPORTER_";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid environment override {key}: {reason}")]
    Env { key: String, reason: String },

    #[error("{tier} interval must be a positive number of seconds")]
    InvalidInterval { tier: Tier },

    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("no credentials configured: set auth.control_login/control_password or auth.account_number/account_password")]
    MissingCredentials,

    #[error("both control login and account credentials are configured, choose one")]
    ConflictingCredentials,

    #[error("incomplete {0} credentials: both the login and the password are required")]
    IncompleteCredentials(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExporterConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub intervals: IntervalsConfig,
    #[serde(default)]
    pub deadlines: DeadlinesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub collectors: CollectorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9099
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            concurrency_limit: default_concurrency_limit(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
        }
    }
}

fn default_base_url() -> String {
    "https://chaos2.aa.net.uk".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_concurrency_limit() -> usize {
    5
}

fn default_retry_backoff_base_ms() -> u64 {
    1000
}

fn default_retry_backoff_max_ms() -> u64 {
    30_000
}

/// CHAOS credentials. Exactly one pair must be filled in.
#[derive(Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub control_login: Option<String>,
    #[serde(default)]
    pub control_password: Option<String>,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub account_password: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| if filled(v) { "***" } else { "<unset>" };
        f.debug_struct("AuthConfig")
            .field("control_login", &mask(&self.control_login))
            .field("control_password", &mask(&self.control_password))
            .field("account_number", &mask(&self.account_number))
            .field("account_password", &mask(&self.account_password))
            .finish()
    }
}

fn filled(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

impl AuthConfig {
    pub fn credentials(&self) -> Result<Credentials> {
        let control = (filled(&self.control_login), filled(&self.control_password));
        let account = (filled(&self.account_number), filled(&self.account_password));
        let control_any = control.0 || control.1;
        let account_any = account.0 || account.1;

        match (control_any, account_any) {
            (false, false) => Err(ConfigError::MissingCredentials),
            (true, true) => Err(ConfigError::ConflictingCredentials),
            (true, false) => match (&self.control_login, &self.control_password) {
                (Some(login), Some(password)) if control == (true, true) => {
                    Ok(Credentials::control_login(login.trim(), password.as_str()))
                }
                _ => Err(ConfigError::IncompleteCredentials("control login")),
            },
            (false, true) => match (&self.account_number, &self.account_password) {
                (Some(number), Some(password)) if account == (true, true) => {
                    Ok(Credentials::account(number.trim(), password.as_str()))
                }
                _ => Err(ConfigError::IncompleteCredentials("account")),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntervalsConfig {
    #[serde(default = "default_fast_interval")]
    pub fast: u64,
    #[serde(default = "default_medium_interval")]
    pub medium: u64,
    #[serde(default = "default_slow_interval")]
    pub slow: u64,
}

impl Default for IntervalsConfig {
    fn default() -> Self {
        Self {
            fast: default_fast_interval(),
            medium: default_medium_interval(),
            slow: default_slow_interval(),
        }
    }
}

fn default_fast_interval() -> u64 {
    Tier::Fast.default_interval_secs()
}

fn default_medium_interval() -> u64 {
    Tier::Medium.default_interval_secs()
}

fn default_slow_interval() -> u64 {
    Tier::Slow.default_interval_secs()
}

impl IntervalsConfig {
    pub fn secs(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Fast => self.fast,
            Tier::Medium => self.medium,
            Tier::Slow => self.slow,
        }
    }
}

/// Per-tier cycle deadlines in seconds. Unset means the tier's interval.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeadlinesConfig {
    #[serde(default)]
    pub fast: Option<u64>,
    #[serde(default)]
    pub medium: Option<u64>,
    #[serde(default)]
    pub slow: Option<u64>,
}

impl DeadlinesConfig {
    pub fn secs(&self, tier: Tier) -> Option<u64> {
        match tier {
            Tier::Fast => self.fast,
            Tier::Medium => self.medium,
            Tier::Slow => self.slow,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Which collectors are scheduled. Disabled collectors cost nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorsConfig {
    #[serde(default = "default_true")]
    pub broadband_quota: bool,
    #[serde(default = "default_true")]
    pub broadband_line_info: bool,
    #[serde(default)]
    pub broadband_usage: bool,
    #[serde(default)]
    pub telephony_call_stats: bool,
    #[serde(default)]
    pub telephony_ratecard: bool,
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            broadband_quota: true,
            broadband_line_info: true,
            broadband_usage: false,
            telephony_call_stats: false,
            telephony_ratecard: false,
        }
    }
}

fn default_true() -> bool {
    true
}

impl CollectorsConfig {
    pub fn is_enabled(&self, collector: &str) -> bool {
        match collector {
            "broadband_quota" => self.broadband_quota,
            "broadband_line_info" => self.broadband_line_info,
            "broadband_usage" => self.broadband_usage,
            "telephony_call_stats" => self.telephony_call_stats,
            "telephony_ratecard" => self.telephony_ratecard,
            _ => false,
        }
    }
}

/// Cadence of one tier loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl ExporterConfig {
    /// Reads `path` (defaults if it does not exist) and applies
    /// `AAISP_EXPORTER_*` overrides from the process environment.
    pub fn load(path: &str) -> Result<Self> {
        let content = if Path::new(path).exists() {
            Some(std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_string(),
                source,
            })?)
        } else {
            None
        };
        Self::from_sources(content.as_deref(), std::env::vars())
    }

    /// Builds a config from optional TOML text and `(key, value)` environment
    /// pairs. Environment values win over the file.
    pub fn from_sources<I>(toml_text: Option<&str>, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table: toml::Table = match toml_text {
            Some(text) => toml::from_str(text)?,
            None => toml::Table::new(),
        };

        for (key, value) in env {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let Some((section, field)) = rest.split_once(ENV_SEPARATOR) else {
                return Err(ConfigError::Env {
                    key,
                    reason: format!("expected {ENV_PREFIX}<SECTION>{ENV_SEPARATOR}<FIELD>"),
                });
            };
            let section = section.to_ascii_lowercase();
            let field = field.to_ascii_lowercase();

            let entry = table
                .entry(section.clone())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            let Some(section_table) = entry.as_table_mut() else {
                return Err(ConfigError::Env {
                    key,
                    reason: format!("[{section}] is not a table"),
                });
            };
            section_table.insert(field, env_value(&section, &value));
        }

        let config: Self = toml::Value::Table(table).try_into()?;
        Ok(config)
    }

    /// Startup checks. Any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            if self.intervals.secs(tier) == 0 {
                return Err(ConfigError::InvalidInterval { tier });
            }
            if self.deadlines.secs(tier) == Some(0) {
                return Err(ConfigError::NotPositive { field: "deadline" });
            }
        }
        if self.api.concurrency_limit == 0 {
            return Err(ConfigError::NotPositive {
                field: "api.concurrency_limit",
            });
        }
        if self.api.timeout_secs == 0 {
            return Err(ConfigError::NotPositive {
                field: "api.timeout_secs",
            });
        }
        self.auth.credentials()?;
        Ok(())
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            base_url: self.api.base_url.clone(),
            timeout: Duration::from_secs(self.api.timeout_secs),
            max_retries: self.api.max_retries,
            concurrency_limit: self.api.concurrency_limit,
            backoff: Backoff::new(
                Duration::from_millis(self.api.retry_backoff_base_ms),
                Duration::from_millis(self.api.retry_backoff_max_ms),
            ),
        }
    }

    pub fn schedule(&self, tier: Tier) -> TierSchedule {
        let interval = Duration::from_secs(self.intervals.secs(tier));
        let deadline = self
            .deadlines
            .secs(tier)
            .map(Duration::from_secs)
            .unwrap_or(interval);
        TierSchedule { interval, deadline }
    }

    pub fn schedules(&self) -> BTreeMap<Tier, TierSchedule> {
        Tier::ALL
            .into_iter()
            .map(|tier| (tier, self.schedule(tier)))
            .collect()
    }
}

// Credentials and free-text fields stay strings even when they look numeric.
fn env_value(section: &str, raw: &str) -> toml::Value {
    if section == "auth" {
        return toml::Value::String(raw.to_string());
    }
    if let Ok(b) = raw.parse::<bool>() {
        return toml::Value::Boolean(b);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    toml::Value::String(raw.to_string())
}
