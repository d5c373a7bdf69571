use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("unknown account: {0}")]
    UnknownAccount(String),

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// One configured XMPP identity.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub login: String,
    #[serde(default = "default_resource")]
    pub resource: String,
    /// Absent means the password has to be supplied before connecting.
    pub password: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub priority: i8,
    pub proxy: Option<ProxyConfig>,
    #[serde(default = "default_true")]
    pub use_tls: bool,
    #[serde(default)]
    pub allow_plain: bool,
    pub keyid: Option<String>,
    #[serde(default)]
    pub autoauth: bool,
    #[serde(default)]
    pub dont_ack_subscription: bool,
    #[serde(default)]
    pub jids_for_auto_auth: Vec<String>,
    #[serde(default = "default_true")]
    pub answer_receipts: bool,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Upper bound on opening the stream and authenticating.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
}

impl AccountConfig {
    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.login, self.hostname)
    }

    pub fn full_jid(&self) -> String {
        format!("{}/{}", self.bare_jid(), self.resource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

/// Behaviour shared by every account.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Cancel our subscription to a contact when it is removed.
    #[serde(default = "default_true")]
    pub delauth: bool,
    /// Drop the roster item when a contact is removed.
    #[serde(default = "default_true")]
    pub delroster: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            delauth: true,
            delroster: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    pub path: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    log_level: Option<String>,
    passwords: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_resource() -> String {
    "tern".to_string()
}

fn default_port() -> u16 {
    5222
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[core]
delauth = true
delroster = true

[logging]
level = "info"

[event_bus]
channel_capacity = 1024

[storage]
# path = "~/.local/share/tern/history.db"

# [accounts.work]
# hostname = "example.com"
# login = "alice"
# resource = "tern"
# password = "secret"
# priority = 5
# keyid = "0123456789ABCDEF"
# autoauth = false
# proxy = { host = "proxy.example.com", port = 3128 }
"#;

/// Return the resolved platform-appropriate configuration file path.
#[cfg(feature = "native")]
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TERN_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(proj_dirs) = directories::ProjectDirs::from("social", "tern", "tern") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Runtime view of the configuration file.
///
/// Keeps the raw TOML table so that `get`/`set` work on any section and
/// `save` writes back what the user wrote, plus whatever the core changed.
/// Typed access goes through [`ConfigStore::config`].
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    table: RwLock<toml::Table>,
    overrides: ConfigOverrides,
}

impl ConfigStore {
    /// Load the platform config file, creating a default one when missing.
    #[cfg(feature = "native")]
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(config_path())
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path.into(), config_overrides_from_env())
    }

    /// Parse configuration from a TOML string, without a backing file.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Self::from_toml_with_overrides(toml_str, None, config_overrides_from_env())
    }

    fn load_with_overrides(path: PathBuf, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                create_default_config(&path)?;
                DEFAULT_CONFIG_TOML.to_string()
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml_with_overrides(&contents, Some(path), overrides)
    }

    fn from_toml_with_overrides(
        toml_str: &str,
        path: Option<PathBuf>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let table: toml::Table = toml::from_str(toml_str).map_err(|e| {
            let (line, column) = e.span().map_or((0, 0), |span| {
                let before = &toml_str[..span.start];
                let line = before.chars().filter(|&c| c == '\n').count() + 1;
                let column = before
                    .rfind('\n')
                    .map_or(span.start + 1, |nl| span.start - nl);
                (line, column)
            });
            ConfigError::InvalidToml {
                line,
                column,
                message: e.message().to_string(),
            }
        })?;

        let store = Self {
            path,
            table: RwLock::new(table),
            overrides,
        };
        store.config()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Typed, validated snapshot with environment overrides applied.
    pub fn config(&self) -> Result<Config, ConfigError> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner).clone();
        let mut config: Config =
            toml::Value::Table(table)
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::InvalidValue {
                    field: "config".to_string(),
                    message: e.message().to_string(),
                })?;

        apply_overrides(&mut config, &self.overrides);
        validate(&config)?;
        Ok(config)
    }

    pub fn account(&self, name: &str) -> Result<AccountConfig, ConfigError> {
        self.config()?
            .accounts
            .remove(name)
            .ok_or_else(|| ConfigError::UnknownAccount(name.to_string()))
    }

    /// Names of every configured account, sorted.
    pub fn accounts(&self) -> Vec<String> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .get("accounts")
            .and_then(toml::Value::as_table)
            .map(|accounts| accounts.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw value at `key` inside the dotted `section` (e.g. `accounts.work`).
    pub fn get(&self, section: &str, key: &str) -> Option<toml::Value> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        section_table(&table, section)?.get(key).cloned()
    }

    /// Typed read with a fallback for missing or mistyped values.
    pub fn get_or<T: DeserializeOwned>(&self, section: &str, key: &str, default: T) -> T {
        match self.get(section, key) {
            Some(value) => value.try_into().unwrap_or_else(|e: toml::de::Error| {
                warn!(section, key, error = %e, "config value has the wrong type");
                default
            }),
            None => default,
        }
    }

    /// Set `key` in `section`, creating intermediate tables as needed.
    pub fn set(
        &self,
        section: &str,
        key: &str,
        value: impl Into<toml::Value>,
    ) -> Result<(), ConfigError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut current = &mut *table;
        for part in section.split('.').filter(|part| !part.is_empty()) {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            current = entry
                .as_table_mut()
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: section.to_string(),
                    message: format!("{part} is not a table"),
                })?;
        }
        current.insert(key.to_string(), value.into());
        debug!(section, key, "config value updated");
        Ok(())
    }

    /// Write the table back to the backing file, if there is one.
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let rendered = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            toml::to_string_pretty(&*table).map_err(|e| ConfigError::InvalidValue {
                field: "config".to_string(),
                message: e.to_string(),
            })?
        };

        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, rendered)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn section_table<'a>(table: &'a toml::Table, section: &str) -> Option<&'a toml::Table> {
    section
        .split('.')
        .filter(|part| !part.is_empty())
        .try_fold(table, |current, part| current.get(part)?.as_table())
}

fn config_overrides_from_env() -> ConfigOverrides {
    let passwords = std::env::vars()
        .filter_map(|(name, value)| {
            let account = name.strip_prefix("TERN_")?.strip_suffix("_PASSWORD")?;
            Some((account.to_string(), value))
        })
        .collect();

    ConfigOverrides {
        log_level: std::env::var("TERN_LOG_LEVEL").ok(),
        passwords,
    }
}

/// `work-laptop` becomes `WORK_LAPTOP`.
fn env_account_key(account: &str) -> String {
    account
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn apply_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(level) = &overrides.log_level {
        config.logging.level = level.clone();
    }
    for (name, account) in &mut config.accounts {
        if let Some(password) = overrides.passwords.get(&env_account_key(name)) {
            account.password = Some(password.clone());
        }
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    for (name, account) in &config.accounts {
        if account.hostname.is_empty() {
            missing.push(format!("accounts.{name}.hostname"));
        }
        if account.login.is_empty() {
            missing.push(format!("accounts.{name}.login"));
        }
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    for (name, account) in &config.accounts {
        if account.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("accounts.{name}.port"),
                message: "must be between 1 and 65535".to_string(),
            });
        }
        if account.resource.is_empty() || account.resource.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: format!("accounts.{name}.resource"),
                message: "must be non-empty and must not contain '/'".to_string(),
            });
        }
        if let Some(keyid) = &account.keyid {
            let well_formed = matches!(keyid.len(), 8 | 16 | 40)
                && keyid.chars().all(|c| c.is_ascii_hexdigit());
            if !well_formed {
                return Err(ConfigError::InvalidValue {
                    field: format!("accounts.{name}.keyid"),
                    message: "must be an 8, 16 or 40 digit hexadecimal key ID".to_string(),
                });
            }
        }
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}

pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}
