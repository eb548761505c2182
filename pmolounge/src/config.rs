//! # Lounge configuration
//!
//! Configuration is resolved in layers:
//! - the default YAML embedded in the crate (`pmolounge.yaml`)
//! - `config.yaml` from the configuration directory, merged over it
//! - `PMOLOUNGE_CONFIG__SECTION__KEY=value` environment variables, whose
//!   values are parsed as YAML
//!
//! The configuration directory is searched in this order:
//! 1. the `directory` argument, if not empty
//! 2. the `PMOLOUNGE_CONFIG` environment variable
//! 3. `.pmolounge` in the current directory
//! 4. `.pmolounge` in the user's home directory
//!
//! ```no_run
//! use pmolounge::LoungeConfig;
//!
//! let config = LoungeConfig::load("")?;
//! let client = config.http_client()?;
//! # Ok::<(), pmolounge::Error>(())
//! ```

use crate::error::Result as LoungeResult;
use crate::longpoll::BackoffPolicy;
use anyhow::{anyhow, Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{env, fs};
use tracing::{debug, info};
use url::Url;

const DEFAULT_CONFIG: &str = include_str!("pmolounge.yaml");

const ENV_CONFIG_DIR: &str = "PMOLOUNGE_CONFIG";
const ENV_PREFIX: &str = "PMOLOUNGE_CONFIG__";
const CONFIG_DIR_NAME: &str = ".pmolounge";
const CONFIG_FILE_NAME: &str = "config.yaml";

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Service endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointsConfig {
    pub base_url: String,
}

/// How the receiver presents itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// Fixed device id; derived from the hardware address when absent
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Constant,
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        let initial = Duration::from_millis(self.initial_ms);
        match self.strategy {
            BackoffStrategy::Constant => BackoffPolicy::Constant(initial),
            BackoffStrategy::Exponential => BackoffPolicy::Exponential {
                initial,
                multiplier: self.multiplier,
                max: Duration::from_millis(self.max_ms.max(self.initial_ms)),
            },
        }
    }
}

/// Channel scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Delay between two cycles of a channel
    pub interval_ms: u64,
    /// Upper bound of one long poll, body included
    pub request_timeout_secs: u64,
    /// Consecutive transport failures tolerated before the session quits
    pub max_retries: u32,
    pub backoff: BackoffConfig,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Trust configuration, scoped to the session's HTTP client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM files added to the built-in roots
    #[serde(default)]
    pub extra_root_certificates: Vec<PathBuf>,
}

/// Complete lounge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoungeConfig {
    pub endpoints: EndpointsConfig,
    pub device: DeviceConfig,
    pub polling: PollingConfig,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for LoungeConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointsConfig {
                base_url: "https://www.youtube.com".to_string(),
            },
            device: DeviceConfig {
                name: "PMOLounge".to_string(),
                id: None,
            },
            polling: PollingConfig {
                interval_ms: 1000,
                request_timeout_secs: 300,
                max_retries: 25,
                backoff: BackoffConfig {
                    strategy: BackoffStrategy::Exponential,
                    initial_ms: 500,
                    multiplier: 2.0,
                    max_ms: 30_000,
                },
            },
            tls: TlsConfig::default(),
        }
    }
}

impl LoungeConfig {
    /// Load the layered configuration from `directory` (empty for the search order)
    pub fn load(directory: &str) -> Result<Self> {
        let config_dir = find_config_dir(directory);
        let path = config_dir.join(CONFIG_FILE_NAME);

        let external = match fs::read_to_string(&path) {
            Ok(data) => {
                info!(config_file = %path.display(), "Loaded config file");
                Some(data)
            }
            Err(_) => {
                info!(config_file = %path.display(), "Config file not found, using embedded defaults");
                None
            }
        };

        Self::from_layers(external.as_deref(), env::vars())
    }

    /// Defaults merged with `yaml`, without environment overrides
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_layers(Some(yaml), std::iter::empty())
    }

    /// Defaults, then `external` YAML, then `PMOLOUNGE_CONFIG__*` entries of `vars`
    pub fn from_layers<I>(external: Option<&str>, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        if let Some(external) = external {
            let external: Value =
                serde_yaml::from_str(external).context("Invalid configuration file")?;
            if !external.is_null() {
                merge_yaml(&mut value, &external);
            }
        }
        let mut value = lower_keys_value(value);
        apply_env_overrides(&mut value, vars)?;

        let config: Self = serde_yaml::from_value(value).context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        Url::parse(&self.endpoints.base_url)
            .with_context(|| format!("Invalid base_url {}", self.endpoints.base_url))?;
        if self.polling.backoff.multiplier <= 0.0 {
            return Err(anyhow!("polling.backoff.multiplier must be positive"));
        }
        if self.polling.request_timeout_secs == 0 {
            return Err(anyhow!("polling.request_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> LoungeResult<Url> {
        Ok(Url::parse(&self.endpoints.base_url)?)
    }

    /// User agent announced by the receiver
    pub fn user_agent(&self) -> String {
        format!(
            "PMOLounge/{} ({})",
            env!("CARGO_PKG_VERSION"),
            pmoutils::get_os_string()
        )
    }

    /// Shared client: rustls, cookie store, user agent, extra trust roots
    pub fn http_client(&self) -> LoungeResult<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.user_agent())
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));

        for path in &self.tls.extra_root_certificates {
            let pem = fs::read(path)?;
            let certificate = reqwest::Certificate::from_pem(&pem)?;
            debug!(certificate = %path.display(), "Adding extra root certificate");
            builder = builder.add_root_certificate(certificate);
        }

        Ok(builder.build()?)
    }
}

fn find_config_dir(directory: &str) -> PathBuf {
    if !directory.is_empty() {
        return PathBuf::from(directory);
    }

    if let Ok(env_path) = env::var(ENV_CONFIG_DIR) {
        info!(env_var = ENV_CONFIG_DIR, path = %env_path, "Using config directory from env");
        return PathBuf::from(env_path);
    }

    let local = Path::new(CONFIG_DIR_NAME);
    if local.exists() {
        return local.to_path_buf();
    }

    if let Some(home) = home_dir() {
        let home_config = home.join(CONFIG_DIR_NAME);
        if home_config.exists() {
            return home_config;
        }
    }

    local.to_path_buf()
}

fn apply_env_overrides<I>(config: &mut Value, vars: I) -> Result<()>
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let path: Vec<String> = path.split("__").map(str::to_lowercase).collect();
        debug!(key = %key, "Applying environment override");
        set_value(config, &path, convert_env_value(&value))
            .with_context(|| format!("Cannot apply {key}"))?;
    }
    Ok(())
}

fn set_value(data: &mut Value, path: &[String], value: Value) -> Result<()> {
    let Some((last, parents)) = path.split_last() else {
        return Err(anyhow!("Empty configuration path"));
    };

    let mut current = data;
    for key in parents {
        let Value::Mapping(map) = current else {
            return Err(anyhow!("{key} is not a section"));
        };
        current = map
            .entry(Value::String(key.clone()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }

    match current {
        Value::Mapping(map) => {
            map.insert(Value::String(last.clone()), value);
            Ok(())
        }
        _ => Err(anyhow!("{} is not a section", parents.join("."))),
    }
}

fn convert_env_value(value: &str) -> Value {
    serde_yaml::from_str::<Value>(value).unwrap_or_else(|_| Value::String(value.to_string()))
}

fn lower_keys_value(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut new_map = Mapping::new();
            for (k, v) in map {
                let key = match k {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                };
                new_map.insert(key, lower_keys_value(v));
            }
            Value::Mapping(new_map)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys_value).collect()),
        _ => value,
    }
}

/// Scalars and sequences from `external` replace; mappings merge recursively
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (d, e) => *d = e.clone(),
    }
}
