//! Client configuration: a JSON file overridden field by field from the
//! environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::auth::parse_secret;
use crate::codec::DEFAULT_MAX_FRAME_LEN;
use crate::error::{RscError, RscResult};

pub const DEFAULT_ADDR: &str = "127.0.0.1:44555";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;

pub const ENV_CONFIG: &str = "REMOTESC_CONFIG";
pub const ENV_ADDR: &str = "REMOTESC_ADDR";
pub const ENV_PIN: &str = "REMOTESC_PIN";
pub const ENV_FINGERPRINT: &str = "REMOTESC_FINGERPRINT";
pub const ENV_SECRET: &str = "REMOTESC_SECRET";
pub const ENV_TIMEOUT: &str = "REMOTESC_TIMEOUT_SECS";

/// On-disk shape of the client configuration. Every field is optional so
/// the environment can supply what the file leaves out.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&data).with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub addr: String,
    /// Hex SHA-256 of the server certificate.
    pub pin: String,
    pub fingerprint: String,
    pub secret: Zeroizing<Vec<u8>>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retries: u32,
    pub max_frame_len: usize,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("addr", &self.addr)
            .field("pin", &self.pin)
            .field("fingerprint", &self.fingerprint)
            .field("secret", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .finish()
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".config").join("remotesc.json"))
}

impl ClientConfig {
    pub fn new(addr: &str, pin: &str, fingerprint: &str, secret: &str) -> RscResult<Self> {
        Ok(Self {
            addr: addr.to_owned(),
            pin: pin.to_owned(),
            fingerprint: fingerprint.to_owned(),
            secret: parse_secret(secret)?,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    /// Loads from `REMOTESC_CONFIG` (or `~/.config/remotesc.json`) and the
    /// process environment. A missing default file is not an error.
    pub fn load() -> RscResult<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(env: impl Fn(&str) -> Option<String>) -> RscResult<Self> {
        let file = match env(ENV_CONFIG) {
            Some(path) => ConfigFile::read(Path::new(&path)).map_err(|err| {
                RscError::config(format!("{err:#}"))
            })?,
            None => match default_config_path() {
                Some(path) if path.exists() => ConfigFile::read(&path)
                    .map_err(|err| RscError::config(format!("{err:#}")))?,
                _ => ConfigFile::default(),
            },
        };
        Self::resolve(file, env)
    }

    /// Environment values take precedence over the file.
    pub fn resolve(file: ConfigFile, env: impl Fn(&str) -> Option<String>) -> RscResult<Self> {
        let addr = env(ENV_ADDR)
            .or(file.addr)
            .unwrap_or_else(|| DEFAULT_ADDR.to_owned());
        let pin = env(ENV_PIN)
            .or(file.pin)
            .ok_or_else(|| RscError::config("server certificate pin not configured"))?;
        let fingerprint = env(ENV_FINGERPRINT)
            .or(file.fingerprint)
            .ok_or_else(|| RscError::config("fingerprint not configured"))?;
        let secret = Zeroizing::new(
            env(ENV_SECRET)
                .or(file.secret)
                .ok_or_else(|| RscError::config("shared secret not configured"))?,
        );
        let timeout_secs = match env(ENV_TIMEOUT) {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|err| {
                RscError::config(format!("invalid {ENV_TIMEOUT} value {raw:?}: {err}"))
            })?),
            None => file.timeout_secs,
        };

        let mut config = Self::new(&addr, &pin, &fingerprint, &secret)?;
        if let Some(secs) = timeout_secs {
            config.timeout = Duration::from_secs(secs.max(1));
            config.connect_timeout = config.timeout;
        }
        if let Some(retries) = file.retries {
            config.retries = retries;
        }
        Ok(config)
    }
}
