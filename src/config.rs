//! Application configuration.
//!
//! Loaded from YAML; every section has defaults so an empty or missing file
//! is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use page_broker::BrowserSettings;
use pagepilot_scheduler::QueueConfig;
use pagepilot_session::SessionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no user config directory on this platform")]
    NoConfigDir,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub browser: BrowserSettings,
    pub queue: QueueConfig,
    pub session: SessionConfig,
    pub whatsapp: WhatsAppConfig,
    pub declaraguate: DeclaraGuateConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    pub enabled: bool,
    pub url: String,
    /// Where the login QR code is written.
    pub screenshot_path: PathBuf,
    /// URL under which the host serves `screenshot_path`.
    pub static_url: String,
    pub login_on_start: bool,
    /// Title suffix WhatsApp puts on the account's own chat.
    pub self_chat: String,
    /// How long `send_me_and_wait` waits for the reply row.
    pub reply_timeout_ms: u64,
}

impl WhatsAppConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "https://web.whatsapp.com/".into(),
            screenshot_path: PathBuf::from("www/whatsapp_qr.png"),
            static_url: "/local/whatsapp_qr.png".into(),
            login_on_start: false,
            self_chat: "(You)".into(),
            reply_timeout_ms: 600_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DeclaraGuateConfig {
    pub enabled: bool,
    pub url: String,
    pub username: String,
    pub password: String,
    /// Chat name the one-time code arrives from.
    pub otp_sender: String,
    /// Start a login as soon as WhatsApp reports logged in.
    pub login_after_whatsapp: bool,
}

impl Default for DeclaraGuateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://declaraguate.sat.gob.gt/declaraguate-web/".into(),
            username: String::new(),
            password: String::new(),
            otp_sender: "SAT".into(),
            login_after_whatsapp: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

/// A loaded configuration and where it came from.
pub struct LoadedConfig {
    pub config: AppConfig,
    pub path: PathBuf,
    /// False when `path` did not exist and defaults were used.
    pub from_file: bool,
}

impl AppConfig {
    pub fn from_yaml(path: &Path, content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn apply_env(&mut self) {
        self.browser.apply_env();
    }
}

/// `~/.config/pagepilot/config.yaml` or the platform equivalent.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    path.push("pagepilot");
    path.push("config.yaml");
    Ok(path)
}

pub async fn load_config(config_path: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    let (mut config, from_file) = if path.exists() {
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
        (AppConfig::from_yaml(&path, &content)?, true)
    } else {
        (AppConfig::default(), false)
    };
    config.apply_env();

    Ok(LoadedConfig {
        config,
        path,
        from_file,
    })
}
