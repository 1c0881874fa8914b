use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::platform::LinkButton;

/// Environment variables that override the config file
pub const ENV_BOT_TOKEN: &str = "SQLAR_BOT_TOKEN";
pub const ENV_ADMIN_CHATID: &str = "SQLAR_ADMIN_CHATID";
pub const ENV_LANGUAGE: &str = "SQLAR_LANGUAGE";
pub const ENV_DB_ADDRESS: &str = "SQLAR_DB_ADDRESS";

#[derive(Debug, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub general: GeneralConfig,
    pub database: DatabaseConfig,
    pub docs_button: LinkButton,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub admin_chat_id: i64,
}

#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub language: String,
    /// Message catalog file; the bundled catalog is used when unset
    pub catalog_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub address: String,
    pub query_timeout: Duration,
}

// ── File format (every field optional so the environment can fill gaps) ──

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    telegram: RawTelegram,
    #[serde(default)]
    general: RawGeneral,
    #[serde(default)]
    database: RawDatabase,
    #[serde(default)]
    docs: RawDocs,
}

#[derive(Debug, Deserialize, Default)]
struct RawTelegram {
    bot_token: Option<String>,
    admin_chat_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawGeneral {
    language: Option<String>,
    catalog_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawDatabase {
    address: Option<String>,
    #[serde(default = "default_query_timeout_secs")]
    query_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct RawDocs {
    #[serde(default = "default_docs_url")]
    url: String,
    #[serde(default = "default_docs_label")]
    label: String,
}

impl Default for RawDatabase {
    fn default() -> Self {
        Self {
            address: None,
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

impl Default for RawDocs {
    fn default() -> Self {
        Self {
            url: default_docs_url(),
            label: default_docs_label(),
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    30
}

fn default_docs_url() -> String {
    "https://gozargah.github.io/marzban/fa/examples/mysql-queries".to_string()
}

fn default_docs_label() -> String {
    "Marzban Documentation".to_string()
}

impl RawConfig {
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(token) = lookup(ENV_BOT_TOKEN) {
            self.telegram.bot_token = Some(token);
        }
        if let Some(chat_id) = lookup(ENV_ADMIN_CHATID) {
            let chat_id = chat_id
                .trim()
                .parse::<i64>()
                .with_context(|| format!("{} must be an integer chat id", ENV_ADMIN_CHATID))?;
            self.telegram.admin_chat_id = Some(chat_id);
        }
        if let Some(language) = lookup(ENV_LANGUAGE) {
            self.general.language = Some(language);
        }
        if let Some(address) = lookup(ENV_DB_ADDRESS) {
            self.database.address = Some(address);
        }
        Ok(())
    }

    fn resolve(self) -> Result<Config> {
        let bot_token = required(self.telegram.bot_token, "telegram.bot_token", ENV_BOT_TOKEN)?;
        let Some(admin_chat_id) = self.telegram.admin_chat_id else {
            bail!(
                "Missing required setting telegram.admin_chat_id (or {})",
                ENV_ADMIN_CHATID
            );
        };
        let language = required(self.general.language, "general.language", ENV_LANGUAGE)?;
        let address = required(self.database.address, "database.address", ENV_DB_ADDRESS)?;
        let address = sqlite_address(&address)?;

        if self.database.query_timeout_secs == 0 {
            bail!("database.query_timeout_secs must be greater than zero");
        }

        let url = reqwest::Url::parse(&self.docs.url)
            .with_context(|| format!("Invalid docs.url: {}", self.docs.url))?;

        Ok(Config {
            telegram: TelegramConfig {
                bot_token,
                admin_chat_id,
            },
            general: GeneralConfig {
                language,
                catalog_path: self.general.catalog_path,
            },
            database: DatabaseConfig {
                address,
                query_timeout: Duration::from_secs(self.database.query_timeout_secs),
            },
            docs_button: LinkButton {
                label: self.docs.label,
                url,
            },
        })
    }
}

/// Accept a SQLite path, a `file:` URI, or an SQLAlchemy-style
/// `sqlite[+driver]://` URL (as found in Marzban's `SQLALCHEMY_DATABASE_URL`).
/// Any other URL scheme is rejected; only SQLite is supported.
fn sqlite_address(address: &str) -> Result<String> {
    let Some((scheme, rest)) = address.split_once("://") else {
        return Ok(address.to_string());
    };

    let dialect = scheme.split('+').next().unwrap_or_default();
    match dialect.to_ascii_lowercase().as_str() {
        "file" => Ok(address.to_string()),
        "sqlite" => {
            if rest.contains('?') {
                bail!("Query parameters in sqlite:// URLs are not supported, use a file: URI instead");
            }
            // sqlite:///relative.db and sqlite:////absolute.db
            let path = rest.strip_prefix('/').unwrap_or(rest);
            if path.is_empty() {
                Ok(":memory:".to_string())
            } else {
                Ok(path.to_string())
            }
        }
        _ => bail!(
            "Unsupported database URL scheme '{}': only SQLite databases are supported \
             (a path, a file: URI or a sqlite:/// URL)",
            scheme
        ),
    }
}

fn required(value: Option<String>, name: &str, env: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => bail!("Missing required setting {} (or {})", name, env),
    }
}

impl Config {
    /// Load `path` (if it exists), then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = if path.exists() {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?
        } else {
            info!(
                "Config file {} not found, reading settings from the environment",
                path.display()
            );
            String::new()
        };

        Self::from_sources(&content, |key| std::env::var(key).ok())
    }

    fn from_sources(content: &str, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut raw: RawConfig = toml::from_str(content).context("Failed to parse config file")?;
        raw.apply_env(env)?;
        raw.resolve()
    }

    #[cfg(test)]
    pub fn from_toml(content: &str) -> Result<Self> {
        Self::from_sources(content, |_| None)
    }
}
