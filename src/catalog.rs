use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Catalog compiled into the binary, used when no `catalog_path` is configured.
const BUNDLED_CATALOG: &str = include_str!("../resources/messages.json");

/// Keys every language in the catalog has to define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    Start,
    Block,
    SuccessNoMessage,
    Error,
}

impl MessageKey {
    pub const ALL: [MessageKey; 4] = [
        MessageKey::Start,
        MessageKey::Block,
        MessageKey::SuccessNoMessage,
        MessageKey::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKey::Start => "START",
            MessageKey::Block => "BLOCK",
            MessageKey::SuccessNoMessage => "SUCCESS_NO_MESSAGE",
            MessageKey::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read message catalog {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse message catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Language '{0}' not found in message catalog")]
    UnknownLanguage(String),

    #[error("Message key '{key}' not found for language '{language}'")]
    KeyNotFound { language: String, key: String },
}

/// Localized reply strings for the configured language.
#[derive(Debug, Clone)]
pub struct Catalog {
    language: String,
    messages: HashMap<String, String>,
}

impl Catalog {
    /// Load the catalog from `path`, or the bundled one when `path` is None,
    /// and check that every required key exists for `language`.
    pub fn load(path: Option<&Path>, language: &str) -> Result<Self, CatalogError> {
        let catalog = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!("Loading message catalog from: {}", path.display());
                Self::from_json(&content, language)?
            }
            None => Self::from_json(BUNDLED_CATALOG, language)?,
        };

        catalog.validate()?;
        Ok(catalog)
    }

    /// Parse a `{ language: { key: text } }` document, keeping only `language`.
    pub fn from_json(content: &str, language: &str) -> Result<Self, CatalogError> {
        let mut all: HashMap<String, HashMap<String, String>> = serde_json::from_str(content)?;
        let messages = all
            .remove(language)
            .ok_or_else(|| CatalogError::UnknownLanguage(language.to_string()))?;

        Ok(Self {
            language: language.to_string(),
            messages,
        })
    }

    fn validate(&self) -> Result<(), CatalogError> {
        for key in MessageKey::ALL {
            self.lookup(key)?;
        }
        Ok(())
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn lookup(&self, key: MessageKey) -> Result<&str, CatalogError> {
        self.messages
            .get(key.as_str())
            .map(String::as_str)
            .ok_or_else(|| CatalogError::KeyNotFound {
                language: self.language.clone(),
                key: key.to_string(),
            })
    }
}
