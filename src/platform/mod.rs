pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

/// A message received from the chat platform
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Conversation the message arrived on
    pub chat_id: i64,
    /// The message text, None for stickers, photos and the like
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyFormat {
    #[default]
    Plain,
    Html,
}

/// Inline button opening an external page
#[derive(Debug, Clone, PartialEq)]
pub struct LinkButton {
    pub label: String,
    pub url: reqwest::Url,
}

/// A reply to send back on the conversation the message arrived on
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub format: ReplyFormat,
    pub button: Option<LinkButton>,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: ReplyFormat::Plain,
            button: None,
        }
    }

    pub fn html(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: ReplyFormat::Html,
            button: None,
        }
    }

    pub fn with_button(mut self, button: LinkButton) -> Self {
        self.button = Some(button);
        self
    }
}

/// Sends replies for one inbound message
#[async_trait]
pub trait Responder: Send + Sync {
    async fn reply(&self, reply: Reply) -> Result<()>;
}
