use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, MessageId, ParseMode, ReplyParameters, WebAppInfo,
};
use teloxide::utils::command::BotCommands;
use tracing::{info, warn};

use crate::bot::{handle_incoming, AppState};
use crate::platform::{IncomingMessage, Reply, ReplyFormat, Responder};

/// Commands shown in the Telegram command menu
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "Show the welcome message")]
    Start,
    #[command(description = "Show the welcome message")]
    Help,
}

/// Replies to a single Telegram message
struct TelegramResponder {
    bot: Bot,
    chat_id: ChatId,
    reply_to: MessageId,
}

#[async_trait]
impl Responder for TelegramResponder {
    async fn reply(&self, reply: Reply) -> Result<()> {
        let mut request = self
            .bot
            .send_message(self.chat_id, reply.text)
            .reply_parameters(ReplyParameters::new(self.reply_to));

        if reply.format == ReplyFormat::Html {
            request = request.parse_mode(ParseMode::Html);
        }

        if let Some(button) = reply.button {
            let keyboard = InlineKeyboardMarkup::new([[InlineKeyboardButton::web_app(
                button.label,
                WebAppInfo { url: button.url },
            )]]);
            request = request.reply_markup(keyboard);
        }

        request.await?;
        Ok(())
    }
}

/// Run the Telegram platform until polling stops
pub async fn run(state: Arc<AppState>, bot: Bot) -> Result<()> {
    info!("Starting Telegram platform...");

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {}", e);
    }

    let handler = Update::filter_message().endpoint(handle_message);

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            warn!("Unhandled update: {:?}", upd.id);
        })
        .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let incoming = IncomingMessage {
        chat_id: msg.chat.id.0,
        text: msg.text().map(str::to_string),
    };

    let responder = TelegramResponder {
        bot,
        chat_id: msg.chat.id,
        reply_to: msg.id,
    };

    if let Err(e) = handle_incoming(&state, &incoming, &responder).await {
        warn!("Failed to answer message in chat {}: {:#}", incoming.chat_id, e);
    }

    Ok(())
}
