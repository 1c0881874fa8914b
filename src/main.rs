mod bot;
mod catalog;
mod config;
mod database;
mod platform;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use teloxide::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bot::AppState;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::database::SqliteGateway;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlar=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Admin chat: {}", config.telegram.admin_chat_id);
    info!("  Language: {}", config.general.language);
    info!(
        "  Database: {} (query timeout {:?})",
        config.database.address, config.database.query_timeout
    );

    // A missing language or key is a startup error, not a mid-conversation one
    let catalog = Catalog::load(config.general.catalog_path.as_deref(), &config.general.language)
        .context("Failed to load message catalog")?;
    info!("Message catalog ready for language: {}", catalog.language());

    let gateway = SqliteGateway::new(
        config.database.address.clone(),
        config.database.query_timeout,
    );

    let bot = Bot::new(&config.telegram.bot_token);
    let bot_username = match bot.get_me().await {
        Ok(me) => me.user.username.clone(),
        Err(e) => {
            warn!("Failed to fetch bot identity: {}", e);
            None
        }
    };
    if let Some(username) = &bot_username {
        info!("Authorized as @{}", username);
    }

    let state = Arc::new(AppState::new(
        config,
        catalog,
        Box::new(gateway),
        bot_username,
    ));

    info!("Bot is starting...");
    platform::telegram::run(state, bot).await?;

    Ok(())
}
