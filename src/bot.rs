use anyhow::Result;
use teloxide::utils::html;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, MessageKey};
use crate::config::Config;
use crate::database::{render_row, Gateway, QueryResult};
use crate::platform::{IncomingMessage, Reply, Responder};

/// Result rows sent per reply message
pub const ROWS_PER_MESSAGE: usize = 5;

/// Stay under Telegram's 4096 char limit
const MAX_MESSAGE_LEN: usize = 4000;

/// Shared application state
pub struct AppState {
    config: Config,
    catalog: Catalog,
    /// Held for a whole connect..disconnect cycle so query cycles never interleave
    gateway: Mutex<Box<dyn Gateway>>,
    bot_username: Option<String>,
}

impl AppState {
    pub fn new(
        config: Config,
        catalog: Catalog,
        gateway: Box<dyn Gateway>,
        bot_username: Option<String>,
    ) -> Self {
        Self {
            config,
            catalog,
            gateway: Mutex::new(gateway),
            bot_username,
        }
    }
}

/// How an inbound message is routed
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// `/start` or `/help`
    Help,
    /// Anything else, relayed to the database verbatim
    Query(&'a str),
}

/// Commands are matched before the catch-all. A command may carry
/// `@<bot username>` and trailing arguments; a mention of another bot is
/// not a command for us.
pub fn classify<'a>(text: Option<&'a str>, bot_username: Option<&str>) -> Inbound<'a> {
    let Some(text) = text else {
        return Inbound::Query("");
    };

    let first = text.split(char::is_whitespace).next().unwrap_or_default();
    let (command, mention) = match first.split_once('@') {
        Some((command, mention)) => (command, Some(mention)),
        None => (first, None),
    };

    let addressed_to_us = match (mention, bot_username) {
        (Some(mention), Some(me)) => mention.eq_ignore_ascii_case(me),
        _ => true,
    };

    if addressed_to_us && matches!(command, "/start" | "/help") {
        Inbound::Help
    } else {
        Inbound::Query(text)
    }
}

/// Group rendered rows into reply texts of `ROWS_PER_MESSAGE` rows each
pub fn paginate(result: &QueryResult) -> Vec<String> {
    result
        .rows
        .chunks(ROWS_PER_MESSAGE)
        .map(|chunk| {
            chunk
                .iter()
                .map(|row| render_row(row))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect()
}

/// Split long messages for Telegram's 4096 char limit
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

/// Answer one inbound message
pub async fn handle_incoming(
    state: &AppState,
    incoming: &IncomingMessage,
    responder: &dyn Responder,
) -> Result<()> {
    let inbound = classify(incoming.text.as_deref(), state.bot_username.as_deref());

    if incoming.chat_id != state.config.telegram.admin_chat_id {
        warn!("Blocked message from unauthorized chat {}", incoming.chat_id);
        let block = state.catalog.lookup(MessageKey::Block)?;
        return responder.reply(Reply::plain(block)).await;
    }

    match inbound {
        Inbound::Help => {
            info!("Help requested by admin chat {}", incoming.chat_id);
            let start = state.catalog.lookup(MessageKey::Start)?;
            responder
                .reply(Reply::plain(start).with_button(state.config.docs_button.clone()))
                .await
        }
        Inbound::Query(sql) => {
            info!("Query from admin chat {}: {}", incoming.chat_id, sql);
            run_query(state, sql, responder).await
        }
    }
}

async fn run_query(state: &AppState, sql: &str, responder: &dyn Responder) -> Result<()> {
    let mut gateway = state.gateway.lock().await;

    let outcome = relay_query(&mut **gateway, &state.catalog, sql, responder).await;
    let reported = match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            error!("Query failed: {:#}", e);
            report_error(&state.catalog, &e, responder).await
        }
    };

    // Cleanup failures are logged so they never replace the reported outcome
    if let Err(e) = gateway.disconnect().await {
        warn!("Failed to disconnect from database: {}", e);
    }

    reported
}

async fn relay_query(
    gateway: &mut dyn Gateway,
    catalog: &Catalog,
    sql: &str,
    responder: &dyn Responder,
) -> Result<()> {
    gateway.connect().await?;
    let result = gateway.execute_query(sql).await?;

    if result.is_empty() {
        let done = catalog.lookup(MessageKey::SuccessNoMessage)?;
        responder.reply(Reply::plain(done)).await?;
        return Ok(());
    }

    let pages = paginate(&result);
    debug!("Sending {} row(s) in {} message(s)", result.len(), pages.len());
    for page in pages {
        for part in split_message(&page, MAX_MESSAGE_LEN) {
            responder.reply(Reply::plain(part)).await?;
        }
    }

    Ok(())
}

/// Render `<b>ERROR</b>` followed by the error text in a `<pre>` block
fn error_reply(catalog: &Catalog, error: &anyhow::Error) -> Result<Reply> {
    let label = catalog.lookup(MessageKey::Error)?;
    Ok(Reply::html(format!(
        "{}\n\n{}",
        html::bold(&html::escape(label)),
        html::code_block(&error.to_string())
    )))
}

async fn report_error(
    catalog: &Catalog,
    error: &anyhow::Error,
    responder: &dyn Responder,
) -> Result<()> {
    let reply = error_reply(catalog, error)?;
    responder.reply(reply).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DbError, SqliteGateway};
    use crate::platform::ReplyFormat;
    use async_trait::async_trait;
    use rusqlite::types::Value;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    const ADMIN: i64 = 1000;
    const STRANGER: i64 = 2000;

    const CONFIG: &str = r#"
        [telegram]
        bot_token = "123:abc"
        admin_chat_id = 1000
        [general]
        language = "en"
        [database]
        address = "unused.sqlite3"
        [docs]
        url = "https://example.com/queries"
        label = "Docs"
    "#;

    enum Script {
        Rows(usize),
        Fail,
        FailConnect,
    }

    /// Records every gateway call and answers from a script
    struct FakeGateway {
        script: Script,
        calls: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Gateway for FakeGateway {
        async fn connect(&mut self) -> Result<(), DbError> {
            self.calls.lock().unwrap().push("connect".to_string());
            match self.script {
                Script::FailConnect => Err(DbError::Timeout(Duration::from_secs(3))),
                _ => Ok(()),
            }
        }

        async fn execute_query(&mut self, sql: &str) -> Result<QueryResult, DbError> {
            self.calls.lock().unwrap().push(format!("execute:{}", sql));
            match self.script {
                Script::Rows(n) => Ok(QueryResult {
                    columns: vec!["id".to_string()],
                    rows: (1..=n as i64).map(|i| vec![Value::Integer(i)]).collect(),
                }),
                Script::Fail => Err(DbError::Timeout(Duration::from_secs(30))),
                Script::FailConnect => Err(DbError::NotConnected),
            }
        }

        async fn disconnect(&mut self) -> Result<(), DbError> {
            self.calls.lock().unwrap().push("disconnect".to_string());
            match self.script {
                Script::FailConnect => Err(DbError::NotConnected),
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct RecordingResponder {
        replies: StdMutex<Vec<Reply>>,
        /// Fail every plain-text send after this many successful ones
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl Responder for RecordingResponder {
        async fn reply(&self, reply: Reply) -> Result<()> {
            let mut replies = self.replies.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if reply.format == ReplyFormat::Plain && replies.len() >= limit {
                    anyhow::bail!("Bad Request: chat not found");
                }
            }
            replies.push(reply);
            Ok(())
        }
    }

    impl RecordingResponder {
        fn texts(&self) -> Vec<String> {
            self.replies
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.text.clone())
                .collect()
        }
    }

    fn state_with(gateway: Box<dyn Gateway>) -> AppState {
        let config = Config::from_toml(CONFIG).unwrap();
        let catalog = Catalog::load(None, "en").unwrap();
        AppState::new(config, catalog, gateway, Some("sqlar_bot".to_string()))
    }

    fn fake_state(script: Script) -> (AppState, Arc<StdMutex<Vec<String>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let gateway = FakeGateway {
            script,
            calls: Arc::clone(&calls),
        };
        (state_with(Box::new(gateway)), calls)
    }

    fn message(chat_id: i64, text: &str) -> IncomingMessage {
        IncomingMessage {
            chat_id,
            text: Some(text.to_string()),
        }
    }

    fn text_of(state: &AppState, key: MessageKey) -> String {
        state.catalog.lookup(key).unwrap().to_string()
    }

    #[test]
    fn test_classify() {
        let me = Some("sqlar_bot");
        assert_eq!(classify(Some("/start"), me), Inbound::Help);
        assert_eq!(classify(Some("/help"), me), Inbound::Help);
        assert_eq!(classify(Some("/start payload"), me), Inbound::Help);
        assert_eq!(classify(Some("/help@SQLAR_bot"), me), Inbound::Help);
        assert_eq!(classify(Some("/help@other_bot"), me), Inbound::Query("/help@other_bot"));
        assert_eq!(classify(Some("/starting"), me), Inbound::Query("/starting"));
        assert_eq!(classify(Some("SELECT 1"), me), Inbound::Query("SELECT 1"));
        assert_eq!(classify(Some(" /start"), me), Inbound::Query(" /start"));
        assert_eq!(classify(None, me), Inbound::Query(""));
        assert_eq!(classify(Some("/start@anyone"), None), Inbound::Help);
    }

    #[test]
    fn test_paginate_preserves_order() {
        let result = QueryResult {
            columns: vec!["n".to_string()],
            rows: (1..=12).map(|i| vec![Value::Integer(i)]).collect(),
        };
        let pages = paginate(&result);
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0], "(1,)\n(2,)\n(3,)\n(4,)\n(5,)");
        assert_eq!(pages[1], "(6,)\n(7,)\n(8,)\n(9,)\n(10,)");
        assert_eq!(pages[2], "(11,)\n(12,)");
    }

    #[test]
    fn test_split_message() {
        assert_eq!(split_message("short", 10), vec!["short"]);

        let text = "aaaa\nbbbb\ncccc";
        assert_eq!(split_message(text, 10), vec!["aaaa\nbbbb\n", "cccc"]);

        let text = "ééééé";
        let parts = split_message(text, 3);
        assert_eq!(parts.concat(), text);
        assert!(parts.iter().all(|p| p.len() <= 3));
    }

    #[tokio::test]
    async fn test_stranger_is_blocked_without_database_calls() {
        for text in ["/start", "/help", "SELECT * FROM users"] {
            let (state, calls) = fake_state(Script::Rows(3));
            let responder = RecordingResponder::default();

            handle_incoming(&state, &message(STRANGER, text), &responder)
                .await
                .unwrap();

            assert_eq!(responder.texts(), vec![text_of(&state, MessageKey::Block)]);
            assert!(calls.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_stranger_without_text_is_blocked() {
        let (state, calls) = fake_state(Script::Rows(1));
        let responder = RecordingResponder::default();
        let incoming = IncomingMessage {
            chat_id: STRANGER,
            text: None,
        };

        handle_incoming(&state, &incoming, &responder).await.unwrap();

        assert_eq!(responder.texts(), vec![text_of(&state, MessageKey::Block)]);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_start_has_docs_button() {
        let (state, calls) = fake_state(Script::Rows(3));
        let responder = RecordingResponder::default();

        handle_incoming(&state, &message(ADMIN, "/start"), &responder)
            .await
            .unwrap();

        let replies = responder.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].text, text_of(&state, MessageKey::Start));
        assert_eq!(replies[0].format, ReplyFormat::Plain);
        let button = replies[0].button.as_ref().unwrap();
        assert_eq!(button.label, "Docs");
        assert_eq!(button.url.as_str(), "https://example.com/queries");
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_empty_result() {
        let (state, calls) = fake_state(Script::Rows(0));
        let responder = RecordingResponder::default();

        handle_incoming(&state, &message(ADMIN, "DELETE FROM users"), &responder)
            .await
            .unwrap();

        assert_eq!(
            responder.texts(),
            vec![text_of(&state, MessageKey::SuccessNoMessage)]
        );
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["connect", "execute:DELETE FROM users", "disconnect"]
        );
    }

    #[tokio::test]
    async fn test_admin_rows_are_chunked() {
        let (state, calls) = fake_state(Script::Rows(12));
        let responder = RecordingResponder::default();

        handle_incoming(&state, &message(ADMIN, "SELECT id FROM users"), &responder)
            .await
            .unwrap();

        let texts = responder.texts();
        assert_eq!(texts.len(), 3);
        let sizes: Vec<usize> = texts.iter().map(|t| t.lines().count()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert!(texts[0].starts_with("(1,)\n"));
        assert_eq!(texts[2], "(11,)\n(12,)");
        assert!(responder
            .replies
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.format == ReplyFormat::Plain && r.button.is_none()));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|c| *c == "disconnect").count(), 1);
    }

    #[tokio::test]
    async fn test_admin_exact_chunk_boundary() {
        let (state, _) = fake_state(Script::Rows(10));
        let responder = RecordingResponder::default();

        handle_incoming(&state, &message(ADMIN, "SELECT id FROM users"), &responder)
            .await
            .unwrap();

        assert_eq!(responder.texts().len(), 2);
    }

    #[tokio::test]
    async fn test_admin_query_error_is_reported() {
        let (state, calls) = fake_state(Script::Fail);
        let responder = RecordingResponder::default();

        handle_incoming(&state, &message(ADMIN, "SELECT 1"), &responder)
            .await
            .unwrap();

        let replies = responder.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].format, ReplyFormat::Html);
        assert_eq!(
            replies[0].text,
            "<b>Error</b>\n\n<pre>Query timed out after 30s</pre>"
        );
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["connect", "execute:SELECT 1", "disconnect"]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_still_disconnects_once() {
        let (state, calls) = fake_state(Script::FailConnect);
        let responder = RecordingResponder::default();

        handle_incoming(&state, &message(ADMIN, "SELECT 1"), &responder)
            .await
            .unwrap();

        let texts = responder.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Query timed out after 3s"));
        assert_eq!(*calls.lock().unwrap(), vec!["connect", "disconnect"]);
    }

    #[tokio::test]
    async fn test_send_failure_becomes_error_reply() {
        let (state, calls) = fake_state(Script::Rows(12));
        let responder = RecordingResponder {
            fail_after: Some(1),
            ..Default::default()
        };

        handle_incoming(&state, &message(ADMIN, "SELECT id FROM users"), &responder)
            .await
            .unwrap();

        let replies = responder.replies.lock().unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[1].format, ReplyFormat::Html);
        assert!(replies[1].text.contains("Bad Request: chat not found"));
        assert_eq!(calls.lock().unwrap().last().unwrap(), "disconnect");
    }

    #[tokio::test]
    async fn test_admin_message_without_text() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = SqliteGateway::new(
            dir.path().join("test.db").to_string_lossy(),
            Duration::from_secs(5),
        );
        let state = state_with(Box::new(gateway));
        let responder = RecordingResponder::default();
        let incoming = IncomingMessage {
            chat_id: ADMIN,
            text: None,
        };

        handle_incoming(&state, &incoming, &responder).await.unwrap();

        let texts = responder.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].contains("Query text is empty"));
    }

    #[tokio::test]
    async fn test_admin_multiple_statements_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = SqliteGateway::new(
            dir.path().join("test.db").to_string_lossy(),
            Duration::from_secs(5),
        );
        let state = state_with(Box::new(gateway));
        for sql in [
            "CREATE TABLE a (x INTEGER)",
            "INSERT INTO a (x) VALUES (1), (2)",
        ] {
            handle_incoming(&state, &message(ADMIN, sql), &RecordingResponder::default())
                .await
                .unwrap();
        }

        let responder = RecordingResponder::default();
        handle_incoming(
            &state,
            &message(ADMIN, "DELETE FROM a WHERE x = 1; DELETE FROM a WHERE x = 2"),
            &responder,
        )
        .await
        .unwrap();
        let replies = responder.replies.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].format, ReplyFormat::Html);
        assert!(replies[0]
            .text
            .contains("Only one SQL statement per message is supported"));

        let responder = RecordingResponder::default();
        handle_incoming(&state, &message(ADMIN, "SELECT count(*) FROM a"), &responder)
            .await
            .unwrap();
        assert_eq!(responder.texts(), vec!["(2,)".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = SqliteGateway::new(
            dir.path().join("test.db").to_string_lossy(),
            Duration::from_secs(5),
        );
        let state = state_with(Box::new(gateway));

        let responder = RecordingResponder::default();
        for sql in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY, username TEXT)",
            "INSERT INTO users (username) VALUES ('a'), ('b'), ('c'), ('d'), ('e'), ('f<g>')",
        ] {
            handle_incoming(&state, &message(ADMIN, sql), &responder)
                .await
                .unwrap();
        }
        let done = text_of(&state, MessageKey::SuccessNoMessage);
        assert_eq!(responder.texts(), vec![done.clone(), done]);

        let responder = RecordingResponder::default();
        handle_incoming(
            &state,
            &message(ADMIN, "SELECT id, username FROM users ORDER BY id"),
            &responder,
        )
        .await
        .unwrap();
        assert_eq!(
            responder.texts(),
            vec![
                "(1, 'a')\n(2, 'b')\n(3, 'c')\n(4, 'd')\n(5, 'e')".to_string(),
                "(6, 'f<g>')".to_string(),
            ]
        );

        let responder = RecordingResponder::default();
        handle_incoming(&state, &message(ADMIN, "SELECT * FROM <nope>"), &responder)
            .await
            .unwrap();
        let texts = responder.texts();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].starts_with("<b>Error</b>\n\n<pre>"));
        assert!(texts[0].contains("&lt;"));
        assert!(!texts[0].contains("<nope>"));
    }
}
