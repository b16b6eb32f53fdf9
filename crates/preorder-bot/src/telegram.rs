use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::{BotCommand, BotError, BotHandler, BotUser, Replies};

const MESSAGE_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub api_base: String,
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    /// `None` when `TELEGRAM_BOT_TOKEN` is unset.
    pub fn from_env() -> Option<Self> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        Some(Self {
            token,
            api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            poll_timeout_secs: 30,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    from: Option<User>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    username: Option<String>,
}

pub struct TelegramTransport {
    http: reqwest::Client,
    base: String,
    poll_timeout_secs: u64,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self, BotError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 10))
            .build()?;
        Ok(Self {
            http,
            base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), config.token),
            poll_timeout_secs: config.poll_timeout_secs,
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: serde_json::Value,
    ) -> Result<T, BotError> {
        let response: ApiResponse<T> = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        match response.result {
            Some(result) if response.ok => Ok(result),
            _ => Err(BotError::Api {
                method,
                description: response.description.unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }

    async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, BotError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), BotError> {
        for chunk in split_message(text, MESSAGE_LIMIT) {
            let _: serde_json::Value = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }

    /// Fetches one batch of updates and dispatches the commands in it. Returns the
    /// offset for the next call.
    pub async fn poll_once(
        &self,
        handler: &BotHandler,
        offset: Option<i64>,
    ) -> Result<Option<i64>, BotError> {
        let updates = self.get_updates(offset).await?;
        let mut next = offset;
        for update in updates {
            next = Some(update.update_id + 1);
            let Some(message) = update.message else {
                continue;
            };
            let (Some(from), Some(text)) = (message.from, message.text) else {
                continue;
            };
            let Some(command) = BotCommand::parse(&text) else {
                debug!(chat_id = message.chat.id, "ignoring non-command message");
                continue;
            };
            let user = BotUser {
                id: from.id,
                username: from.username,
            };
            let replies = ChatReplies {
                transport: self,
                chat_id: message.chat.id,
            };
            if let Err(err) = handler.handle(&user, command, &replies).await {
                error!(chat_id = message.chat.id, error = %err, "failed to reply");
            }
        }
        Ok(next)
    }
}

struct ChatReplies<'a> {
    transport: &'a TelegramTransport,
    chat_id: i64,
}

#[async_trait]
impl<'a> Replies for ChatReplies<'a> {
    async fn send(&self, text: String) -> Result<(), BotError> {
        self.transport.send_message(self.chat_id, &text).await
    }
}

/// Long-polls forever. Transport failures are logged and retried after a pause.
pub async fn run_polling(handler: Arc<BotHandler>, transport: TelegramTransport) {
    info!("telegram bot polling started");
    let mut offset = None;
    loop {
        match transport.poll_once(&handler, offset).await {
            Ok(next) => offset = next,
            Err(err) => {
                warn!(error = %err, "telegram polling failed");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

/// Splits on line boundaries so each chunk has at most `limit` characters.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split('\n') {
        let line_len = line.chars().count();
        let needed = if current.is_empty() { line_len } else { current_len + 1 + line_len };
        if needed <= limit {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
            current_len = needed;
            continue;
        }
        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        let chars = line.chars().collect::<Vec<_>>();
        let mut pieces = chars.chunks(limit).map(|c| c.iter().collect::<String>()).peekable();
        while let Some(piece) = pieces.next() {
            if pieces.peek().is_some() {
                chunks.push(piece);
            } else {
                current_len = piece.chars().count();
                current = piece;
            }
        }
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Whitelist;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use preorder_client::FakeStorefront;
    use preorder_storage::OrderStore;
    use preorder_sync::SyncEngine;
    use serde_json::Value;
    use std::sync::Mutex;

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("a\nb", 10), vec!["a\nb".to_string()]);
        assert_eq!(split_message("", 10), vec![String::new()]);
    }

    #[test]
    fn long_messages_split_on_lines() {
        assert_eq!(
            split_message("aaaa\nbbbb\ncc", 9),
            vec!["aaaa\nbbbb".to_string(), "cc".to_string()]
        );
        assert_eq!(
            split_message("abcdefgh\nij", 3),
            vec!["abc".to_string(), "def".to_string(), "gh".to_string(), "ij".to_string()]
        );
    }

    #[derive(Default)]
    struct Remote {
        sent: Mutex<Vec<Value>>,
        offsets: Mutex<Vec<Value>>,
    }

    async fn get_updates(State(remote): State<Arc<Remote>>, Json(body): Json<Value>) -> Json<Value> {
        remote.offsets.lock().unwrap().push(body["offset"].clone());
        Json(json!({
            "ok": true,
            "result": [
                {"update_id": 10, "message": {
                    "message_id": 1,
                    "chat": {"id": 42},
                    "from": {"id": 42, "username": "owner"},
                    "text": "/show_open"
                }},
                {"update_id": 11, "message": {
                    "message_id": 2,
                    "chat": {"id": 42},
                    "from": {"id": 42, "username": "owner"},
                    "text": "hello"
                }}
            ]
        }))
    }

    async fn send_message(State(remote): State<Arc<Remote>>, Json(body): Json<Value>) -> Json<Value> {
        remote.sent.lock().unwrap().push(body);
        Json(json!({"ok": true, "result": {"message_id": 3}}))
    }

    #[tokio::test]
    async fn poll_dispatches_commands_and_advances_offset() {
        let remote = Arc::new(Remote::default());
        let app = Router::new()
            .route("/bottest-token/getUpdates", post(get_updates))
            .route("/bottest-token/sendMessage", post(send_message))
            .with_state(remote.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let transport = TelegramTransport::new(&TelegramConfig {
            token: "test-token".into(),
            api_base: format!("http://{addr}/"),
            poll_timeout_secs: 0,
        })
        .unwrap();
        let engine = SyncEngine::new(
            Arc::new(FakeStorefront::default()),
            Arc::new(OrderStore::in_memory()),
            1,
        );
        let handler = BotHandler::new(Arc::new(engine), Whitelist::from_csv("owner"), 0.0066);

        let next = transport.poll_once(&handler, Some(5)).await.unwrap();
        assert_eq!(next, Some(12));
        assert_eq!(remote.offsets.lock().unwrap().clone(), vec![json!(5)]);
        assert_eq!(
            remote.sent.lock().unwrap().clone(),
            vec![json!({"chat_id": 42, "text": "No open orders."})]
        );
    }
}
