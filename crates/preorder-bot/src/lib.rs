//! Chat-bot commands over the sync engine, plus a Telegram long-poll transport.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use preorder_core::{OrderInfo, OrderType};
use preorder_sync::{report_stats_text, SyncEngine};
use thiserror::Error;
use tracing::{info, warn};

mod telegram;

pub use telegram::{run_polling, TelegramConfig, TelegramTransport};

pub const CRATE_NAME: &str = "preorder-bot";

pub const REFUSAL: &str = "You are not allowed to use this bot. Please contact the administrator.";

#[derive(Debug, Error)]
pub enum BotError {
    #[error("telegram transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram rejected {method}: {description}")]
    Api { method: &'static str, description: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Update,
    UpdateFull,
    ShowCurrent,
    ShowOpen,
    UpdateAndShowCurrent,
    Stats,
}

impl BotCommand {
    /// Parses `/command`, `/command@BotName` and ignores trailing arguments.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = word.split('@').next().unwrap_or(word);
        Some(match name {
            "start" => Self::Start,
            "update" => Self::Update,
            "update_full" => Self::UpdateFull,
            "show_current" => Self::ShowCurrent,
            "show_open" => Self::ShowOpen,
            "update_and_show_current" => Self::UpdateAndShowCurrent,
            "stats" => Self::Stats,
            _ => return None,
        })
    }
}

/// Sender of a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotUser {
    pub id: i64,
    pub username: Option<String>,
}

/// Allowed users, matched by numeric id or by username.
#[derive(Debug, Clone, Default)]
pub struct Whitelist(HashSet<String>);

impl Whitelist {
    pub fn from_csv(raw: &str) -> Self {
        Self(
            raw.split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(|entry| entry.trim_start_matches('@').to_string())
                .collect(),
        )
    }

    pub fn allows(&self, user: &BotUser) -> bool {
        self.0.contains(&user.id.to_string())
            || user
                .username
                .as_deref()
                .is_some_and(|name| self.0.contains(name))
    }
}

/// Where command replies go. One call per chat message.
#[async_trait]
pub trait Replies: Send + Sync {
    async fn send(&self, text: String) -> Result<(), BotError>;
}

pub fn format_order(info: &OrderInfo) -> String {
    format!(
        "Order {}: {}, {}, {}¥, items: {}",
        info.order.id,
        info.order.status,
        info.order.scheduled_release,
        info.order.price,
        info.items.len()
    )
}

pub fn format_orders(orders: &[OrderInfo]) -> String {
    orders.iter().map(format_order).collect::<Vec<_>>().join("\n")
}

pub struct BotHandler {
    engine: Arc<SyncEngine>,
    whitelist: Whitelist,
    jpy_to_usd: f64,
}

impl fmt::Debug for BotHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotHandler")
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}

impl BotHandler {
    pub fn new(engine: Arc<SyncEngine>, whitelist: Whitelist, jpy_to_usd: f64) -> Self {
        Self {
            engine,
            whitelist,
            jpy_to_usd,
        }
    }

    pub async fn handle(
        &self,
        user: &BotUser,
        command: BotCommand,
        replies: &dyn Replies,
    ) -> Result<(), BotError> {
        if !self.whitelist.allows(user) {
            warn!(user_id = user.id, username = ?user.username, ?command, "refused command");
            return replies.send(REFUSAL.to_string()).await;
        }
        info!(user_id = user.id, ?command, "handling command");

        match command {
            BotCommand::Start => replies.send("Hello! Now I'm running!".to_string()).await,
            BotCommand::Update => {
                replies.send("Updating open orders...".to_string()).await?;
                match self.engine.sync(OrderType::Open).await {
                    Ok(_) => replies.send("Open orders updated.".to_string()).await,
                    Err(err) => replies.send(format!("Update failed: {err}")).await,
                }
            }
            BotCommand::UpdateFull => {
                replies.send("Full update (all orders)...".to_string()).await?;
                match self.engine.sync(OrderType::All).await {
                    Ok(orders) => {
                        replies
                            .send(format!("All orders updated: {} orders found.", orders.len()))
                            .await
                    }
                    Err(err) => replies.send(format!("Update failed: {err}")).await,
                }
            }
            BotCommand::ShowCurrent => {
                let orders = self.current_orders().await;
                replies.send(listing("Current orders:", "No current orders.", &orders)).await
            }
            BotCommand::ShowOpen => {
                let orders = self.orders(OrderType::Open).await;
                replies.send(listing("All open orders:", "No open orders.", &orders)).await
            }
            BotCommand::UpdateAndShowCurrent => {
                replies
                    .send("Updating and showing current month orders...".to_string())
                    .await?;
                if let Err(err) = self.engine.sync(OrderType::CurrentMonth).await {
                    return replies.send(format!("Update failed: {err}")).await;
                }
                let orders = self.current_orders().await;
                replies
                    .send(listing("Current month orders:", "No current orders.", &orders))
                    .await
            }
            BotCommand::Stats => {
                let orders = self.orders(OrderType::Open).await;
                replies.send(report_stats_text(&orders, self.jpy_to_usd)).await
            }
        }
    }

    async fn orders(&self, order_type: OrderType) -> Vec<OrderInfo> {
        let today = self.engine.clock().today();
        self.engine.store().list_at(order_type, today).await
    }

    async fn current_orders(&self) -> Vec<OrderInfo> {
        let today = self.engine.clock().today();
        self.engine.store().current_at(today, true).await
    }
}

fn listing(title: &str, empty: &str, orders: &[OrderInfo]) -> String {
    if orders.is_empty() {
        empty.to_string()
    } else {
        format!("{title}\n{}", format_orders(orders))
    }
}
