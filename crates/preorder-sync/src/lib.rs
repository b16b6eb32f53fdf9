//! Order synchronization: remote listing, bounded detail fetches, store reconciliation.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use preorder_client::{
    ClientError, Credentials, HttpClientConfig, HttpStorefrontClient, Session, StorefrontApi,
    DEFAULT_API_ROOT,
};
use preorder_core::{Clock, Order, OrderInfo, OrderType, SystemClock};
use preorder_storage::{OrderStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod report;

pub use report::report_stats_text;

pub const CRATE_NAME: &str = "preorder-sync";

pub const DEFAULT_PARALLELISM: usize = 3;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_file: PathBuf,
    pub api_root: String,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub parallelism: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub jpy_to_usd: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_file: PathBuf::from("./orders.json"),
            api_root: DEFAULT_API_ROOT.to_string(),
            http_timeout_secs: 20,
            user_agent: None,
            parallelism: DEFAULT_PARALLELISM,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            jpy_to_usd: 0.0066,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store_file: std::env::var("PREORDER_STORE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.store_file),
            api_root: std::env::var("PREORDER_API_ROOT").unwrap_or(defaults.api_root),
            http_timeout_secs: std::env::var("PREORDER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("PREORDER_USER_AGENT").ok(),
            parallelism: std::env::var("PREORDER_SYNC_PARALLELISM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.parallelism),
            scheduler_enabled: std::env::var("PREORDER_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("PREORDER_SYNC_CRON").unwrap_or(defaults.sync_cron),
            jpy_to_usd: std::env::var("PREORDER_JPY_TO_USD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.jpy_to_usd),
        }
    }
}

pub fn credentials_from_env() -> Result<Credentials> {
    Ok(Credentials {
        username: std::env::var("PREORDER_LOGIN").context("PREORDER_LOGIN must be set")?,
        password: std::env::var("PREORDER_PASSWORD").context("PREORDER_PASSWORD must be set")?,
    })
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("login failed: {0}")]
    Login(#[source] ClientError),
    #[error("listing {order_type} orders failed: {source}")]
    Listing {
        order_type: OrderType,
        #[source]
        source: ClientError,
    },
    #[error("updating local store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub order_type: OrderType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed: usize,
    pub refreshed: Vec<String>,
    pub failed: Vec<String>,
    pub pruned: Vec<String>,
    pub orders: Vec<OrderInfo>,
}

enum DetailOutcome {
    Refreshed(String),
    Failed(String),
}

pub struct SyncEngine {
    api: Arc<dyn StorefrontApi>,
    store: Arc<OrderStore>,
    clock: Arc<dyn Clock>,
    gate: Arc<Semaphore>,
    session: Mutex<Option<Session>>,
}

impl SyncEngine {
    pub fn new(api: Arc<dyn StorefrontApi>, store: Arc<OrderStore>, parallelism: usize) -> Self {
        Self {
            api,
            store,
            clock: Arc::new(SystemClock),
            gate: Arc::new(Semaphore::new(parallelism.max(1))),
            session: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn sync(&self, order_type: OrderType) -> Result<Vec<OrderInfo>, SyncError> {
        Ok(self.sync_with_report(order_type).await?.orders)
    }

    pub async fn sync_with_report(&self, order_type: OrderType) -> Result<SyncReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, %order_type);
        self.run(run_id, order_type).instrument(span).await
    }

    async fn run(&self, run_id: Uuid, order_type: OrderType) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();

        // The full listing taken here is what the store is reconciled against, even
        // if orders appear remotely while details are being fetched.
        let (listed, everything) = tokio::try_join!(
            self.list_with_relogin(order_type),
            self.list_with_relogin(OrderType::All),
        )?;
        info!(listed = listed.len(), remote_total = everything.len(), "fetched order listings");

        let session = self.session().await?;
        let mut tasks = JoinSet::new();
        // Ids whose task has not reported back; whatever is left after joining crashed.
        let mut pending = HashSet::new();
        for order in &listed {
            let permit = self
                .gate
                .clone()
                .acquire_owned()
                .await
                .expect("admission gate is never closed");
            let api = self.api.clone();
            let store = self.store.clone();
            let session = session.clone();
            let order_id = order.id.clone();
            pending.insert(order_id.clone());
            tasks.spawn(async move {
                let _permit = permit;
                info!(%order_id, "fetching order info");
                match api.order_detail(&session, &order_id).await {
                    Ok(info) => match store.upsert(info).await {
                        Ok(()) => DetailOutcome::Refreshed(order_id),
                        Err(err) => {
                            error!(%order_id, error = %err, "failed to persist order info");
                            DetailOutcome::Failed(order_id)
                        }
                    },
                    Err(err) => {
                        error!(%order_id, error = %err, "error while fetching order info");
                        DetailOutcome::Failed(order_id)
                    }
                }
            });
        }

        let mut refreshed = Vec::new();
        let mut failed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(DetailOutcome::Refreshed(id)) => {
                    pending.remove(&id);
                    refreshed.push(id);
                }
                Ok(DetailOutcome::Failed(id)) => {
                    pending.remove(&id);
                    failed.push(id);
                }
                Err(err) => error!(error = %err, "order detail task aborted"),
            }
        }
        failed.extend(pending);
        refreshed.sort();
        failed.sort();

        let existing = everything.iter().map(|o| o.id.clone()).collect::<HashSet<_>>();
        let pruned = self.store.reconcile(&existing).await?;

        let orders = self.store.list_at(order_type, self.clock.today()).await;
        info!(
            refreshed = refreshed.len(),
            failed = failed.len(),
            pruned = pruned.len(),
            "sync complete"
        );

        Ok(SyncReport {
            run_id,
            order_type,
            started_at,
            finished_at: Utc::now(),
            listed: listed.len(),
            refreshed,
            failed,
            pruned,
            orders,
        })
    }

    async fn session(&self) -> Result<Session, SyncError> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            return Ok(session.clone());
        }
        let session = self.api.login().await.map_err(SyncError::Login)?;
        *current = Some(session.clone());
        Ok(session)
    }

    /// Replace `stale` with a fresh session, unless another caller already did. `None`
    /// means the previous login attempt was itself rejected.
    async fn relogin(&self, stale: Option<&Session>) -> Result<Session, SyncError> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if Some(session) != stale {
                return Ok(session.clone());
            }
        }
        *current = None;
        let session = self.api.login().await.map_err(SyncError::Login)?;
        *current = Some(session.clone());
        Ok(session)
    }

    /// One listing call. A retryable failure of either the login or the call itself
    /// gets one fresh login and one more attempt.
    async fn list_with_relogin(&self, order_type: OrderType) -> Result<Vec<Order>, SyncError> {
        let stale = match self.session().await {
            Ok(session) => match self.api.list_orders(&session, order_type).await {
                Ok(orders) => return Ok(orders),
                Err(err) if err.is_retryable() => {
                    warn!(%order_type, error = %err, "listing failed, logging in again");
                    Some(session)
                }
                Err(source) => return Err(SyncError::Listing { order_type, source }),
            },
            Err(SyncError::Login(err)) if err.is_retryable() => {
                warn!(%order_type, error = %err, "login failed, trying once more");
                None
            }
            Err(err) => return Err(err),
        };

        let session = self.relogin(stale.as_ref()).await?;
        self.api
            .list_orders(&session, order_type)
            .await
            .map_err(|source| SyncError::Listing { order_type, source })
    }
}

pub async fn engine_from_config(config: &SyncConfig, credentials: Credentials) -> Result<SyncEngine> {
    let client = HttpStorefrontClient::new(
        HttpClientConfig {
            api_root: config.api_root.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        },
        credentials,
    )
    .context("building storefront client")?;
    let store = OrderStore::open(&config.store_file).await;
    Ok(SyncEngine::new(
        Arc::new(client),
        Arc::new(store),
        config.parallelism,
    ))
}

pub async fn run_sync_once_from_env(order_type: OrderType) -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let engine = engine_from_config(&config, credentials_from_env()?).await?;
    engine
        .sync_with_report(order_type)
        .await
        .with_context(|| format!("syncing {order_type} orders"))
}

/// Periodic `open` sync, if enabled. The caller starts the returned scheduler.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    engine: Arc<SyncEngine>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let engine = engine.clone();
        Box::pin(async move {
            match engine.sync(OrderType::Open).await {
                Ok(orders) => info!(orders = orders.len(), "scheduled sync finished"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
