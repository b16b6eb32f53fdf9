//! Local order store persisted to a JSON snapshot file.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use preorder_core::{Clock, OrderInfo, OrderType, SystemClock};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "preorder-storage";

/// What happened when the snapshot was read at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLoad {
    InMemory,
    Missing,
    Corrupt,
    Loaded(usize),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

type OrderMap = HashMap<String, OrderInfo>;

/// Orders keyed by id. Every mutation rewrites the whole snapshot under the lock; a
/// mutation whose write fails is rolled back.
#[derive(Debug)]
pub struct OrderStore {
    snapshot_path: Option<PathBuf>,
    orders: Mutex<OrderMap>,
    load_status: SnapshotLoad,
}

impl OrderStore {
    pub fn in_memory() -> Self {
        Self {
            snapshot_path: None,
            orders: Mutex::new(HashMap::new()),
            load_status: SnapshotLoad::InMemory,
        }
    }

    /// Load the snapshot at `path`. Never fails: a missing or unreadable snapshot
    /// yields an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (orders, load_status) = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<OrderMap>(&bytes) {
                Ok(orders) => {
                    info!(path = %path.display(), orders = orders.len(), "loaded order snapshot");
                    let count = orders.len();
                    (orders, SnapshotLoad::Loaded(count))
                }
                Err(err) => {
                    error!(path = %path.display(), error = %err, "order snapshot is corrupt, starting empty");
                    (HashMap::new(), SnapshotLoad::Corrupt)
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "order snapshot not found, starting empty");
                (HashMap::new(), SnapshotLoad::Missing)
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "order snapshot is unreadable, starting empty");
                (HashMap::new(), SnapshotLoad::Corrupt)
            }
        };

        Self {
            snapshot_path: Some(path),
            orders: Mutex::new(orders),
            load_status,
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn load_status(&self) -> SnapshotLoad {
        self.load_status
    }

    pub async fn len(&self) -> usize {
        self.orders.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.orders.lock().await.is_empty()
    }

    pub async fn get(&self, id: &str) -> Option<OrderInfo> {
        self.orders.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> HashSet<String> {
        self.orders.lock().await.keys().cloned().collect()
    }

    pub async fn list(&self, filter: OrderType) -> Vec<OrderInfo> {
        self.list_at(filter, SystemClock.today()).await
    }

    /// Orders matching `filter`, sorted by release date then id.
    pub async fn list_at(&self, filter: OrderType, today: NaiveDate) -> Vec<OrderInfo> {
        let orders = self.orders.lock().await;
        let mut out = orders
            .values()
            .filter(|info| filter.matches(info, today))
            .cloned()
            .collect::<Vec<_>>();
        sort_orders(&mut out);
        out
    }

    /// Orders released in the month of `today` or the month before, regardless of
    /// status unless `include_finished` is false.
    pub async fn current_at(&self, today: NaiveDate, include_finished: bool) -> Vec<OrderInfo> {
        let orders = self.orders.lock().await;
        let mut out = orders
            .values()
            .filter(|info| include_finished || info.is_open())
            .filter(|info| info.releases_around(today))
            .cloned()
            .collect::<Vec<_>>();
        sort_orders(&mut out);
        out
    }

    pub async fn upsert(&self, info: OrderInfo) -> Result<(), StoreError> {
        let id = info.id().to_string();
        let mut orders = self.orders.lock().await;
        let previous = orders.insert(id.clone(), info);
        if let Err(err) = self.flush(&orders).await {
            match previous {
                Some(previous) => orders.insert(id, previous),
                None => orders.remove(&id),
            };
            return Err(err);
        }
        debug!(order_id = %id, "upserted order");
        Ok(())
    }

    /// Remove `id`. Returns whether an entry was removed; an absent id is not an error.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut orders = self.orders.lock().await;
        let Some(removed) = orders.remove(id) else {
            return Ok(false);
        };
        if let Err(err) = self.flush(&orders).await {
            orders.insert(id.to_string(), removed);
            return Err(err);
        }
        debug!(order_id = %id, "deleted order");
        Ok(true)
    }

    /// Drop every entry whose id is not in `existing_ids`. Returns the removed ids.
    pub async fn reconcile(&self, existing_ids: &HashSet<String>) -> Result<Vec<String>, StoreError> {
        let mut orders = self.orders.lock().await;
        let stale = orders
            .keys()
            .filter(|id| !existing_ids.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        if stale.is_empty() {
            return Ok(stale);
        }

        let removed = stale
            .iter()
            .filter_map(|id| orders.remove(id).map(|info| (id.clone(), info)))
            .collect::<Vec<_>>();
        if let Err(err) = self.flush(&orders).await {
            orders.extend(removed);
            return Err(err);
        }
        info!(removed = stale.len(), "pruned orders missing from remote listing");
        Ok(stale)
    }

    /// Replace the snapshot with the full mapping via a temp file and atomic rename.
    async fn flush(&self, orders: &OrderMap) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(orders)?;

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::io("creating snapshot directory", &parent, err))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "orders.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = write_temp(&temp_path, &bytes).await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io("renaming snapshot into place", path, err));
        }
        Ok(())
    }
}

async fn write_temp(temp_path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(|err| StoreError::io("opening temp snapshot", temp_path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| StoreError::io("writing temp snapshot", temp_path, err))?;
    file.sync_all()
        .await
        .map_err(|err| StoreError::io("syncing temp snapshot", temp_path, err))?;
    Ok(())
}

fn sort_orders(orders: &mut [OrderInfo]) {
    orders.sort_by(|a, b| {
        a.order
            .scheduled_release
            .cmp(&b.order.scheduled_release)
            .then_with(|| a.order.id.cmp(&b.order.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use preorder_core::{Item, Order};
    use tempfile::tempdir;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn info(id: &str, status: &str, release: NaiveDate) -> OrderInfo {
        OrderInfo::new(
            Order::new(id, status, release, 12000),
            vec![Item {
                id: format!("{id}_0"),
                code: "FIGURE-1".into(),
                name: "Figure 1/7".into(),
                thumbnail: "/images/thumb.jpg".into(),
                release_date: release,
                price: 12000,
                amount: 1,
                stock_flag: 0,
            }],
        )
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let store = OrderStore::in_memory();
        let x = info("A", "Pre-order", date(2025, 2));
        store.upsert(x.clone()).await.unwrap();
        store.upsert(x.clone()).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("A").await, Some(x));

        let replaced = info("A", "Shipped", date(2025, 2));
        store.upsert(replaced.clone()).await.unwrap();
        assert_eq!(store.get("A").await, Some(replaced));
    }

    #[tokio::test]
    async fn delete_absent_is_noop() {
        let store = OrderStore::in_memory();
        assert!(!store.delete("missing").await.unwrap());
        store.upsert(info("A", "Pre-order", date(2025, 2))).await.unwrap();
        assert!(store.delete("A").await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn reconcile_prunes_missing_ids() {
        let store = OrderStore::in_memory();
        for id in ["A", "B", "C"] {
            store.upsert(info(id, "Pre-order", date(2025, 2))).await.unwrap();
        }

        let removed = store.reconcile(&set(&["A", "C"])).await.unwrap();
        assert_eq!(removed, vec!["B".to_string()]);
        assert_eq!(store.ids().await, set(&["A", "C"]));

        let removed = store.reconcile(&set(&["A", "C"])).await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(store.ids().await, set(&["A", "C"]));

        store.reconcile(&HashSet::new()).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn list_filters_by_order_type() {
        let store = OrderStore::in_memory();
        store.upsert(info("open-now", "Pre-order", date(2025, 6))).await.unwrap();
        store.upsert(info("open-last", "New order", date(2025, 5))).await.unwrap();
        store.upsert(info("open-later", "Pre-order", date(2025, 12))).await.unwrap();
        store.upsert(info("shipped", "Shipped", date(2025, 6))).await.unwrap();
        let today = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();

        let ids = |orders: Vec<OrderInfo>| orders.into_iter().map(|o| o.order.id).collect::<Vec<_>>();
        assert_eq!(store.list_at(OrderType::All, today).await.len(), 4);
        assert_eq!(
            ids(store.list_at(OrderType::Open, today).await),
            vec!["open-last", "open-now", "open-later"]
        );
        assert_eq!(ids(store.list_at(OrderType::Shipped, today).await), vec!["shipped"]);
        // Judgment call: current month = open orders released this month or last month.
        assert_eq!(
            ids(store.list_at(OrderType::CurrentMonth, today).await),
            vec!["open-last", "open-now"]
        );
        assert_eq!(
            ids(store.current_at(today, true).await),
            vec!["open-last", "open-now", "shipped"]
        );
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("orders.json");

        let store = OrderStore::open(&path).await;
        assert_eq!(store.load_status(), SnapshotLoad::Missing);
        store.upsert(info("A", "Pre-order", date(2025, 2))).await.unwrap();
        store.upsert(info("B", "Shipped", date(2025, 1))).await.unwrap();
        store.delete("B").await.unwrap();

        let reopened = OrderStore::open(&path).await;
        assert_eq!(reopened.load_status(), SnapshotLoad::Loaded(1));
        assert_eq!(reopened.get("A").await, store.get("A").await);
        assert!(reopened.get("B").await.is_none());

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn corrupt_snapshot_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("orders.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = OrderStore::open(&path).await;
        assert_eq!(store.load_status(), SnapshotLoad::Corrupt);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn failed_flush_rolls_back_mutation() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"regular file").unwrap();
        let store = OrderStore::open(blocker.join("orders.json")).await;

        let err = store.upsert(info("A", "Pre-order", date(2025, 2))).await;
        assert!(matches!(err, Err(StoreError::Io { .. })));
        assert!(store.get("A").await.is_none());
    }
}
