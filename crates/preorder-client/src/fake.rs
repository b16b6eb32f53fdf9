//! In-memory storefront used by tests across the workspace.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use preorder_core::{Order, OrderInfo, OrderType};
use tokio::sync::Semaphore;

use crate::{ClientError, Session, StorefrontApi};

#[derive(Default)]
struct FakeState {
    orders: BTreeMap<String, OrderInfo>,
    failing_details: HashSet<String>,
    listing_failures: usize,
    login_failures: usize,
    reject_logins: bool,
    panicking_details: HashSet<String>,
    valid_token: Option<String>,
}

/// Scriptable storefront. Sessions are checked, so expiring them forces callers
/// through a fresh login.
#[derive(Default)]
pub struct FakeStorefront {
    state: Mutex<FakeState>,
    release: Option<Arc<Semaphore>>,
    logins: AtomicUsize,
    listing_calls: AtomicUsize,
    detail_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeStorefront {
    pub fn new(orders: impl IntoIterator<Item = OrderInfo>) -> Self {
        let fake = Self::default();
        fake.set_orders(orders);
        fake
    }

    /// Detail fetches block until the returned semaphore hands out a permit.
    pub fn with_release_gate(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.release = Some(gate.clone());
        (self, gate)
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_orders(&self, orders: impl IntoIterator<Item = OrderInfo>) {
        self.state().orders = orders
            .into_iter()
            .map(|info| (info.id().to_string(), info))
            .collect();
    }

    pub fn remove_order(&self, id: &str) {
        self.state().orders.remove(id);
    }

    pub fn fail_detail(&self, id: &str) {
        self.state().failing_details.insert(id.to_string());
    }

    /// The next `count` listing calls fail with a transport error.
    pub fn fail_next_listings(&self, count: usize) {
        self.state().listing_failures = count;
    }

    /// The next `count` logins are rejected; later ones succeed.
    pub fn reject_next_logins(&self, count: usize) {
        self.state().login_failures = count;
    }

    /// Detail fetches for `id` panic, as a crashed worker would.
    pub fn panic_on_detail(&self, id: &str) {
        self.state().panicking_details.insert(id.to_string());
    }

    pub fn reject_logins(&self, reject: bool) {
        self.state().reject_logins = reject;
    }

    /// Invalidate the currently issued token.
    pub fn expire_sessions(&self) {
        self.state().valid_token = None;
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn listing_calls(&self) -> usize {
        self.listing_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn check_session(&self, session: &Session) -> Result<(), ClientError> {
        match &self.state().valid_token {
            Some(token) if token == session.token() => Ok(()),
            _ => Err(ClientError::Rejected("session expired".to_string())),
        }
    }
}

#[async_trait]
impl StorefrontApi for FakeStorefront {
    async fn login(&self) -> Result<Session, ClientError> {
        let attempt = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state();
        if state.reject_logins {
            return Err(ClientError::Auth("invalid credentials".to_string()));
        }
        if state.login_failures > 0 {
            state.login_failures -= 1;
            return Err(ClientError::Auth("temporarily rejected".to_string()));
        }
        let token = format!("token-{attempt}");
        state.valid_token = Some(token.clone());
        Ok(Session::new(token))
    }

    async fn list_orders(
        &self,
        session: &Session,
        order_type: OrderType,
    ) -> Result<Vec<Order>, ClientError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state();
            if state.listing_failures > 0 {
                state.listing_failures -= 1;
                return Err(ClientError::transport("connection reset by peer"));
            }
        }
        self.check_session(session)?;

        let state = self.state();
        Ok(state
            .orders
            .values()
            .filter(|info| match order_type {
                OrderType::All => true,
                OrderType::Open | OrderType::CurrentMonth => info.is_open(),
                OrderType::Shipped => !info.is_open(),
            })
            .map(|info| info.order.clone())
            .collect())
    }

    async fn order_detail(&self, session: &Session, order_id: &str) -> Result<OrderInfo, ClientError> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.release {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        } else {
            tokio::task::yield_now().await;
        }

        let panics = self.state().panicking_details.contains(order_id);
        if panics {
            panic!("detail worker for {order_id} crashed");
        }

        let result = self.check_session(session).and_then(|()| {
            let state = self.state();
            if state.failing_details.contains(order_id) {
                return Err(ClientError::transport(format!("detail fetch for {order_id} timed out")));
            }
            state
                .orders
                .get(order_id)
                .cloned()
                .ok_or_else(|| ClientError::Rejected(format!("order {order_id} not found")))
        });

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
