//! Axum JSON API and Askama dashboard over the local order store.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use preorder_core::{Item, OrderInfo, OrderType, OrdersReport};
use preorder_sync::SyncEngine;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "preorder-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub jpy_to_usd: f64,
}

impl AppState {
    pub fn new(engine: Arc<SyncEngine>, jpy_to_usd: f64) -> Self {
        Self { engine, jpy_to_usd }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OrderTypeQuery {
    #[serde(default)]
    order_type: OrderType,
}

#[derive(Debug, Deserialize, Default)]
struct StatsQuery {
    #[serde(default)]
    all: bool,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    report: OrdersReport,
    total_cost_usd: f64,
}

#[derive(Debug, Clone)]
struct DashboardRow {
    id: String,
    link: String,
    status: String,
    release: String,
    items: usize,
    in_stock: usize,
    price: i64,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    rows: Vec<DashboardRow>,
    total_orders: usize,
    total_items: usize,
    total_cost: i64,
    total_cost_usd: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/orders/", get(list_orders_handler))
        .route("/api/orders/update/", post(update_orders_handler))
        .route("/api/orders/{id}/", get(order_handler))
        .route("/api/items/", get(items_handler))
        .route("/api/stats/", get(stats_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn today_orders(state: &AppState, order_type: OrderType) -> Vec<OrderInfo> {
    let today = state.engine.clock().today();
    state.engine.store().list_at(order_type, today).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let orders = today_orders(&state, OrderType::Open).await;
    let report = OrdersReport::build(&orders);
    let rows = orders
        .iter()
        .map(|info| DashboardRow {
            id: info.order.id.clone(),
            link: info.page_link(),
            status: info.order.status.clone(),
            release: info.order.scheduled_release.format("%Y-%m").to_string(),
            items: info.items.len(),
            in_stock: info.items.iter().filter(|item| item.is_in_stock()).count(),
            price: info.order.price,
        })
        .collect::<Vec<_>>();
    render_html(IndexTemplate {
        total_orders: rows.len(),
        rows,
        total_items: report.total_items,
        total_cost: report.total_cost,
        total_cost_usd: format!("{:.2}", report.total_cost as f64 * state.jpy_to_usd),
    })
}

async fn list_orders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrderTypeQuery>,
) -> Json<Vec<OrderInfo>> {
    Json(today_orders(&state, query.order_type).await)
}

async fn order_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.store().get(&id).await {
        Some(info) => Json(info).into_response(),
        None => detail(StatusCode::NOT_FOUND, "Order not found"),
    }
}

async fn items_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Item>> {
    let items = today_orders(&state, OrderType::All)
        .await
        .into_iter()
        .flat_map(|info| info.items)
        .collect();
    Json(items)
}

async fn update_orders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrderTypeQuery>,
) -> Response {
    match state.engine.sync(query.order_type).await {
        Ok(orders) => Json(orders).into_response(),
        Err(err) => {
            error!(order_type = %query.order_type, error = %err, "update request failed");
            detail(StatusCode::BAD_GATEWAY, &err.to_string())
        }
    }
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Json<StatsResponse> {
    let filter = if query.all { OrderType::All } else { OrderType::Open };
    let report = OrdersReport::build(&today_orders(&state, filter).await);
    let total_cost_usd = report.total_cost as f64 * state.jpy_to_usd;
    Json(StatsResponse {
        report,
        total_cost_usd,
    })
}

fn detail(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "detail": message }))).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use preorder_client::FakeStorefront;
    use preorder_core::{FixedClock, Order};
    use preorder_storage::OrderStore;
    use serde_json::Value;
    use tower::ServiceExt;

    fn info(id: &str, status: &str, month: u32, items: &[(&str, i64)]) -> OrderInfo {
        let release = NaiveDate::from_ymd_opt(2025, month, 1).unwrap();
        OrderInfo::new(
            Order::new(id, status, release, items.iter().map(|(_, p)| p).sum()),
            items
                .iter()
                .enumerate()
                .map(|(n, (name, price))| Item {
                    id: format!("{id}_{n}"),
                    code: format!("CODE-{id}-{n}"),
                    name: name.to_string(),
                    thumbnail: String::new(),
                    release_date: release,
                    price: *price,
                    amount: 1,
                    stock_flag: 1,
                })
                .collect(),
        )
    }

    async fn state_with(fake: Arc<FakeStorefront>, stored: Vec<OrderInfo>) -> AppState {
        let store = Arc::new(OrderStore::in_memory());
        for order in stored {
            store.upsert(order).await.unwrap();
        }
        let engine = SyncEngine::new(fake, store, 2)
            .with_clock(Arc::new(FixedClock(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())));
        AppState::new(Arc::new(engine), 0.5)
    }

    fn sample() -> Vec<OrderInfo> {
        vec![
            info("1", "Pre-order", 3, &[("Nendoroid Miku", 5000)]),
            info("2", "Shipped", 1, &[("Saber 1/7", 20000), ("Acrylic Stand", 1000)]),
        ]
    }

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn order_list_defaults_to_open() {
        let app = app(state_with(Arc::new(FakeStorefront::default()), sample()).await);

        let (status, body) = call(app.clone(), get_req("/api/orders/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "1");

        let (_, body) = call(app.clone(), get_req("/api/orders/?order_type=shipped")).await;
        assert_eq!(body[0]["id"], "2");

        let (_, body) = call(app, get_req("/api/orders/?order_type=all")).await;
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_order_is_404_with_detail() {
        let app = app(state_with(Arc::new(FakeStorefront::default()), sample()).await);

        let (status, body) = call(app.clone(), get_req("/api/orders/2/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 2);

        let (status, body) = call(app, get_req("/api/orders/404/")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, serde_json::json!({"detail": "Order not found"}));
    }

    #[tokio::test]
    async fn items_are_flattened_across_orders() {
        let app = app(state_with(Arc::new(FakeStorefront::default()), sample()).await);
        let (_, body) = call(app, get_req("/api/items/")).await;
        let codes = body
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["code"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(codes, vec!["CODE-2-0", "CODE-2-1", "CODE-1-0"]);
    }

    #[tokio::test]
    async fn update_runs_sync_and_returns_orders() {
        let fake = Arc::new(FakeStorefront::new(sample()));
        let state = state_with(fake.clone(), Vec::new()).await;
        let store = state.engine.store().clone();
        let app = app(state);

        let (status, body) = call(app, post_req("/api/orders/update/?order_type=all")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
        assert_eq!(store.len().await, 2);
        assert_eq!(fake.detail_calls(), 2);
    }

    #[tokio::test]
    async fn update_persists_snapshot_for_next_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        let fake = Arc::new(FakeStorefront::new(sample()));
        let engine = SyncEngine::new(fake, Arc::new(OrderStore::open(&path).await), 2)
            .with_clock(Arc::new(FixedClock(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())));
        let app = app(AppState::new(Arc::new(engine), 0.5));

        let (status, _) = call(app, post_req("/api/orders/update/?order_type=all")).await;
        assert_eq!(status, StatusCode::OK);

        let restarted = OrderStore::open(&path).await;
        assert_eq!(restarted.len().await, 2);
        let restarted_engine = SyncEngine::new(
            Arc::new(FakeStorefront::default()),
            Arc::new(restarted),
            2,
        )
        .with_clock(Arc::new(FixedClock(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap())));
        let app = super::app(AppState::new(Arc::new(restarted_engine), 0.5));
        let (status, body) = call(app, get_req("/api/orders/1/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["price"], 5000);
    }

    #[tokio::test]
    async fn failed_update_is_bad_gateway() {
        let fake = Arc::new(FakeStorefront::new(sample()));
        fake.reject_logins(true);
        let app = app(state_with(fake, Vec::new()).await);

        let (status, body) = call(app, post_req("/api/orders/update/")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["detail"].as_str().unwrap().contains("login failed"));
    }

    #[tokio::test]
    async fn stats_cover_open_orders_unless_all_requested() {
        let app = app(state_with(Arc::new(FakeStorefront::default()), sample()).await);

        let (_, body) = call(app.clone(), get_req("/api/stats/")).await;
        assert_eq!(body["total_items"], 1);
        assert_eq!(body["total_cost"], 5000);
        assert_eq!(body["total_cost_usd"], 2500.0);

        let (_, body) = call(app, get_req("/api/stats/?all=true")).await;
        assert_eq!(body["total_items"], 3);
        assert_eq!(body["by_category"][0]["category"], "1/7 scale");
    }

    #[tokio::test]
    async fn dashboard_lists_open_orders() {
        let app = app(state_with(Arc::new(FakeStorefront::default()), sample()).await);
        let resp = app.oneshot(get_req("/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("Pre-order Tracker"));
        assert!(text.contains("d_no=1"));
        assert!(!text.contains("d_no=2"));
    }
}
