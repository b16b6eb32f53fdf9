use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use preorder_core::{first_day_of_next_month, Clock, Order, OrderInfo, OrderType, SystemClock};
use reqwest::{RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, info_span, Instrument};

use crate::wire::{LoginResponse, OrderDetailResponse, OrdersResponse};
use crate::{ClientError, Session, StorefrontApi};

pub const DEFAULT_API_ROOT: &str = "https://api-secure.amiami.com/api/v1.0/";

const USER_KEY_HEADER: &str = "X-User-Key";
const USER_KEY: &str = "amiami_dev";
const AUTHORIZATION_HEADER: &str = "X-Authorization";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub api_root: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub page_size: u32,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            api_root: DEFAULT_API_ROOT.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            page_size: 20,
        }
    }
}

pub struct HttpStorefrontClient {
    client: reqwest::Client,
    api_root: Url,
    credentials: Credentials,
    page_size: u32,
    clock: Arc<dyn Clock>,
}

impl HttpStorefrontClient {
    pub fn new(config: HttpClientConfig, credentials: Credentials) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build()?;

        // Url::join drops the last path segment unless the root ends with a slash.
        let root = if config.api_root.ends_with('/') {
            config.api_root.clone()
        } else {
            format!("{}/", config.api_root)
        };
        let api_root = Url::parse(&root)
            .map_err(|err| ClientError::Decode(format!("invalid api root {root:?}: {err}")))?;

        Ok(Self {
            client,
            api_root,
            credentials,
            page_size: config.page_size.max(1),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.api_root
            .join(path)
            .map_err(|err| ClientError::Decode(format!("invalid endpoint {path:?}: {err}")))
    }

    fn authed_get(&self, url: Url, session: &Session) -> RequestBuilder {
        self.client
            .get(url)
            .header(USER_KEY_HEADER, USER_KEY)
            .header(AUTHORIZATION_HEADER, format!("bearer {}", session.token()))
    }
}

async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ClientError::Rejected(format!("http status {status} for {}", resp.url())));
    }
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|err| ClientError::Decode(err.to_string()))
}

fn rejection(message: Option<String>, fallback: &str) -> ClientError {
    ClientError::Rejected(message.unwrap_or_else(|| fallback.to_string()))
}

#[async_trait]
impl StorefrontApi for HttpStorefrontClient {
    async fn login(&self) -> Result<Session, ClientError> {
        let url = self.endpoint("login")?;
        let form = [
            ("lang", "eng"),
            ("email", self.credentials.username.as_str()),
            ("password", self.credentials.password.as_str()),
            ("c_ransu", ""),
        ];
        let resp = self
            .client
            .post(url)
            .header(USER_KEY_HEADER, USER_KEY)
            .form(&form)
            .send()
            .await?;

        let status = resp.status();
        let body = resp
            .bytes()
            .await
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LoginResponse>(&bytes).ok());
        match body {
            Some(LoginResponse {
                success: true,
                login: Some(login),
                ..
            }) => {
                info!(username = %self.credentials.username, "login successful");
                Ok(Session::new(login.token))
            }
            Some(body) => {
                let message = body.message.unwrap_or_else(|| status.to_string());
                error!(%message, "login failed");
                Err(ClientError::Auth(message))
            }
            None => {
                error!(%status, "login failed");
                Err(ClientError::Auth(format!("http status {status}")))
            }
        }
    }

    async fn list_orders(
        &self,
        session: &Session,
        order_type: OrderType,
    ) -> Result<Vec<Order>, ClientError> {
        let span = info_span!("list_orders", %order_type);
        async move {
            let url = self.endpoint("orders")?;
            let today = self.clock.today();
            let mut orders = Vec::new();
            let mut page = 1u32;

            loop {
                let query = [
                    ("status_ids", order_type.status_ids().to_string()),
                    ("search_key", "id".to_string()),
                    ("pagemax", self.page_size.to_string()),
                    ("lang", "eng".to_string()),
                    ("pagecnt", page.to_string()),
                ];
                let resp = self.authed_get(url.clone(), session).query(&query).send().await?;
                let body: OrdersResponse = read_json(resp).await?;
                if !body.success {
                    return Err(rejection(body.message, "order listing failed"));
                }
                let total = body
                    .search_result
                    .map(|r| r.total_results)
                    .ok_or_else(|| ClientError::Decode("missing search_result".to_string()))?;

                let received = body.orders.len();
                for order in body.orders {
                    orders.push(order.into_order(today)?);
                }
                debug!(page, received, total, "fetched order page");
                if received == 0 || orders.len() >= total {
                    break;
                }
                page += 1;
            }

            if order_type == OrderType::CurrentMonth {
                let cutoff = first_day_of_next_month(today);
                orders.retain(|order| order.scheduled_release < cutoff);
            }
            Ok(orders)
        }
        .instrument(span)
        .await
    }

    async fn order_detail(&self, session: &Session, order_id: &str) -> Result<OrderInfo, ClientError> {
        let url = self.endpoint("orders/detail")?;
        let resp = self
            .authed_get(url, session)
            .query(&[("d_no", order_id), ("lang", "eng")])
            .send()
            .await?;
        let body: OrderDetailResponse = read_json(resp).await?;
        if !body.success {
            return Err(rejection(body.message, "order detail failed"));
        }
        let order = body
            .order
            .ok_or_else(|| ClientError::Decode(format!("order {order_id} missing from detail response")))?;
        Ok(order.into_order_info(self.clock.today())?)
    }
}
