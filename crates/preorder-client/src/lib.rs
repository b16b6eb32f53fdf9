//! Storefront client contract, wire types and adapters.
//!
//! The client performs no retries of its own; callers decide whether to log in again
//! and repeat a failed call.

use std::fmt;

use async_trait::async_trait;
use preorder_core::{Order, OrderInfo, OrderType, ParseError};
use thiserror::Error;

pub mod fake;
mod http;
pub mod wire;

pub use fake::FakeStorefront;
pub use http::{Credentials, HttpClientConfig, HttpStorefrontClient, DEFAULT_API_ROOT};

pub const CRATE_NAME: &str = "preorder-client";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Bearer token obtained from a successful login.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("login rejected: {0}")]
    Auth(String),
    #[error("storefront rejected request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),
    #[error("decoding response: {0}")]
    Decode(String),
    #[error("unrecognized date in response: {0}")]
    Date(#[from] ParseError),
}

impl ClientError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }

    /// Whether logging in again and repeating the call may help.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Auth(_) | ClientError::Rejected(_) | ClientError::Transport(_) => true,
            ClientError::Decode(_) | ClientError::Date(_) => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Transport(Box::new(err))
        }
    }
}

#[async_trait]
pub trait StorefrontApi: Send + Sync {
    async fn login(&self) -> Result<Session, ClientError>;

    /// Every order matching `order_type`, across all result pages.
    async fn list_orders(
        &self,
        session: &Session,
        order_type: OrderType,
    ) -> Result<Vec<Order>, ClientError>;

    async fn order_detail(&self, session: &Session, order_id: &str) -> Result<OrderInfo, ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_debug_hides_token() {
        let session = Session::new("secret-token");
        assert!(!format!("{session:?}").contains("secret-token"));
        assert_eq!(session.token(), "secret-token");
    }

    #[test]
    fn decode_errors_are_not_retryable() {
        assert!(ClientError::Auth("bad password".into()).is_retryable());
        assert!(ClientError::transport("connection reset").is_retryable());
        assert!(!ClientError::Decode("missing field".into()).is_retryable());
        assert!(!ClientError::Date(ParseError::Unrecognized("soon".into())).is_retryable());
    }
}
