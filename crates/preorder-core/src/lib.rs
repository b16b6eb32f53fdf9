//! Core domain model for the pre-order tracker.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};

mod month_date;
pub mod report;

pub use month_date::{first_day_of_next_month, parse_month_date, previous_month, ParseError};
pub use report::{classify, CategoryCount, MonthSummary, OrdersReport};

pub const CRATE_NAME: &str = "preorder-core";

pub const STORE_BASE_URL: &str = "https://www.amiami.com/";
pub const ACCOUNT_BASE_URL: &str = "https://secure.amiami.com/";

/// Source of "today" for anything month-relative.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDate);

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        self.0
    }
}

/// Order summary as returned by the remote order listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: String,
    pub scheduled_release: NaiveDate,
    pub price: i64,
}

impl Order {
    pub fn new(
        id: impl Into<String>,
        status: &str,
        scheduled_release: NaiveDate,
        price: i64,
    ) -> Self {
        Self {
            id: id.into(),
            status: status.trim_end().to_string(),
            scheduled_release,
            price,
        }
    }

    pub fn is_open(&self) -> bool {
        status_is_open(&self.status)
    }
}

fn status_is_open(status: &str) -> bool {
    let status = status.to_lowercase();
    !matches!(status.as_str(), "shipped" | "cancelled")
}

/// One product line within an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub code: String,
    pub name: String,
    pub thumbnail: String,
    pub release_date: NaiveDate,
    pub price: i64,
    pub amount: i64,
    pub stock_flag: i64,
}

impl Item {
    pub fn is_in_stock(&self) -> bool {
        self.stock_flag == self.amount
    }

    pub fn page_link(&self) -> String {
        format!("{STORE_BASE_URL}eng/detail?scode={}", self.code)
    }

    pub fn category(&self) -> String {
        classify(&self.name)
    }
}

/// An order together with its line items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfo {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<Item>,
}

impl OrderInfo {
    pub fn new(order: Order, items: Vec<Item>) -> Self {
        Self { order, items }
    }

    pub fn id(&self) -> &str {
        &self.order.id
    }

    pub fn is_open(&self) -> bool {
        self.order.is_open()
    }

    pub fn page_link(&self) -> String {
        format!("{ACCOUNT_BASE_URL}eng/bill/2?d_no={}", self.order.id)
    }

    /// True when the order releases in the month of `today` or the month before it.
    pub fn releases_around(&self, today: NaiveDate) -> bool {
        let release = self.order.scheduled_release;
        let (prev_year, prev_month) = previous_month(today.year(), today.month());
        (release.year() == today.year() && release.month() == today.month())
            || (release.year() == prev_year && release.month() == prev_month)
    }
}

/// Filter shared by the remote listing and local store queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    All,
    #[default]
    Open,
    Shipped,
    CurrentMonth,
}

impl OrderType {
    pub const ALL_TYPES: [OrderType; 4] = [
        OrderType::All,
        OrderType::Open,
        OrderType::Shipped,
        OrderType::CurrentMonth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::All => "all",
            OrderType::Open => "open",
            OrderType::Shipped => "shipped",
            OrderType::CurrentMonth => "current_month",
        }
    }

    /// Remote status ids for the `status_ids` query parameter.
    pub fn status_ids(self) -> &'static str {
        match self {
            OrderType::All => "1,2,3,4,5,6,7,10,999",
            OrderType::Open | OrderType::CurrentMonth => "1,2,5,6,7,10,999",
            OrderType::Shipped => "3,4",
        }
    }

    /// Local predicate. `CurrentMonth` keeps open orders released in the month of
    /// `today` or the month before it.
    pub fn matches(self, info: &OrderInfo, today: NaiveDate) -> bool {
        match self {
            OrderType::All => true,
            OrderType::Open => info.is_open(),
            OrderType::Shipped => !info.is_open(),
            OrderType::CurrentMonth => info.is_open() && info.releases_around(today),
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order type {0:?} (expected all, open, shipped or current_month)")]
pub struct UnknownOrderType(pub String);

impl FromStr for OrderType {
    type Err = UnknownOrderType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderType::ALL_TYPES
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownOrderType(s.to_string()))
    }
}
