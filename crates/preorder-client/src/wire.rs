//! JSON shapes of the storefront API and their conversion into domain types.

use chrono::NaiveDate;
use preorder_core::{parse_month_date, Item, Order, OrderInfo, ParseError};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    #[serde(rename = "RSuccess", default)]
    pub success: bool,
    #[serde(rename = "RMessage", default)]
    pub message: Option<String>,
    #[serde(default)]
    pub login: Option<LoginData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginData {
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub total_results: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrdersResponse {
    #[serde(rename = "RSuccess", default)]
    pub success: bool,
    #[serde(rename = "RMessage", default)]
    pub message: Option<String>,
    pub search_result: Option<SearchResult>,
    #[serde(default)]
    pub orders: Vec<ApiOrder>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderDetailResponse {
    #[serde(rename = "RSuccess", default)]
    pub success: bool,
    #[serde(rename = "RMessage", default)]
    pub message: Option<String>,
    pub order: Option<ApiOrderInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrder {
    pub d_no: String,
    pub d_status: String,
    pub scheduled_release: String,
    pub subtotal: i64,
    #[serde(default)]
    pub mypage_lock_flg: i64,
}

impl ApiOrder {
    pub fn into_order(self, today: NaiveDate) -> Result<Order, ParseError> {
        let release = parse_month_date(&self.scheduled_release, today)?;
        Ok(Order::new(self.d_no, &self.d_status, release, self.subtotal))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiOrderInfo {
    pub d_no: String,
    pub d_status: String,
    pub scheduled_release: String,
    pub subtotal: i64,
    #[serde(default)]
    pub items: Vec<ApiItem>,
}

impl ApiOrderInfo {
    pub fn into_order_info(self, today: NaiveDate) -> Result<OrderInfo, ParseError> {
        let release = parse_month_date(&self.scheduled_release, today)?;
        let items = self
            .items
            .into_iter()
            .map(|item| item.into_item(today))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OrderInfo::new(
            Order::new(self.d_no, &self.d_status, release, self.subtotal),
            items,
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiItem {
    pub ds_no: String,
    pub scode: String,
    pub sname: String,
    #[serde(default)]
    pub thumb_url: String,
    pub releasedate: String,
    pub price: i64,
    pub amount: i64,
    pub stock_flg: i64,
}

impl ApiItem {
    pub fn into_item(self, today: NaiveDate) -> Result<Item, ParseError> {
        Ok(Item {
            release_date: parse_month_date(&self.releasedate, today)?,
            id: self.ds_no,
            code: self.scode,
            name: self.sname,
            thumbnail: self.thumb_url,
            price: self.price,
            amount: self.amount,
            stock_flag: self.stock_flg,
        })
    }
}
