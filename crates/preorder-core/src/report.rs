//! Item classification and per-month aggregation over already fetched orders.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;

use crate::OrderInfo;

static SCALE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d/\d").expect("scale pattern is valid"));

/// Category for an item name: `nendoroid`, `<n>/<m> scale` or `other`.
pub fn classify(name: &str) -> String {
    if name.to_lowercase().contains("nendoroid") {
        return "nendoroid".to_string();
    }
    match SCALE_PATTERN.find(name) {
        Some(m) => format!("{} scale", m.as_str()),
        None => "other".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthSummary {
    pub month: NaiveDate,
    pub orders: usize,
    pub items: usize,
    pub cost: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCount {
    pub category: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Default)]
pub struct OrdersReport {
    pub by_month: Vec<MonthSummary>,
    pub by_category: Vec<CategoryCount>,
    pub total_cost: i64,
    pub total_items: usize,
}

impl OrdersReport {
    pub fn build(orders: &[OrderInfo]) -> Self {
        let mut months: BTreeMap<NaiveDate, MonthSummary> = BTreeMap::new();
        let mut categories: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_cost = 0i64;
        let mut total_items = 0usize;

        for info in orders {
            let month = info.order.scheduled_release;
            let summary = months.entry(month).or_insert_with(|| MonthSummary {
                month,
                orders: 0,
                items: 0,
                cost: 0,
            });
            summary.orders += 1;
            summary.items += info.items.len();
            summary.cost += info.order.price;

            for item in &info.items {
                *categories.entry(classify(&item.name)).or_default() += 1;
                total_cost += item.price;
                total_items += 1;
            }
        }

        Self {
            by_month: months.into_values().collect(),
            by_category: categories
                .into_iter()
                .map(|(category, count)| CategoryCount { category, count })
                .collect(),
            total_cost,
            total_items,
        }
    }
}
