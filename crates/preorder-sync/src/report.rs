use preorder_core::{Item, Order, OrderInfo, OrdersReport};

const SEPARATOR: &str = "------\n------\n";

fn money(yen: i64, jpy_to_usd: f64) -> String {
    let yen = yen as f64;
    format!("{yen:>9.2}¥ /{:>7.2}$", yen * jpy_to_usd)
}

/// Plain-text stats: per-month totals, every item line, category counts and the grand total.
pub fn report_stats_text(orders: &[OrderInfo], jpy_to_usd: f64) -> String {
    let report = OrdersReport::build(orders);
    let mut lines = vec!["By month stats:".to_string()];
    for month in &report.by_month {
        lines.push(format!(
            "{};{:2} items;{}",
            month.month.format("%Y-%m"),
            month.items,
            money(month.cost, jpy_to_usd)
        ));
    }
    lines.push(SEPARATOR.to_string());

    lines.push("Detailed stats:".to_string());
    let mut items: Vec<(&Order, &Item)> = orders
        .iter()
        .flat_map(|info| info.items.iter().map(move |item| (&info.order, item)))
        .collect();
    items.sort_by_key(|(order, item)| (order.scheduled_release, item.price));
    for (order, item) in items {
        let stock = if item.is_in_stock() { "in stock" } else { "N/A" };
        lines.push(format!(
            "{}; order {}; {stock:>8};{}; {}",
            order.scheduled_release.format("%Y-%m"),
            order.id,
            money(item.price, jpy_to_usd),
            item.name
        ));
    }
    lines.push(SEPARATOR.to_string());

    lines.push("Categories:".to_string());
    for category in &report.by_category {
        lines.push(format!("{}: {}", category.category, category.count));
    }
    lines.push(SEPARATOR.to_string());

    lines.push(format!("Total items: {}", report.total_items));
    lines.push(format!("Summary cost: {}", money(report.total_cost, jpy_to_usd)));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn item(id: &str, name: &str, price: i64, stock_flag: i64) -> Item {
        Item {
            id: id.into(),
            code: format!("CODE-{id}"),
            name: name.into(),
            thumbnail: String::new(),
            release_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            price,
            amount: 1,
            stock_flag,
        }
    }

    #[test]
    fn stats_text_lists_months_items_and_totals() {
        let feb = NaiveDate::from_ymd_opt(2025, 2, 1).unwrap();
        let mar = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let orders = vec![
            OrderInfo::new(
                Order::new("20", "Pre-order", mar, 5000),
                vec![item("20_0", "Nendoroid Miku", 5000, 0)],
            ),
            OrderInfo::new(
                Order::new("10", "Pre-order", feb, 30000),
                vec![
                    item("10_0", "Saber 1/7 Scale Figure", 20000, 1),
                    item("10_1", "Acrylic Stand", 10000, 0),
                ],
            ),
        ];

        let text = report_stats_text(&orders, 0.01);
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "By month stats:");
        assert_eq!(lines[1], "2025-02; 2 items; 30000.00¥ / 300.00$");
        assert_eq!(lines[2], "2025-03; 1 items;  5000.00¥ /  50.00$");

        let detailed = lines.iter().position(|l| *l == "Detailed stats:").unwrap();
        assert_eq!(
            lines[detailed + 1],
            "2025-02; order 10;      N/A; 10000.00¥ / 100.00$; Acrylic Stand"
        );
        assert_eq!(
            lines[detailed + 2],
            "2025-02; order 10; in stock; 20000.00¥ / 200.00$; Saber 1/7 Scale Figure"
        );
        assert!(lines[detailed + 3].starts_with("2025-03; order 20;"));

        assert!(text.contains("Categories:\n1/7 scale: 1\nnendoroid: 1\nother: 1"));
        assert!(text.contains("Total items: 3"));
        assert!(text.ends_with("Summary cost:  35000.00¥ / 350.00$"));
    }

    #[test]
    fn empty_input_still_renders_sections() {
        let text = report_stats_text(&[], 0.0066);
        assert!(text.starts_with("By month stats:"));
        assert!(text.contains("Total items: 0"));
    }
}
