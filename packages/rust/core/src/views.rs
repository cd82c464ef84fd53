//! Analytical views over the star schema, plus typed readers.
//!
//! Order-grain revenue is `total_payment`; item-grain revenue is `price`.
//! Canceled and unavailable orders never count toward revenue, though they
//! still count as orders when segmenting customers. Revenue sums over only
//! NULL amounts read as 0.

use async_trait::async_trait;
use libsql::Value;
use serde::Serialize;
use tracing::{info, instrument};

use starload_shared::{Result, StageName, StarloadError, VIEW_NAMES};
use starload_storage::{Store, display_value, quote_ident};

use crate::pipeline::{Stage, StageContext, StageOutcome};

const MONTHLY_REVENUE_SQL: &str = r#"
CREATE VIEW vw_monthly_revenue AS
SELECT
    d.year,
    d.month,
    printf('%04d-%02d', d.year, d.month) AS year_month,
    COUNT(*)                             AS order_count,
    ROUND(TOTAL(f.total_payment), 2)     AS total_revenue,
    ROUND(AVG(f.total_payment), 2)       AS avg_order_value,
    SUM(f.total_items)                   AS total_items
FROM fact_orders f
JOIN dim_date d ON d.date_key = f.purchase_date_key
WHERE COALESCE(f.order_status, '') NOT IN ('canceled', 'unavailable')
GROUP BY d.year, d.month
ORDER BY d.year, d.month
"#;

const DELIVERY_PERFORMANCE_SQL: &str = r#"
CREATE VIEW vw_delivery_performance AS
SELECT
    c.state                                      AS customer_state,
    d.year,
    d.month,
    printf('%04d-%02d', d.year, d.month)         AS year_month,
    COUNT(*)                                     AS delivered_orders,
    ROUND(AVG(f.delivery_days), 2)               AS avg_delivery_days,
    ROUND(1.0 * SUM(f.is_late) / COUNT(*), 4)    AS late_rate
FROM fact_orders f
JOIN dim_customers c ON c.customer_key = f.customer_key
JOIN dim_date d      ON d.date_key = f.purchase_date_key
WHERE f.order_status = 'delivered'
  AND f.delivery_days IS NOT NULL
GROUP BY c.state, d.year, d.month
ORDER BY c.state, d.year, d.month
"#;

const SELLER_PERFORMANCE_SQL: &str = r#"
CREATE VIEW vw_seller_performance AS
WITH seller_orders AS (
    SELECT
        i.seller_key,
        i.order_id,
        COUNT(*)             AS items,
        SUM(i.price)         AS revenue,
        SUM(i.freight_value) AS freight
    FROM fact_order_items i
    JOIN fact_orders f ON f.order_key = i.order_key
    WHERE COALESCE(f.order_status, '') NOT IN ('canceled', 'unavailable')
    GROUP BY i.seller_key, i.order_id
),
order_scores AS (
    SELECT order_id, AVG(review_score) AS score
    FROM fact_reviews
    GROUP BY order_id
)
SELECT
    s.seller_id,
    s.city,
    s.state,
    COUNT(*)                    AS order_count,
    SUM(so.items)               AS items_sold,
    ROUND(TOTAL(so.revenue), 2) AS total_revenue,
    ROUND(TOTAL(so.freight), 2) AS total_freight,
    ROUND(AVG(r.score), 2)      AS avg_review_score
FROM seller_orders so
JOIN dim_sellers s       ON s.seller_key = so.seller_key
LEFT JOIN order_scores r ON r.order_id = so.order_id
GROUP BY s.seller_key, s.seller_id, s.city, s.state
ORDER BY total_revenue DESC, s.seller_id
"#;

const CATEGORY_PERFORMANCE_SQL: &str = r#"
CREATE VIEW vw_product_category_performance AS
WITH order_scores AS (
    SELECT order_id, AVG(review_score) AS score
    FROM fact_reviews
    GROUP BY order_id
)
SELECT
    p.category_name_english      AS category,
    COUNT(*)                     AS items_sold,
    COUNT(DISTINCT i.order_id)   AS order_count,
    ROUND(TOTAL(i.price), 2)     AS total_revenue,
    ROUND(AVG(r.score), 2)       AS avg_review_score
FROM fact_order_items i
JOIN fact_orders f       ON f.order_key = i.order_key
JOIN dim_products p      ON p.product_key = i.product_key
LEFT JOIN order_scores r ON r.order_id = i.order_id
WHERE COALESCE(f.order_status, '') NOT IN ('canceled', 'unavailable')
GROUP BY p.category_name_english
ORDER BY total_revenue DESC, category
"#;

/// Segments key on `customer_unique_id`: Olist issues a fresh
/// `customer_id` for every order. Tiers count every order the person placed;
/// only the value measures skip canceled and unavailable ones.
const CUSTOMER_SEGMENTS_SQL: &str = r#"
CREATE VIEW vw_customer_segments AS
WITH tagged AS (
    SELECT
        COALESCE(c.customer_unique_id, c.customer_id) AS customer_unique_id,
        f.order_id,
        f.total_payment,
        f.purchased_at,
        COALESCE(f.order_status, '') NOT IN ('canceled', 'unavailable') AS billable
    FROM fact_orders f
    JOIN dim_customers c ON c.customer_key = f.customer_key
),
customer_orders AS (
    SELECT
        customer_unique_id,
        COUNT(DISTINCT order_id)                              AS order_count,
        COUNT(DISTINCT CASE WHEN billable THEN order_id END)  AS billable_orders,
        TOTAL(CASE WHEN billable THEN total_payment END)      AS lifetime_value,
        MIN(purchased_at)                                     AS first_order_at,
        MAX(purchased_at)                                     AS last_order_at
    FROM tagged
    GROUP BY customer_unique_id
)
SELECT
    customer_unique_id,
    CASE
        WHEN order_count >= 3 THEN 'loyal'
        WHEN order_count = 2  THEN 'returning'
        ELSE 'one-time'
    END                                                    AS segment,
    order_count,
    ROUND(lifetime_value, 2)                               AS lifetime_value,
    ROUND(lifetime_value / NULLIF(billable_orders, 0), 2)  AS avg_order_value,
    first_order_at,
    last_order_at,
    CAST(julianday(date(last_order_at)) - julianday(date(first_order_at)) AS INTEGER) AS tenure_days
FROM customer_orders
ORDER BY lifetime_value DESC, customer_unique_id
"#;

/// Every view, in creation order.
pub const VIEW_DEFINITIONS: &[(&str, &str)] = &[
    ("vw_monthly_revenue", MONTHLY_REVENUE_SQL),
    ("vw_delivery_performance", DELIVERY_PERFORMANCE_SQL),
    ("vw_seller_performance", SELLER_PERFORMANCE_SQL),
    ("vw_product_category_performance", CATEGORY_PERFORMANCE_SQL),
    ("vw_customer_segments", CUSTOMER_SEGMENTS_SQL),
];

pub struct ViewStage;

#[async_trait]
impl Stage for ViewStage {
    fn name(&self) -> StageName {
        StageName::Views
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let counts = create_views(ctx.store).await?;
        Ok(StageOutcome::new(self.name()).with_tables(counts))
    }
}

/// Drop and recreate every view, then count each one's rows so a broken
/// definition fails here rather than at first read.
#[instrument(skip_all)]
pub async fn create_views(store: &Store) -> Result<Vec<(String, u64)>> {
    let mut counts = Vec::with_capacity(VIEW_DEFINITIONS.len());
    for (name, sql) in VIEW_DEFINITIONS {
        store
            .execute_batch(&format!("DROP VIEW IF EXISTS {};\n{sql};", quote_ident(name)?))
            .await?;
        let rows = store.count_rows(name).await?;
        info!(view = %name, rows, "view created");
        counts.push((name.to_string(), rows));
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Typed readers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyRevenue {
    pub year_month: String,
    pub order_count: i64,
    pub total_revenue: f64,
    pub avg_order_value: f64,
    pub total_items: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryPerformance {
    pub customer_state: Option<String>,
    pub year_month: String,
    pub delivered_orders: i64,
    pub avg_delivery_days: f64,
    pub late_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SellerPerformance {
    pub seller_id: String,
    pub state: Option<String>,
    pub order_count: i64,
    pub total_revenue: f64,
    pub total_freight: f64,
    /// `None` when none of the seller's orders were reviewed.
    pub avg_review_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryPerformance {
    pub category: String,
    pub items_sold: i64,
    pub total_revenue: f64,
    pub avg_review_score: Option<f64>,
}

/// Purchase-frequency tier: 1 order, 2 orders, 3 or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Segment {
    OneTime,
    Returning,
    Loyal,
}

impl std::str::FromStr for Segment {
    type Err = StarloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "one-time" => Ok(Self::OneTime),
            "returning" => Ok(Self::Returning),
            "loyal" => Ok(Self::Loyal),
            other => Err(StarloadError::validation(format!("unknown segment '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomerSegment {
    pub customer_unique_id: String,
    pub segment: Segment,
    pub order_count: i64,
    pub lifetime_value: f64,
    /// `None` when every order was canceled or unavailable.
    pub avg_order_value: Option<f64>,
    /// `None` when a purchase timestamp is missing.
    pub tenure_days: Option<i64>,
}

fn int(row: &[Value], idx: usize) -> Result<i64> {
    opt_int(row, idx)?.ok_or_else(|| {
        StarloadError::Storage(format!("column {idx}: expected integer, got NULL"))
    })
}

fn opt_int(row: &[Value], idx: usize) -> Result<Option<i64>> {
    match row.get(idx) {
        Some(Value::Integer(n)) => Ok(Some(*n)),
        Some(Value::Null) => Ok(None),
        other => Err(StarloadError::Storage(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

fn real(row: &[Value], idx: usize) -> Result<f64> {
    opt_real(row, idx)?.ok_or_else(|| {
        StarloadError::Storage(format!("column {idx}: expected number, got NULL"))
    })
}

fn opt_real(row: &[Value], idx: usize) -> Result<Option<f64>> {
    match row.get(idx) {
        Some(Value::Real(f)) => Ok(Some(*f)),
        Some(Value::Integer(n)) => Ok(Some(*n as f64)),
        Some(Value::Null) => Ok(None),
        other => Err(StarloadError::Storage(format!(
            "column {idx}: expected number, got {other:?}"
        ))),
    }
}

fn opt_text(row: &[Value], idx: usize) -> Result<Option<String>> {
    match row.get(idx) {
        Some(Value::Text(s)) => Ok(Some(s.clone())),
        Some(Value::Null) => Ok(None),
        other => Err(StarloadError::Storage(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

fn text(row: &[Value], idx: usize) -> Result<String> {
    opt_text(row, idx)?
        .ok_or_else(|| StarloadError::Storage(format!("column {idx}: expected text, got NULL")))
}

pub async fn monthly_revenue(store: &Store) -> Result<Vec<MonthlyRevenue>> {
    let rows = store
        .query(
            "SELECT year_month, order_count, total_revenue, avg_order_value, total_items
             FROM vw_monthly_revenue",
            vec![],
        )
        .await?;
    rows.rows
        .iter()
        .map(|r| {
            Ok(MonthlyRevenue {
                year_month: text(r, 0)?,
                order_count: int(r, 1)?,
                total_revenue: real(r, 2)?,
                avg_order_value: real(r, 3)?,
                total_items: int(r, 4)?,
            })
        })
        .collect()
}

pub async fn delivery_performance(store: &Store) -> Result<Vec<DeliveryPerformance>> {
    let rows = store
        .query(
            "SELECT customer_state, year_month, delivered_orders, avg_delivery_days, late_rate
             FROM vw_delivery_performance",
            vec![],
        )
        .await?;
    rows.rows
        .iter()
        .map(|r| {
            Ok(DeliveryPerformance {
                customer_state: opt_text(r, 0)?,
                year_month: text(r, 1)?,
                delivered_orders: int(r, 2)?,
                avg_delivery_days: real(r, 3)?,
                late_rate: real(r, 4)?,
            })
        })
        .collect()
}

pub async fn seller_performance(store: &Store) -> Result<Vec<SellerPerformance>> {
    let rows = store
        .query(
            "SELECT seller_id, state, order_count, total_revenue, total_freight, avg_review_score
             FROM vw_seller_performance",
            vec![],
        )
        .await?;
    rows.rows
        .iter()
        .map(|r| {
            Ok(SellerPerformance {
                seller_id: text(r, 0)?,
                state: opt_text(r, 1)?,
                order_count: int(r, 2)?,
                total_revenue: real(r, 3)?,
                total_freight: real(r, 4)?,
                avg_review_score: opt_real(r, 5)?,
            })
        })
        .collect()
}

pub async fn category_performance(store: &Store) -> Result<Vec<CategoryPerformance>> {
    let rows = store
        .query(
            "SELECT category, items_sold, total_revenue, avg_review_score
             FROM vw_product_category_performance",
            vec![],
        )
        .await?;
    rows.rows
        .iter()
        .map(|r| {
            Ok(CategoryPerformance {
                category: text(r, 0)?,
                items_sold: int(r, 1)?,
                total_revenue: real(r, 2)?,
                avg_review_score: opt_real(r, 3)?,
            })
        })
        .collect()
}

pub async fn customer_segments(store: &Store) -> Result<Vec<CustomerSegment>> {
    let rows = store
        .query(
            "SELECT customer_unique_id, segment, order_count, lifetime_value, avg_order_value, tenure_days
             FROM vw_customer_segments",
            vec![],
        )
        .await?;
    rows.rows
        .iter()
        .map(|r| {
            Ok(CustomerSegment {
                customer_unique_id: text(r, 0)?,
                segment: text(r, 1)?.parse()?,
                order_count: int(r, 2)?,
                lifetime_value: real(r, 3)?,
                avg_order_value: opt_real(r, 4)?,
                tenure_days: opt_int(r, 5)?,
            })
        })
        .collect()
}

/// Read a whole view through its typed reader and serialize it to JSON.
pub async fn view_json(store: &Store, name: &str) -> Result<serde_json::Value> {
    let value = match name {
        "vw_monthly_revenue" => serde_json::to_value(monthly_revenue(store).await?),
        "vw_delivery_performance" => serde_json::to_value(delivery_performance(store).await?),
        "vw_seller_performance" => serde_json::to_value(seller_performance(store).await?),
        "vw_product_category_performance" => {
            serde_json::to_value(category_performance(store).await?)
        }
        "vw_customer_segments" => serde_json::to_value(customer_segments(store).await?),
        other => {
            return Err(StarloadError::validation(format!(
                "unknown view '{other}'; expected one of: {}",
                VIEW_NAMES.join(", ")
            )));
        }
    };
    value.map_err(|e| StarloadError::Storage(format!("serialize {name}: {e}")))
}

// ---------------------------------------------------------------------------
// Generic sampling
// ---------------------------------------------------------------------------

/// First rows of a view, rendered as strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewSample {
    pub view: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Read up to `limit` rows of the named view. Only the five known views
/// are accepted.
pub async fn sample_view(store: &Store, name: &str, limit: u32) -> Result<ViewSample> {
    if !VIEW_NAMES.contains(&name) {
        return Err(StarloadError::validation(format!(
            "unknown view '{name}'; expected one of: {}",
            VIEW_NAMES.join(", ")
        )));
    }
    let result = store
        .query(
            &format!("SELECT * FROM {} LIMIT ?1", quote_ident(name)?),
            vec![Value::Integer(limit.into())],
        )
        .await?;
    Ok(ViewSample {
        view: name.to_string(),
        columns: result.columns,
        rows: result
            .rows
            .iter()
            .map(|r| r.iter().map(display_value).collect())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dimensions::build_dimensions;
    use crate::facts::build_facts;
    use crate::test_support::{build_minimal_star, seed_minimal_star, test_store};

    async fn build_star_over_staging(store: &Store) {
        build_dimensions(store).await.expect("dimensions");
        build_facts(store).await.expect("facts");
        create_views(store).await.expect("views");
    }

    #[tokio::test]
    async fn segments_by_lifetime_orders() {
        let store = test_store().await;
        build_minimal_star(&store).await;

        let segments = customer_segments(&store).await.expect("segments");
        let by_id = |id: &str| {
            segments
                .iter()
                .find(|s| s.customer_unique_id == id)
                .unwrap_or_else(|| panic!("{id} missing"))
                .clone()
        };

        assert_eq!(by_id("u1").segment, Segment::OneTime);
        let returning = by_id("u2");
        assert_eq!(returning.segment, Segment::Returning);
        assert_eq!(returning.order_count, 2);
        assert_eq!(returning.lifetime_value, 80.0);
        assert_eq!(returning.avg_order_value, Some(40.0));
        assert_eq!(returning.tenure_days, Some(37));
        assert_eq!(by_id("u3").segment, Segment::Loyal);

        // u4 only has a canceled order: still a customer, but worth nothing.
        let canceled_only = by_id("u4");
        assert_eq!(canceled_only.segment, Segment::OneTime);
        assert_eq!(canceled_only.order_count, 1);
        assert_eq!(canceled_only.lifetime_value, 0.0);
        assert_eq!(canceled_only.avg_order_value, None);
    }

    #[tokio::test]
    async fn canceled_orders_count_toward_tier_but_not_value() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        store
            .execute_batch(
                "INSERT INTO stg_customers VALUES ('c8', 'u1', '01037', 'sao paulo', 'SP');
                 INSERT INTO stg_orders VALUES ('o8', 'c8', 'canceled', '2017-05-02 10:00:00',
                     NULL, NULL, NULL, '2017-05-20 00:00:00');
                 INSERT INTO stg_order_payments VALUES ('o8', 1, 'boleto', 1, 45.0);",
            )
            .await
            .unwrap();
        build_star_over_staging(&store).await;

        let segments = customer_segments(&store).await.unwrap();
        let u1 = segments
            .iter()
            .find(|s| s.customer_unique_id == "u1")
            .expect("u1 present");
        assert_eq!(u1.segment, Segment::Returning);
        assert_eq!(u1.order_count, 2);
        assert_eq!(u1.lifetime_value, 170.0);
        assert_eq!(u1.avg_order_value, Some(170.0));
        assert_eq!(u1.tenure_days, Some(117));
    }

    #[tokio::test]
    async fn missing_purchase_time_leaves_tenure_empty() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        store
            .execute("UPDATE stg_orders SET order_purchase_timestamp = NULL WHERE order_id = 'o1'", vec![])
            .await
            .unwrap();
        build_star_over_staging(&store).await;

        let segments = customer_segments(&store).await.expect("nullable tenure reads");
        let u1 = segments.iter().find(|s| s.customer_unique_id == "u1").unwrap();
        assert_eq!(u1.tenure_days, None);
        assert!(view_json(&store, "vw_customer_segments").await.is_ok());
    }

    #[tokio::test]
    async fn unpriced_items_read_as_zero_revenue() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        store
            .execute(
                "UPDATE stg_order_items SET price = NULL, freight_value = NULL WHERE seller_id = 's2'",
                vec![],
            )
            .await
            .unwrap();
        build_star_over_staging(&store).await;

        let sellers = seller_performance(&store).await.expect("unpriced seller reads");
        let s2 = sellers.iter().find(|s| s.seller_id == "s2").expect("s2 present");
        assert_eq!(s2.total_revenue, 0.0);
        assert_eq!(s2.total_freight, 0.0);
        assert!(category_performance(&store).await.is_ok());
        assert!(view_json(&store, "vw_seller_performance").await.is_ok());
    }

    #[tokio::test]
    async fn monthly_revenue_excludes_canceled() {
        let store = test_store().await;
        build_minimal_star(&store).await;

        let months = monthly_revenue(&store).await.unwrap();
        let months: Vec<(&str, i64, f64)> = months
            .iter()
            .map(|m| (m.year_month.as_str(), m.order_count, m.total_revenue))
            .collect();
        assert_eq!(
            months,
            [
                ("2017-01", 1, 170.0),
                ("2017-02", 2, 116.0),
                ("2017-03", 2, 54.0),
                ("2017-04", 1, 12.0),
            ]
        );
    }

    #[tokio::test]
    async fn delivery_uses_delivered_orders_only() {
        let store = test_store().await;
        build_minimal_star(&store).await;

        let rows = delivery_performance(&store).await.unwrap();
        let delivered: i64 = rows.iter().map(|r| r.delivered_orders).sum();
        assert_eq!(delivered, 5);
        let january = rows.iter().find(|r| r.year_month == "2017-01").unwrap();
        assert_eq!(january.late_rate, 1.0);
        assert_eq!(january.avg_delivery_days, 8.0);
    }

    #[tokio::test]
    async fn seller_and_category_revenue_use_item_price() {
        let store = test_store().await;
        build_minimal_star(&store).await;

        let sellers = seller_performance(&store).await.unwrap();
        assert_eq!(sellers[0].seller_id, "s1");
        assert_eq!(sellers[0].order_count, 4);
        assert_eq!(sellers[0].total_revenue, 170.0);
        assert_eq!(sellers[0].total_freight, 28.0);
        let score = sellers[0].avg_review_score.expect("s1 has reviews");
        assert!((score - 3.33).abs() < 1e-9, "{score}");

        let categories = category_performance(&store).await.unwrap();
        let names: Vec<&str> = categories.iter().map(|c| c.category.as_str()).collect();
        assert_eq!(names, ["bed_bath_table", "portateis_cozinha", "uncategorized"]);
        assert_eq!(categories[0].total_revenue, 160.0);
        assert_eq!(categories[0].items_sold, 3);
    }

    #[tokio::test]
    async fn sample_view_limits_and_rejects_unknown() {
        let store = test_store().await;
        build_minimal_star(&store).await;

        let sample = sample_view(&store, "vw_monthly_revenue", 2).await.unwrap();
        assert_eq!(sample.rows.len(), 2);
        assert_eq!(sample.columns[2], "year_month");
        assert_eq!(sample.rows[0][2], "2017-01");

        let err = sample_view(&store, "stg_orders", 5).await.unwrap_err();
        assert!(err.to_string().contains("unknown view"));
    }

    #[tokio::test]
    async fn json_rendering_uses_typed_rows() {
        let store = test_store().await;
        build_minimal_star(&store).await;

        let json = view_json(&store, "vw_customer_segments").await.unwrap();
        let rows = json.as_array().expect("array");
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().any(|r| r["segment"] == "one-time"));
        assert!(view_json(&store, "vw_nope").await.is_err());
    }

    #[test]
    fn segment_labels_parse() {
        assert_eq!("one-time".parse::<Segment>().unwrap(), Segment::OneTime);
        assert_eq!("returning".parse::<Segment>().unwrap(), Segment::Returning);
        assert_eq!("loyal".parse::<Segment>().unwrap(), Segment::Loyal);
        assert!("vip".parse::<Segment>().is_err());
    }
}
