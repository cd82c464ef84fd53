//! Fact builder: cleaned staging + dimensions → `fact_*` tables.
//!
//! A preflight pass refuses to build when any order or line item points at
//! a dimension row that does not exist. Nothing is silently dropped.

use async_trait::async_trait;
use libsql::Value;
use tracing::{info, instrument, warn};

use starload_shared::{FACT_TABLES, Result, StageName, StarloadError};
use starload_storage::{Store, display_value};

use crate::pipeline::{Stage, StageContext, StageOutcome};

/// Offending keys listed in an integrity error.
const SAMPLE_KEYS: usize = 5;

/// A query returning one row per dangling reference, with the offending
/// natural key in its only column, `k`.
struct IntegrityCheck {
    what: &'static str,
    keys_sql: &'static str,
}

const INTEGRITY_CHECKS: &[IntegrityCheck] = &[
    IntegrityCheck {
        what: "order items reference products missing from dim_products",
        keys_sql: "SELECT i.product_id AS k FROM stg_order_items i
                   WHERE NOT EXISTS (SELECT 1 FROM dim_products p WHERE p.product_id = i.product_id)",
    },
    IntegrityCheck {
        what: "order items reference sellers missing from dim_sellers",
        keys_sql: "SELECT i.seller_id AS k FROM stg_order_items i
                   WHERE NOT EXISTS (SELECT 1 FROM dim_sellers s WHERE s.seller_id = i.seller_id)",
    },
    IntegrityCheck {
        what: "order items reference orders missing from stg_orders",
        keys_sql: "SELECT i.order_id AS k FROM stg_order_items i
                   WHERE NOT EXISTS (SELECT 1 FROM stg_orders o WHERE o.order_id = i.order_id)",
    },
    IntegrityCheck {
        what: "orders reference customers missing from dim_customers",
        keys_sql: "SELECT o.customer_id AS k FROM stg_orders o
                   WHERE o.order_id IS NOT NULL
                     AND NOT EXISTS (SELECT 1 FROM dim_customers c WHERE c.customer_id = o.customer_id)",
    },
];

const ORDERS_SQL: &str = r#"
DROP TABLE IF EXISTS fact_orders;

-- Foreign keys are enforced by the preflight and the validator rather than
-- declared, since dimensions are rebuilt underneath existing facts.
CREATE TABLE fact_orders (
    order_key             INTEGER PRIMARY KEY,
    order_id              TEXT NOT NULL UNIQUE,
    customer_key          INTEGER NOT NULL,
    order_status          TEXT,
    purchased_at          TEXT,
    approved_at           TEXT,
    delivered_carrier_at  TEXT,
    delivered_at          TEXT,
    estimated_delivery_at TEXT,
    purchase_date_key     INTEGER,
    delivered_date_key    INTEGER,
    estimated_date_key    INTEGER,
    total_items           INTEGER NOT NULL,
    total_amount          REAL NOT NULL,
    total_freight         REAL NOT NULL,
    total_payment         REAL NOT NULL,
    delivery_days         INTEGER,
    is_late               INTEGER NOT NULL
);

WITH orders AS (
    SELECT s.*, ROW_NUMBER() OVER (PARTITION BY s.order_id ORDER BY s.rowid) AS rn
    FROM stg_orders s
    WHERE s.order_id IS NOT NULL
),
items AS (
    SELECT order_id,
           COUNT(*)           AS total_items,
           SUM(price)         AS total_amount,
           SUM(freight_value) AS total_freight
    FROM stg_order_items
    GROUP BY order_id
),
payments AS (
    SELECT order_id, SUM(payment_value) AS total_payment
    FROM stg_order_payments
    GROUP BY order_id
)
INSERT INTO fact_orders (
    order_key, order_id, customer_key, order_status,
    purchased_at, approved_at, delivered_carrier_at, delivered_at, estimated_delivery_at,
    purchase_date_key, delivered_date_key, estimated_date_key,
    total_items, total_amount, total_freight, total_payment,
    delivery_days, is_late
)
SELECT
    ROW_NUMBER() OVER (ORDER BY o.order_id),
    o.order_id,
    c.customer_key,
    o.order_status,
    o.order_purchase_timestamp,
    o.order_approved_at,
    o.order_delivered_carrier_date,
    o.order_delivered_customer_date,
    o.order_estimated_delivery_date,
    CAST(strftime('%Y%m%d', o.order_purchase_timestamp) AS INTEGER),
    CAST(strftime('%Y%m%d', o.order_delivered_customer_date) AS INTEGER),
    CAST(strftime('%Y%m%d', o.order_estimated_delivery_date) AS INTEGER),
    COALESCE(i.total_items, 0),
    ROUND(COALESCE(i.total_amount, 0), 2),
    ROUND(COALESCE(i.total_freight, 0), 2),
    ROUND(COALESCE(p.total_payment, 0), 2),
    CAST(julianday(date(o.order_delivered_customer_date))
         - julianday(date(o.order_purchase_timestamp)) AS INTEGER),
    CASE
        WHEN date(o.order_delivered_customer_date) > date(o.order_estimated_delivery_date) THEN 1
        ELSE 0
    END
FROM orders o
JOIN dim_customers c ON c.customer_id = o.customer_id
LEFT JOIN items i    ON i.order_id = o.order_id
LEFT JOIN payments p ON p.order_id = o.order_id
WHERE o.rn = 1;
"#;

const ORDER_ITEMS_SQL: &str = r#"
DROP TABLE IF EXISTS fact_order_items;

CREATE TABLE fact_order_items (
    item_key          INTEGER PRIMARY KEY,
    order_key         INTEGER NOT NULL,
    order_id          TEXT NOT NULL,
    order_item_id     INTEGER,
    product_key       INTEGER NOT NULL,
    seller_key        INTEGER NOT NULL,
    shipping_limit_at TEXT,
    price             REAL,
    freight_value     REAL
);

INSERT INTO fact_order_items (
    item_key, order_key, order_id, order_item_id, product_key, seller_key,
    shipping_limit_at, price, freight_value
)
SELECT
    ROW_NUMBER() OVER (ORDER BY i.order_id, i.order_item_id, i.rowid),
    f.order_key,
    i.order_id,
    i.order_item_id,
    p.product_key,
    s.seller_key,
    i.shipping_limit_date,
    i.price,
    i.freight_value
FROM stg_order_items i
JOIN fact_orders f  ON f.order_id = i.order_id
JOIN dim_products p ON p.product_id = i.product_id
JOIN dim_sellers s  ON s.seller_id = i.seller_id;
"#;

const PAYMENTS_SQL: &str = r#"
DROP TABLE IF EXISTS fact_payments;

-- Linked to orders by natural id; one row per source record.
CREATE TABLE fact_payments (
    payment_key        INTEGER PRIMARY KEY,
    order_id           TEXT,
    payment_sequential INTEGER,
    payment_type       TEXT,
    installments       INTEGER,
    payment_value      REAL
);

INSERT INTO fact_payments (payment_key, order_id, payment_sequential, payment_type, installments, payment_value)
SELECT
    ROW_NUMBER() OVER (ORDER BY rowid),
    order_id,
    payment_sequential,
    payment_type,
    payment_installments,
    payment_value
FROM stg_order_payments;
"#;

const REVIEWS_SQL: &str = r#"
DROP TABLE IF EXISTS fact_reviews;

CREATE TABLE fact_reviews (
    review_key      INTEGER PRIMARY KEY,
    review_id       TEXT,
    order_id        TEXT,
    review_score    INTEGER,
    comment_title   TEXT,
    comment_message TEXT,
    created_at      TEXT,
    answered_at     TEXT
);

INSERT INTO fact_reviews (review_key, review_id, order_id, review_score, comment_title, comment_message, created_at, answered_at)
SELECT
    ROW_NUMBER() OVER (ORDER BY rowid),
    review_id,
    order_id,
    review_score,
    review_comment_title,
    review_comment_message,
    review_creation_date,
    review_answer_timestamp
FROM stg_order_reviews;
"#;

const SQL_FACTS: &[(&str, &str)] = &[
    ("fact_orders", ORDERS_SQL),
    ("fact_order_items", ORDER_ITEMS_SQL),
    ("fact_payments", PAYMENTS_SQL),
    ("fact_reviews", REVIEWS_SQL),
];

pub struct FactStage;

#[async_trait]
impl Stage for FactStage {
    fn name(&self) -> StageName {
        StageName::Facts
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let counts = build_facts(ctx.store).await?;
        Ok(StageOutcome::new(self.name()).with_tables(counts))
    }
}

/// Check integrity, then rebuild all fact tables. Returns `(table, rows)`.
#[instrument(skip_all)]
pub async fn build_facts(store: &Store) -> Result<Vec<(String, u64)>> {
    check_references(store).await?;

    let mut counts = Vec::with_capacity(FACT_TABLES.len());
    for (table, sql) in SQL_FACTS {
        store.execute_batch(sql).await?;
        let rows = store.count_rows(table).await?;
        info!(%table, rows, "fact table built");
        counts.push((table.to_string(), rows));
    }
    Ok(counts)
}

/// Fail with every dangling reference found, not just the first kind.
async fn check_references(store: &Store) -> Result<()> {
    let mut problems = Vec::new();
    for check in INTEGRITY_CHECKS {
        let count = store
            .query_i64(&format!("SELECT COUNT(*) FROM ({})", check.keys_sql), vec![])
            .await?
            .unwrap_or(0);
        if count == 0 {
            continue;
        }
        let sample = store
            .query(
                &format!(
                    "SELECT DISTINCT k FROM ({}) LIMIT {SAMPLE_KEYS}",
                    check.keys_sql
                ),
                vec![],
            )
            .await?;
        let keys: Vec<String> = sample
            .rows
            .iter()
            .filter_map(|r| r.first())
            .map(|v| match v {
                Value::Null => "<null>".to_string(),
                other => display_value(other),
            })
            .collect();
        warn!(check = check.what, count, "dangling references");
        problems.push(format!("{count} {} (e.g. {})", check.what, keys.join(", ")));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(StarloadError::integrity(problems.join("; ")))
    }
}
