//! Dimension builder: cleaned staging → `dim_*` tables.
//!
//! Every dimension is dropped and rebuilt. Surrogate keys come from
//! `ROW_NUMBER()` over the natural key, so a rerun over the same staging data
//! assigns the same keys. Duplicate natural keys in staging collapse to the
//! first loaded row.

use async_trait::async_trait;
use chrono::NaiveDate;
use libsql::Value;
use tracing::{info, instrument};

use starload_shared::{DIMENSION_TABLES, Result, StageName, StarloadError};
use starload_storage::Store;

use crate::calendar::{CalendarDay, calendar_days};
use crate::pipeline::{Stage, StageContext, StageOutcome};

/// Label given to products that carry no category at all.
pub const UNCATEGORIZED: &str = "uncategorized";

const GEOGRAPHY_SQL: &str = r#"
DROP TABLE IF EXISTS dim_geography;

CREATE TABLE dim_geography (
    geo_key         INTEGER PRIMARY KEY,
    zip_code_prefix TEXT NOT NULL UNIQUE,
    city            TEXT,
    state           TEXT,
    avg_lat         REAL,
    avg_lng         REAL,
    sample_count    INTEGER NOT NULL
);

WITH samples AS (
    SELECT
        geolocation_zip_code_prefix AS zip,
        geolocation_city            AS city,
        geolocation_state           AS state,
        geolocation_lat             AS lat,
        geolocation_lng             AS lng
    FROM stg_geolocation
    WHERE geolocation_zip_code_prefix IS NOT NULL
),
centroids AS (
    SELECT zip, AVG(lat) AS avg_lat, AVG(lng) AS avg_lng, COUNT(*) AS sample_count
    FROM samples
    GROUP BY zip
),
cities AS (
    SELECT zip, city,
           ROW_NUMBER() OVER (PARTITION BY zip ORDER BY COUNT(*) DESC, city) AS rn
    FROM samples
    WHERE city IS NOT NULL
    GROUP BY zip, city
),
states AS (
    SELECT zip, state,
           ROW_NUMBER() OVER (PARTITION BY zip ORDER BY COUNT(*) DESC, state) AS rn
    FROM samples
    WHERE state IS NOT NULL
    GROUP BY zip, state
)
INSERT INTO dim_geography (geo_key, zip_code_prefix, city, state, avg_lat, avg_lng, sample_count)
SELECT
    ROW_NUMBER() OVER (ORDER BY c.zip),
    c.zip,
    ci.city,
    st.state,
    c.avg_lat,
    c.avg_lng,
    c.sample_count
FROM centroids c
LEFT JOIN cities ci ON ci.zip = c.zip AND ci.rn = 1
LEFT JOIN states st ON st.zip = c.zip AND st.rn = 1;
"#;

const CUSTOMERS_SQL: &str = r#"
DROP TABLE IF EXISTS dim_customers;

-- geo_key is optional: not every zip prefix has coordinate samples.
CREATE TABLE dim_customers (
    customer_key       INTEGER PRIMARY KEY,
    customer_id        TEXT NOT NULL UNIQUE,
    customer_unique_id TEXT,
    zip_code_prefix    TEXT,
    city               TEXT,
    state              TEXT,
    geo_key            INTEGER
);

WITH ranked AS (
    SELECT s.*, ROW_NUMBER() OVER (PARTITION BY s.customer_id ORDER BY s.rowid) AS rn
    FROM stg_customers s
    WHERE s.customer_id IS NOT NULL
)
INSERT INTO dim_customers (customer_key, customer_id, customer_unique_id, zip_code_prefix, city, state, geo_key)
SELECT
    ROW_NUMBER() OVER (ORDER BY r.customer_id),
    r.customer_id,
    r.customer_unique_id,
    r.customer_zip_code_prefix,
    r.customer_city,
    r.customer_state,
    g.geo_key
FROM ranked r
LEFT JOIN dim_geography g ON g.zip_code_prefix = r.customer_zip_code_prefix
WHERE r.rn = 1;
"#;

const SELLERS_SQL: &str = r#"
DROP TABLE IF EXISTS dim_sellers;

CREATE TABLE dim_sellers (
    seller_key      INTEGER PRIMARY KEY,
    seller_id       TEXT NOT NULL UNIQUE,
    zip_code_prefix TEXT,
    city            TEXT,
    state           TEXT,
    geo_key         INTEGER
);

WITH ranked AS (
    SELECT s.*, ROW_NUMBER() OVER (PARTITION BY s.seller_id ORDER BY s.rowid) AS rn
    FROM stg_sellers s
    WHERE s.seller_id IS NOT NULL
)
INSERT INTO dim_sellers (seller_key, seller_id, zip_code_prefix, city, state, geo_key)
SELECT
    ROW_NUMBER() OVER (ORDER BY r.seller_id),
    r.seller_id,
    r.seller_zip_code_prefix,
    r.seller_city,
    r.seller_state,
    g.geo_key
FROM ranked r
LEFT JOIN dim_geography g ON g.zip_code_prefix = r.seller_zip_code_prefix
WHERE r.rn = 1;
"#;

/// Translated category: the lookup hit, else the native label, else
/// [`UNCATEGORIZED`].
const PRODUCTS_SQL: &str = r#"
DROP TABLE IF EXISTS dim_products;

CREATE TABLE dim_products (
    product_key           INTEGER PRIMARY KEY,
    product_id            TEXT NOT NULL UNIQUE,
    category_name         TEXT,
    category_name_english TEXT NOT NULL,
    name_length           INTEGER,
    description_length    INTEGER,
    photos_qty            INTEGER,
    weight_g              INTEGER,
    length_cm             INTEGER,
    height_cm             INTEGER,
    width_cm              INTEGER
);

WITH ranked AS (
    SELECT s.*, ROW_NUMBER() OVER (PARTITION BY s.product_id ORDER BY s.rowid) AS rn
    FROM stg_products s
    WHERE s.product_id IS NOT NULL
),
translations AS (
    SELECT t.product_category_name, t.product_category_name_english,
           ROW_NUMBER() OVER (PARTITION BY t.product_category_name ORDER BY t.rowid) AS rn
    FROM stg_category_translation t
    WHERE t.product_category_name IS NOT NULL
)
INSERT INTO dim_products (
    product_key, product_id, category_name, category_name_english,
    name_length, description_length, photos_qty,
    weight_g, length_cm, height_cm, width_cm
)
SELECT
    ROW_NUMBER() OVER (ORDER BY p.product_id),
    p.product_id,
    p.product_category_name,
    COALESCE(t.product_category_name_english, p.product_category_name, 'uncategorized'),
    p.product_name_lenght,
    p.product_description_lenght,
    p.product_photos_qty,
    p.product_weight_g,
    p.product_length_cm,
    p.product_height_cm,
    p.product_width_cm
FROM ranked p
LEFT JOIN translations t ON t.product_category_name = p.product_category_name AND t.rn = 1
WHERE p.rn = 1;
"#;

const DATE_DDL: &str = r#"
DROP TABLE IF EXISTS dim_date;

CREATE TABLE dim_date (
    date_key     INTEGER PRIMARY KEY,
    full_date    TEXT NOT NULL UNIQUE,
    year         INTEGER NOT NULL,
    quarter      INTEGER NOT NULL,
    month        INTEGER NOT NULL,
    month_name   TEXT NOT NULL,
    day_of_month INTEGER NOT NULL,
    day_of_week  INTEGER NOT NULL,
    day_name     TEXT NOT NULL,
    week_of_year INTEGER NOT NULL,
    is_weekend   INTEGER NOT NULL
);
"#;

/// Earliest and latest calendar date over every order timestamp column.
const ORDER_DATE_RANGE_SQL: &str = r#"
SELECT MIN(d), MAX(d) FROM (
    SELECT date(order_purchase_timestamp)      AS d FROM stg_orders
    UNION ALL SELECT date(order_approved_at)             FROM stg_orders
    UNION ALL SELECT date(order_delivered_carrier_date)  FROM stg_orders
    UNION ALL SELECT date(order_delivered_customer_date) FROM stg_orders
    UNION ALL SELECT date(order_estimated_delivery_date) FROM stg_orders
)
WHERE d IS NOT NULL
"#;

/// Build order: geography first, since customers and sellers look it up.
const SQL_DIMENSIONS: &[(&str, &str)] = &[
    ("dim_geography", GEOGRAPHY_SQL),
    ("dim_customers", CUSTOMERS_SQL),
    ("dim_sellers", SELLERS_SQL),
    ("dim_products", PRODUCTS_SQL),
];

pub struct DimensionStage;

#[async_trait]
impl Stage for DimensionStage {
    fn name(&self) -> StageName {
        StageName::Dimensions
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let counts = build_dimensions(ctx.store).await?;
        Ok(StageOutcome::new(self.name()).with_tables(counts))
    }
}

/// Rebuild all dimension tables. Returns `(table, rows)` in build order.
#[instrument(skip_all)]
pub async fn build_dimensions(store: &Store) -> Result<Vec<(String, u64)>> {
    let mut counts = Vec::with_capacity(DIMENSION_TABLES.len());
    for (table, sql) in SQL_DIMENSIONS {
        store.execute_batch(sql).await?;
        let rows = store.count_rows(table).await?;
        info!(%table, rows, "dimension built");
        counts.push((table.to_string(), rows));
    }

    let days = build_calendar(store).await?;
    info!(table = "dim_date", rows = days, "dimension built");
    counts.push(("dim_date".to_string(), days));

    Ok(counts)
}

/// Generate `dim_date` over the order date range. No orders, no calendar.
async fn build_calendar(store: &Store) -> Result<u64> {
    store.execute_batch(DATE_DDL).await?;

    let Some((start, end)) = order_date_range(store).await? else {
        return Ok(0);
    };

    let columns: Vec<String> = CalendarDay::COLUMNS.iter().map(|c| c.to_string()).collect();
    let rows = calendar_days(start, end)
        .iter()
        .map(CalendarDay::to_values)
        .collect();
    store.insert_rows("dim_date", &columns, rows, 500).await
}

async fn order_date_range(store: &Store) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let result = store.query(ORDER_DATE_RANGE_SQL, vec![]).await?;
    let Some(row) = result.rows.first() else {
        return Ok(None);
    };
    match (row.first(), row.get(1)) {
        (Some(Value::Text(min)), Some(Value::Text(max))) => {
            Ok(Some((parse_date(min)?, parse_date(max)?)))
        }
        _ => Ok(None),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| StarloadError::validation(format!("unreadable order date '{s}': {e}")))
}
