//! Cleaner: in-place normalization of staging text columns.
//!
//! Every text column is trimmed and blank values become NULL. A small rule
//! table adds casing on top: region codes upper-case, categorical labels
//! lower-case. All expressions are row-local and idempotent.

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument};

use starload_shared::{Result, STAGING_TABLES, StageName};
use starload_storage::{ColumnAffinity, Store, quote_ident};

use crate::pipeline::{Stage, StageContext, StageOutcome};

/// Casing applied after trimming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Casing {
    Upper,
    Lower,
}

/// A casing rule for one staging column.
#[derive(Debug, Clone, Copy)]
pub struct CaseRule {
    pub table: &'static str,
    pub column: &'static str,
    pub casing: Casing,
}

const fn rule(table: &'static str, column: &'static str, casing: Casing) -> CaseRule {
    CaseRule {
        table,
        column,
        casing,
    }
}

pub const CASE_RULES: &[CaseRule] = &[
    rule("stg_customers", "customer_state", Casing::Upper),
    rule("stg_sellers", "seller_state", Casing::Upper),
    rule("stg_geolocation", "geolocation_state", Casing::Upper),
    rule("stg_customers", "customer_city", Casing::Lower),
    rule("stg_sellers", "seller_city", Casing::Lower),
    rule("stg_geolocation", "geolocation_city", Casing::Lower),
    rule("stg_products", "product_category_name", Casing::Lower),
    rule("stg_category_translation", "product_category_name", Casing::Lower),
    rule("stg_category_translation", "product_category_name_english", Casing::Lower),
    rule("stg_orders", "order_status", Casing::Lower),
    rule("stg_order_payments", "payment_type", Casing::Lower),
];

/// Whitespace stripped from both ends: space, tab, LF, CR.
const TRIM_CHARS: &str = "' ' || char(9) || char(10) || char(13)";

/// Rows changed in one staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableClean {
    pub table: String,
    pub rows_changed: u64,
}

pub struct CleanStage;

#[async_trait]
impl Stage for CleanStage {
    fn name(&self) -> StageName {
        StageName::Clean
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let cleaned = clean_staging(ctx.store).await?;
        Ok(StageOutcome::new(self.name())
            .with_tables(cleaned.into_iter().map(|c| (c.table, c.rows_changed))))
    }
}

/// Normalize every staging table. Returns how many rows each update touched;
/// a second run over clean data reports zero everywhere.
#[instrument(skip_all)]
pub async fn clean_staging(store: &Store) -> Result<Vec<TableClean>> {
    let mut results = Vec::with_capacity(STAGING_TABLES.len());
    for table in STAGING_TABLES {
        let text_columns: Vec<String> = store
            .table_columns(table)
            .await?
            .into_iter()
            .filter(|c| c.affinity == ColumnAffinity::Text)
            .map(|c| c.name)
            .collect();

        let Some(sql) = clean_statement(table, &text_columns)? else {
            continue;
        };
        debug!(%table, %sql, "cleaning");
        let rows_changed = store.execute(&sql, vec![]).await?;
        info!(%table, rows_changed, "staging table cleaned");
        results.push(TableClean {
            table: table.to_string(),
            rows_changed,
        });
    }
    Ok(results)
}

/// Normalizing expression for one column.
fn column_expr(table: &str, column: &str) -> Result<String> {
    let ident = quote_ident(column)?;
    let trimmed = format!("NULLIF(TRIM({ident}, {TRIM_CHARS}), '')");
    let casing = CASE_RULES
        .iter()
        .find(|r| r.table == table && r.column == column)
        .map(|r| r.casing);
    Ok(match casing {
        Some(Casing::Upper) => format!("UPPER({trimmed})"),
        Some(Casing::Lower) => format!("LOWER({trimmed})"),
        None => trimmed,
    })
}

/// One `UPDATE` normalizing every text column of `table`, limited to rows
/// that would actually change.
fn clean_statement(table: &str, text_columns: &[String]) -> Result<Option<String>> {
    if text_columns.is_empty() {
        return Ok(None);
    }
    let mut sets = Vec::with_capacity(text_columns.len());
    let mut changes = Vec::with_capacity(text_columns.len());
    for column in text_columns {
        let ident = quote_ident(column)?;
        let expr = column_expr(table, column)?;
        changes.push(format!("{ident} IS NOT {expr}"));
        sets.push(format!("{ident} = {expr}"));
    }
    Ok(Some(format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(table)?,
        sets.join(", "),
        changes.join(" OR ")
    )))
}
