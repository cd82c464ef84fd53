//! Post-build validation: row counts, foreign keys, business rules, and view
//! samples.
//!
//! Every check runs regardless of earlier outcomes, and a check that errors
//! (missing table, bad SQL) is recorded as a failure instead of aborting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use starload_shared::{
    DIMENSION_TABLES, FACT_TABLES, Result, STAGING_TABLES, StageName, ValidateConfig, VIEW_NAMES,
};
use starload_storage::{Store, display_value, quote_ident};

use crate::pipeline::{Stage, StageContext, StageOutcome};
use crate::views::{ViewSample, sample_view};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    RowCount,
    NullFk,
    ReferentialIntegrity,
    BusinessRule,
    ViewSample,
}

impl CheckCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RowCount => "row_count",
            Self::NullFk => "null_fk",
            Self::ReferentialIntegrity => "referential_integrity",
            Self::BusinessRule => "business_rule",
            Self::ViewSample => "view_sample",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Pass,
    Fail,
}

/// Result of one validation check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub category: CheckCategory,
    pub outcome: Outcome,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<ViewSample>,
}

impl CheckResult {
    fn settle(
        name: String,
        category: CheckCategory,
        result: Result<(Outcome, String)>,
    ) -> Self {
        let (outcome, detail) = match result {
            Ok(settled) => settled,
            Err(e) => (Outcome::Fail, format!("check could not run: {e}")),
        };
        Self {
            name,
            category,
            outcome,
            detail,
            sample: None,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

/// All check results from one validation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub checks: Vec<CheckResult>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    /// True iff no check failed.
    pub fn passed(&self) -> bool {
        self.checks.iter().all(CheckResult::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| !c.passed())
    }

    pub fn pass_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed()).count()
    }
}

/// A surrogate or natural key column and the column it must resolve to.
struct ForeignKey {
    table: &'static str,
    column: &'static str,
    target: &'static str,
    target_column: &'static str,
    /// Mandatory keys must never be NULL.
    required: bool,
}

const fn fk(
    table: &'static str,
    column: &'static str,
    target: &'static str,
    target_column: &'static str,
    required: bool,
) -> ForeignKey {
    ForeignKey {
        table,
        column,
        target,
        target_column,
        required,
    }
}

const FOREIGN_KEYS: &[ForeignKey] = &[
    fk("fact_orders", "customer_key", "dim_customers", "customer_key", true),
    fk("fact_orders", "purchase_date_key", "dim_date", "date_key", true),
    fk("fact_orders", "delivered_date_key", "dim_date", "date_key", false),
    fk("fact_orders", "estimated_date_key", "dim_date", "date_key", false),
    fk("fact_order_items", "order_key", "fact_orders", "order_key", true),
    fk("fact_order_items", "product_key", "dim_products", "product_key", true),
    fk("fact_order_items", "seller_key", "dim_sellers", "seller_key", true),
    fk("fact_payments", "order_id", "fact_orders", "order_id", true),
    fk("fact_reviews", "order_id", "fact_orders", "order_id", true),
    fk("dim_customers", "geo_key", "dim_geography", "geo_key", false),
    fk("dim_sellers", "geo_key", "dim_geography", "geo_key", false),
];

/// A bound on fact values; `violation` selects offending rows.
struct BusinessRule {
    name: &'static str,
    table: &'static str,
    key_column: &'static str,
    violation: &'static str,
}

const BUSINESS_RULES: &[BusinessRule] = &[
    BusinessRule {
        name: "payment_value_non_negative",
        table: "fact_payments",
        key_column: "order_id",
        violation: "payment_value < 0",
    },
    BusinessRule {
        name: "review_score_in_range",
        table: "fact_reviews",
        key_column: "review_id",
        violation: "review_score IS NULL OR review_score NOT BETWEEN 1 AND 5",
    },
    BusinessRule {
        name: "item_price_non_negative",
        table: "fact_order_items",
        key_column: "order_id",
        violation: "price < 0 OR freight_value < 0",
    },
    BusinessRule {
        name: "installments_non_negative",
        table: "fact_payments",
        key_column: "order_id",
        violation: "installments < 0",
    },
];

/// Offending keys quoted in a business-rule failure.
const SAMPLE_KEYS: u32 = 5;

pub struct ValidateStage;

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> StageName {
        StageName::Validate
    }

    /// Validation only reads; it never needs a write transaction.
    fn touches_store(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let report = validate(ctx.store, &ctx.config.validate).await;
        Ok(StageOutcome::new(self.name()).with_validation(report))
    }
}

/// Run every check and collect the results.
#[instrument(skip_all, fields(sample_rows = config.sample_rows))]
pub async fn validate(store: &Store, config: &ValidateConfig) -> ValidationReport {
    let sample_rows = config.sample_rows;
    let mut checks = Vec::new();

    for table in STAGING_TABLES
        .iter()
        .chain(DIMENSION_TABLES)
        .chain(FACT_TABLES)
    {
        let result = check_row_count(store, config, table).await;
        checks.push(CheckResult::settle(
            format!("row_count:{table}"),
            CheckCategory::RowCount,
            result,
        ));
    }

    for key in FOREIGN_KEYS.iter().filter(|k| k.required) {
        let result = check_not_null(store, key).await;
        checks.push(CheckResult::settle(
            format!("null_fk:{}.{}", key.table, key.column),
            CheckCategory::NullFk,
            result,
        ));
    }

    for key in FOREIGN_KEYS {
        let result = check_resolves(store, key).await;
        checks.push(CheckResult::settle(
            format!(
                "referential_integrity:{}.{}->{}",
                key.table, key.column, key.target
            ),
            CheckCategory::ReferentialIntegrity,
            result,
        ));
    }

    for rule in BUSINESS_RULES {
        let result = check_rule(store, rule).await;
        checks.push(CheckResult::settle(
            format!("business_rule:{}", rule.name),
            CheckCategory::BusinessRule,
            result,
        ));
    }

    for view in VIEW_NAMES {
        let name = format!("view_sample:{view}");
        let check = match sample_view(store, view, sample_rows).await {
            Ok(sample) => CheckResult {
                name,
                category: CheckCategory::ViewSample,
                outcome: Outcome::Pass,
                detail: format!("{} rows sampled", sample.rows.len()),
                sample: Some(sample),
            },
            Err(e) => CheckResult::settle(name, CheckCategory::ViewSample, Err(e)),
        };
        checks.push(check);
    }

    let report = ValidationReport {
        checks,
        validated_at: Utc::now(),
    };
    for failure in report.failures() {
        warn!(check = %failure.name, detail = %failure.detail, "validation check failed");
    }
    info!(
        passed = report.pass_count(),
        total = report.checks.len(),
        "validation complete"
    );
    report
}

async fn check_row_count(
    store: &Store,
    config: &ValidateConfig,
    table: &str,
) -> Result<(Outcome, String)> {
    let bound = config.bound_for(table);
    let rows = store.count_rows(table).await?;
    let detail = format!("{rows} rows (expected {}..={})", bound.min, bound.max);
    let outcome = if (bound.min..=bound.max).contains(&rows) {
        Outcome::Pass
    } else {
        Outcome::Fail
    };
    Ok((outcome, detail))
}

async fn check_not_null(store: &Store, key: &ForeignKey) -> Result<(Outcome, String)> {
    let nulls = store
        .query_i64(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                quote_ident(key.table)?,
                quote_ident(key.column)?
            ),
            vec![],
        )
        .await?
        .unwrap_or(0);
    Ok(if nulls == 0 {
        (Outcome::Pass, "no NULL values".to_string())
    } else {
        (Outcome::Fail, format!("{nulls} rows have NULL {}", key.column))
    })
}

async fn check_resolves(store: &Store, key: &ForeignKey) -> Result<(Outcome, String)> {
    let dangling = store
        .query_i64(
            &format!(
                "SELECT COUNT(*) FROM {table} t
                 WHERE t.{col} IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM {target} r WHERE r.{target_col} = t.{col})",
                table = quote_ident(key.table)?,
                col = quote_ident(key.column)?,
                target = quote_ident(key.target)?,
                target_col = quote_ident(key.target_column)?,
            ),
            vec![],
        )
        .await?
        .unwrap_or(0);
    Ok(if dangling == 0 {
        (Outcome::Pass, format!("every {} resolves", key.column))
    } else {
        (
            Outcome::Fail,
            format!(
                "{dangling} rows reference a missing {}.{}",
                key.target, key.target_column
            ),
        )
    })
}

async fn check_rule(store: &Store, rule: &BusinessRule) -> Result<(Outcome, String)> {
    let table = quote_ident(rule.table)?;
    let violations = store
        .query_i64(
            &format!("SELECT COUNT(*) FROM {table} WHERE {}", rule.violation),
            vec![],
        )
        .await?
        .unwrap_or(0);
    if violations == 0 {
        return Ok((Outcome::Pass, "no violations".to_string()));
    }

    let sample = store
        .query(
            &format!(
                "SELECT DISTINCT {} FROM {table} WHERE {} LIMIT {SAMPLE_KEYS}",
                quote_ident(rule.key_column)?,
                rule.violation
            ),
            vec![],
        )
        .await?;
    let keys: Vec<String> = sample
        .rows
        .iter()
        .filter_map(|r| r.first())
        .map(display_value)
        .collect();
    Ok((
        Outcome::Fail,
        format!(
            "{violations} rows violate `{}` ({}: {})",
            rule.violation,
            rule.key_column,
            keys.join(", ")
        ),
    ))
}
