//! Core domain types: source manifest, table catalog, stage names, run ids.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StarloadError};

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for pipeline run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Stages and run status
// ---------------------------------------------------------------------------

/// The pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Extract,
    Load,
    Clean,
    Dimensions,
    Facts,
    Views,
    Validate,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Load => "load",
            Self::Clean => "clean",
            Self::Dimensions => "dimensions",
            Self::Facts => "facts",
            Self::Views => "views",
            Self::Validate => "validate",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a pipeline run, as recorded in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Stages are executing.
    Running,
    /// Every stage completed and every validation check passed.
    Succeeded,
    /// Every stage completed but at least one validation check failed.
    Flagged,
    /// A stage failed fatally; downstream stages did not run.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Flagged => "flagged",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = StarloadError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "flagged" => Ok(Self::Flagged),
            "failed" => Ok(Self::Failed),
            other => Err(StarloadError::validation(format!("unknown run status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Table catalog
// ---------------------------------------------------------------------------

/// Storage namespaces, each rebuilt by exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Staging,
    Dimension,
    Fact,
    View,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Dimension => "dimension",
            Self::Fact => "fact",
            Self::View => "view",
        }
    }

    /// Relations owned by this namespace, in build order.
    pub fn relations(&self) -> &'static [&'static str] {
        match self {
            Self::Staging => STAGING_TABLES,
            Self::Dimension => DIMENSION_TABLES,
            Self::Fact => FACT_TABLES,
            Self::View => VIEW_NAMES,
        }
    }
}

pub const STAGING_TABLES: &[&str] = &[
    "stg_customers",
    "stg_geolocation",
    "stg_order_items",
    "stg_order_payments",
    "stg_order_reviews",
    "stg_orders",
    "stg_products",
    "stg_sellers",
    "stg_category_translation",
];

pub const DIMENSION_TABLES: &[&str] = &[
    "dim_geography",
    "dim_customers",
    "dim_sellers",
    "dim_products",
    "dim_date",
];

pub const FACT_TABLES: &[&str] = &[
    "fact_orders",
    "fact_order_items",
    "fact_payments",
    "fact_reviews",
];

pub const VIEW_NAMES: &[&str] = &[
    "vw_monthly_revenue",
    "vw_delivery_performance",
    "vw_seller_performance",
    "vw_product_category_performance",
    "vw_customer_segments",
];

// ---------------------------------------------------------------------------
// Source manifest
// ---------------------------------------------------------------------------

/// Number of parts the geolocation export is split into at the artifact store.
pub const GEOLOCATION_PARTS: u32 = 11;

static PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_part_(\d+)\.[A-Za-z0-9]+$").expect("valid regex"));

/// One logical source file and the remote objects it is assembled from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// File name written to the data dir (e.g., `olist_orders_dataset.csv`).
    pub name: String,
    /// Remote object names, in concatenation order. A single-part file lists itself.
    pub parts: Vec<String>,
    /// Staging table this file is bulk-loaded into.
    pub staging_table: String,
}

impl SourceFile {
    /// A file stored as a single remote object.
    pub fn single(name: &str, staging_table: &str) -> Self {
        Self {
            name: name.to_string(),
            parts: vec![name.to_string()],
            staging_table: staging_table.to_string(),
        }
    }

    /// A file split into `count` numbered parts: `<stem>_part_01.<ext>` …
    pub fn split(name: &str, staging_table: &str, count: u32) -> Self {
        let (stem, ext) = name.rsplit_once('.').unwrap_or((name, "csv"));
        let parts = (1..=count)
            .map(|n| format!("{stem}_part_{n:02}.{ext}"))
            .collect();
        Self {
            name: name.to_string(),
            parts,
            staging_table: staging_table.to_string(),
        }
    }

    pub fn is_split(&self) -> bool {
        self.parts.len() > 1
    }

    /// Check that split parts are numbered 1..=N, in declared order, with no gaps.
    pub fn check_part_sequence(&self) -> Result<()> {
        if !self.is_split() {
            return Ok(());
        }
        for (idx, part) in self.parts.iter().enumerate() {
            let expected = idx as u32 + 1;
            let number = part_number(part).ok_or_else(|| {
                StarloadError::extraction(format!(
                    "{}: part '{part}' has no part number",
                    self.name
                ))
            })?;
            if number != expected {
                return Err(StarloadError::extraction(format!(
                    "{}: part '{part}' is out of sequence (expected part {expected}, found {number})",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Parse the numeric suffix of a `*_part_NN.ext` object name.
pub fn part_number(part: &str) -> Option<u32> {
    PART_RE
        .captures(part)
        .and_then(|caps| caps[1].parse::<u32>().ok())
}

/// The full, ordered set of files a pipeline run extracts and loads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceManifest {
    pub files: Vec<SourceFile>,
}

impl SourceManifest {
    /// The Olist e-commerce export: 8 single files plus geolocation in 11 parts.
    pub fn olist() -> Self {
        Self {
            files: vec![
                SourceFile::single("olist_customers_dataset.csv", "stg_customers"),
                SourceFile::split(
                    "olist_geolocation_dataset.csv",
                    "stg_geolocation",
                    GEOLOCATION_PARTS,
                ),
                SourceFile::single("olist_order_items_dataset.csv", "stg_order_items"),
                SourceFile::single("olist_order_payments_dataset.csv", "stg_order_payments"),
                SourceFile::single("olist_order_reviews_dataset.csv", "stg_order_reviews"),
                SourceFile::single("olist_orders_dataset.csv", "stg_orders"),
                SourceFile::single("olist_products_dataset.csv", "stg_products"),
                SourceFile::single("olist_sellers_dataset.csv", "stg_sellers"),
                SourceFile::single(
                    "product_category_name_translation.csv",
                    "stg_category_translation",
                ),
            ],
        }
    }

    /// Validate every file's part sequence.
    pub fn check(&self) -> Result<()> {
        if self.files.is_empty() {
            return Err(StarloadError::extraction("manifest declares no files"));
        }
        self.files.iter().try_for_each(SourceFile::check_part_sequence)
    }

    /// Total number of remote objects to fetch.
    pub fn object_count(&self) -> usize {
        self.files.iter().map(|f| f.parts.len()).sum()
    }
}

impl Default for SourceManifest {
    fn default() -> Self {
        Self::olist()
    }
}
