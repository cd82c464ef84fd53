//! Bulk loader: normalized CSV files → staging tables.
//!
//! Reads only from the configured data dir, and only when bulk loading has
//! been switched on. Each staging table is cleared and refilled with batched
//! multi-row inserts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use libsql::Value;
use serde::Serialize;
use tracing::{debug, info, instrument};

use starload_shared::{Result, RunConfig, SourceFile, SourceManifest, StageName, StarloadError};
use starload_storage::{ColumnAffinity, ColumnInfo, Store, quote_ident};

use crate::pipeline::{Stage, StageContext, StageOutcome};

/// Rows loaded into one staging table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLoad {
    pub file: String,
    pub table: String,
    pub rows: u64,
}

/// Pipeline stage wrapping [`load_staging`].
pub struct LoadStage;

#[async_trait]
impl Stage for LoadStage {
    fn name(&self) -> StageName {
        StageName::Load
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let loads = load_staging(ctx.store, ctx.manifest, ctx.config).await?;
        Ok(StageOutcome::new(self.name())
            .with_tables(loads.into_iter().map(|l| (l.table, l.rows))))
    }
}

/// Load every manifest file into its staging table.
#[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
pub async fn load_staging(
    store: &Store,
    manifest: &SourceManifest,
    config: &RunConfig,
) -> Result<Vec<TableLoad>> {
    if !config.bulk_load_enabled {
        return Err(StarloadError::config(
            "bulk loading is disabled; set load.bulk_load_enabled = true",
        ));
    }

    let data_dir = config
        .data_dir
        .canonicalize()
        .map_err(|e| StarloadError::io(&config.data_dir, e))?;

    let mut loads = Vec::with_capacity(manifest.files.len());
    for file in &manifest.files {
        let path = permitted_path(&data_dir, file)?;
        let rows = load_file(store, file, &path, config.batch_rows).await?;
        info!(table = %file.staging_table, rows, "staging table loaded");
        loads.push(TableLoad {
            file: file.name.clone(),
            table: file.staging_table.clone(),
            rows,
        });
    }
    Ok(loads)
}

/// Resolve `file` inside `data_dir`, refusing anything that escapes it
/// (absolute names, `..`, symlinks pointing elsewhere).
fn permitted_path(data_dir: &Path, file: &SourceFile) -> Result<PathBuf> {
    let candidate = data_dir.join(&file.name);
    let resolved = candidate.canonicalize().map_err(|e| {
        StarloadError::load(&file.name, None, format!("cannot open {}: {e}", candidate.display()))
    })?;
    if !resolved.starts_with(data_dir) {
        return Err(StarloadError::load(
            &file.name,
            None,
            format!(
                "{} is outside the permitted data dir {}",
                resolved.display(),
                data_dir.display()
            ),
        ));
    }
    Ok(resolved)
}

async fn load_file(store: &Store, file: &SourceFile, path: &Path, batch_rows: usize) -> Result<u64> {
    let columns = store.table_columns(&file.staging_table).await?;
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StarloadError::load(&file.name, None, e.to_string()))?;

    let header: Vec<String> = reader
        .headers()
        .map_err(|e| StarloadError::load(&file.name, Some(1), e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    if header != names {
        return Err(StarloadError::load(
            &file.name,
            Some(1),
            format!(
                "header does not match {}: expected [{}], found [{}]",
                file.staging_table,
                names.join(", "),
                header.join(", ")
            ),
        ));
    }

    store
        .execute(&format!("DELETE FROM {}", quote_ident(&file.staging_table)?), vec![])
        .await?;

    let mut total = 0u64;
    let mut pending: Vec<Vec<Value>> = Vec::with_capacity(batch_rows);
    for record in reader.records() {
        let record = record.map_err(|e| {
            let line = e.position().map(|p| p.line());
            StarloadError::load(&file.name, line, e.to_string())
        })?;
        let line = record.position().map(|p| p.line());

        if record.len() != columns.len() {
            return Err(StarloadError::load(
                &file.name,
                line,
                format!("expected {} fields, found {}", columns.len(), record.len()),
            ));
        }

        let row = record
            .iter()
            .zip(&columns)
            .map(|(raw, column)| {
                parse_field(raw, column)
                    .map_err(|message| StarloadError::load(&file.name, line, message))
            })
            .collect::<Result<Vec<_>>>()?;
        pending.push(row);

        if pending.len() >= batch_rows {
            total += store
                .insert_rows(&file.staging_table, &names, std::mem::take(&mut pending), batch_rows)
                .await?;
        }
    }
    if !pending.is_empty() {
        total += store
            .insert_rows(&file.staging_table, &names, pending, batch_rows)
            .await?;
    }

    debug!(file = %file.name, rows = total, "file ingested");
    Ok(total)
}

/// Convert one raw CSV field to a value matching the column's type.
///
/// Text is kept verbatim. Numeric columns treat a blank field as NULL and
/// reject anything unparsable.
fn parse_field(raw: &str, column: &ColumnInfo) -> std::result::Result<Value, String> {
    if column.affinity == ColumnAffinity::Text {
        return Ok(Value::Text(raw.to_string()));
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Value::Null);
    }
    match column.affinity {
        ColumnAffinity::Integer => parse_integer(trimmed)
            .map(Value::Integer)
            .ok_or_else(|| format!("column {}: '{raw}' is not an integer", column.name)),
        ColumnAffinity::Real => trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .map(Value::Real)
            .ok_or_else(|| format!("column {}: '{raw}' is not a number", column.name)),
        ColumnAffinity::Text => Ok(Value::Text(raw.to_string())),
    }
}

/// Integers may be exported as `40.0`; accept those, reject real fractions.
fn parse_integer(s: &str) -> Option<i64> {
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    let f = s.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}
