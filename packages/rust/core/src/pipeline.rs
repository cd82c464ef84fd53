//! Pipeline orchestration: Extract → Load → Clean → Dimensions → Facts →
//! Views → Validate.
//!
//! Stages run strictly in order against one store handle. Every stage that
//! writes runs inside its own transaction, so a failure rolls that stage back
//! and leaves earlier stages' committed tables intact. Each run is recorded in
//! the `pipeline_runs` log.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use starload_extract::{ExtractOptions, extract};
use starload_shared::{
    Result, RunConfig, RunId, RunStatus, SourceManifest, StageName, StarloadError,
};
use starload_storage::Store;

use crate::clean::CleanStage;
use crate::dimensions::DimensionStage;
use crate::facts::FactStage;
use crate::load::LoadStage;
use crate::validate::{ValidateStage, ValidationReport};
use crate::views::ViewStage;

/// Everything a stage may touch: the store, the run config, the manifest.
pub struct StageContext<'a> {
    pub store: &'a Store,
    pub config: &'a RunConfig,
    pub manifest: &'a SourceManifest,
}

/// What one stage produced.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub stage: StageName,
    /// Rows per table (or view, or source file) the stage wrote or checked.
    pub tables: BTreeMap<String, u64>,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
}

impl StageOutcome {
    pub fn new(stage: StageName) -> Self {
        Self {
            stage,
            tables: BTreeMap::new(),
            elapsed_ms: 0,
            validation: None,
        }
    }

    pub fn with_tables(mut self, tables: impl IntoIterator<Item = (String, u64)>) -> Self {
        self.tables.extend(tables);
        self
    }

    pub fn with_validation(mut self, report: ValidationReport) -> Self {
        self.validation = Some(report);
        self
    }

    pub fn total_rows(&self) -> u64 {
        self.tables.values().sum()
    }
}

/// One unit of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    /// Whether the stage writes to the store, and so runs in a transaction.
    fn touches_store(&self) -> bool {
        true
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome>;
}

/// Fetches the manifest into the data dir.
pub struct ExtractStage;

#[async_trait]
impl Stage for ExtractStage {
    fn name(&self) -> StageName {
        StageName::Extract
    }

    fn touches_store(&self) -> bool {
        false
    }

    async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
        let opts = ExtractOptions {
            base_url: ctx.config.base_url.clone(),
            data_dir: ctx.config.data_dir.clone(),
            timeout_secs: ctx.config.timeout_secs,
        };
        let report = extract(ctx.manifest, &opts).await?;
        Ok(StageOutcome::new(self.name())
            .with_tables(report.files.into_iter().map(|f| (f.name, f.data_rows))))
    }
}

/// An explicit, ordered list of stages.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// The full pipeline, in dependency order.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(ExtractStage),
            Box::new(LoadStage),
            Box::new(CleanStage),
            Box::new(DimensionStage),
            Box::new(FactStage),
            Box::new(ViewStage),
            Box::new(ValidateStage),
        ])
    }

    /// Validation only, for re-checking a store without rebuilding it.
    pub fn validation_only() -> Self {
        Self::new(vec![Box::new(ValidateStage)])
    }

    /// Drop a stage, e.g. extraction when the data dir is already populated.
    pub fn without(mut self, name: StageName) -> Self {
        self.stages.retain(|s| s.name() != name);
        self
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a stage starts.
    fn stage_started(&self, stage: StageName, index: usize, total: usize);
    /// Called after a stage commits.
    fn stage_finished(&self, outcome: &StageOutcome);
    /// Called when the run ends, successfully or not.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: StageName, _index: usize, _total: usize) {}
    fn stage_finished(&self, _outcome: &StageOutcome) {}
    fn done(&self, _summary: &RunSummary) {}
}

/// Options for [`run_pipeline`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Start even if the log shows another run as `running`; those runs are
    /// marked failed first.
    pub force: bool,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub kind: RunKind,
    pub status: RunStatus,
    pub stages: Vec<StageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    /// The validation report, if the run got as far as validating.
    pub fn validation(&self) -> Option<&ValidationReport> {
        self.stages.iter().rev().find_map(|s| s.validation.as_ref())
    }
}

/// What the run log records a run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Run,
    Validate,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Validate => "validate",
        }
    }
}

/// Serialized into `pipeline_runs.stats_json`: per-stage row counts and
/// timings plus validation tallies, without view samples.
#[derive(Serialize)]
struct RunStats<'a> {
    stages: Vec<StageStats<'a>>,
}

#[derive(Serialize)]
struct StageStats<'a> {
    stage: StageName,
    elapsed_ms: u64,
    tables: &'a BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks_passed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checks_failed: Option<usize>,
}

fn stats_json(stages: &[StageOutcome]) -> String {
    let stats = RunStats {
        stages: stages
            .iter()
            .map(|s| StageStats {
                stage: s.stage,
                elapsed_ms: s.elapsed_ms,
                tables: &s.tables,
                checks_passed: s.validation.as_ref().map(|v| v.pass_count()),
                checks_failed: s.validation.as_ref().map(|v| v.failures().count()),
            })
            .collect(),
    };
    serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string())
}

/// Run the full pipeline, or any custom stage list.
///
/// A stage failure rolls that stage back, records the run as `failed`, and
/// returns the error attributed to the stage. A run whose validation finds
/// problems completes with status `flagged`.
#[instrument(skip_all, fields(stages = pipeline.stages.len()))]
pub async fn run_pipeline(
    pipeline: &Pipeline,
    store: &Store,
    config: &RunConfig,
    manifest: &SourceManifest,
    options: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    execute(pipeline, RunKind::Run, store, config, manifest, options, progress).await
}

/// Re-run validation against the current store without rebuilding anything.
#[instrument(skip_all)]
pub async fn run_validation_only(
    store: &Store,
    config: &RunConfig,
    options: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    let manifest = SourceManifest::olist();
    execute(
        &Pipeline::validation_only(),
        RunKind::Validate,
        store,
        config,
        &manifest,
        options,
        progress,
    )
    .await
}

async fn execute(
    pipeline: &Pipeline,
    kind: RunKind,
    store: &Store,
    config: &RunConfig,
    manifest: &SourceManifest,
    options: RunOptions,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    claim_store(store, options).await?;

    let start = Instant::now();
    let run_id = RunId::new();
    store.insert_run(&run_id, kind.as_str()).await?;
    info!(%run_id, kind = kind.as_str(), stages = ?pipeline.stage_names(), "run started");

    let ctx = StageContext {
        store,
        config,
        manifest,
    };
    let total = pipeline.stages.len();
    let mut outcomes: Vec<StageOutcome> = Vec::with_capacity(total);

    for (index, stage) in pipeline.stages.iter().enumerate() {
        let name = stage.name();
        progress.stage_started(name, index, total);

        match run_stage(stage.as_ref(), &ctx).await {
            Ok(outcome) => {
                info!(
                    stage = %name,
                    rows = outcome.total_rows(),
                    elapsed_ms = outcome.elapsed_ms,
                    "stage complete"
                );
                progress.stage_finished(&outcome);
                outcomes.push(outcome);
            }
            Err(e) => {
                error!(stage = %name, error = %e, "stage failed, aborting run");
                let message = e.to_string();
                store
                    .finish_run(
                        &run_id,
                        RunStatus::Failed,
                        Some(name),
                        Some(&message),
                        &stats_json(&outcomes),
                    )
                    .await?;
                let summary = RunSummary {
                    run_id,
                    kind,
                    status: RunStatus::Failed,
                    stages: outcomes,
                    failed_stage: Some(name),
                    error: Some(message),
                    elapsed_ms: elapsed_ms(start),
                };
                progress.done(&summary);
                return Err(e.in_stage(name));
            }
        }
    }

    let status = match outcomes.iter().find_map(|o| o.validation.as_ref()) {
        Some(report) if !report.passed() => RunStatus::Flagged,
        _ => RunStatus::Succeeded,
    };
    store
        .finish_run(&run_id, status, None, None, &stats_json(&outcomes))
        .await?;

    let summary = RunSummary {
        run_id,
        kind,
        status,
        stages: outcomes,
        failed_stage: None,
        error: None,
        elapsed_ms: elapsed_ms(start),
    };
    info!(run_id = %summary.run_id, status = %status, elapsed_ms = summary.elapsed_ms, "run finished");
    progress.done(&summary);
    Ok(summary)
}

/// Refuse to start while another run holds the store, unless forced.
async fn claim_store(store: &Store, options: RunOptions) -> Result<()> {
    let running = store.running_runs().await?;
    if running.is_empty() {
        return Ok(());
    }
    if options.force {
        let cleared = store.abandon_running_runs().await?;
        warn!(cleared, "forcing start; marked unfinished runs as failed");
        return Ok(());
    }
    let ids: Vec<&str> = running.iter().map(|r| r.id.as_str()).collect();
    Err(StarloadError::validation(format!(
        "another run is in progress ({}); wait for it or pass --force if it crashed",
        ids.join(", ")
    )))
}

/// Run one stage, inside a transaction when it writes.
async fn run_stage(stage: &dyn Stage, ctx: &StageContext<'_>) -> Result<StageOutcome> {
    let start = Instant::now();
    let transactional = stage.touches_store();

    if transactional {
        ctx.store.begin().await?;
    }

    let result = stage.run(ctx).await;

    let mut outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if transactional {
                if let Err(rollback_err) = ctx.store.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
            }
            return Err(e);
        }
    };

    if transactional {
        if let Err(e) = ctx.store.commit().await {
            if let Err(rollback_err) = ctx.store.rollback().await {
                warn!(error = %rollback_err, "rollback after failed commit failed");
            }
            return Err(e);
        }
    }

    outcome.elapsed_ms = elapsed_ms(start);
    Ok(outcome)
}

fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::test_support::{seed_minimal_star, test_run_config, test_store, write_fixture_dir};

    /// Records callbacks for assertions.
    #[derive(Default)]
    struct RecordingProgress {
        started: Mutex<Vec<StageName>>,
        finished: Mutex<Vec<StageName>>,
        done: Mutex<Option<RunStatus>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn stage_started(&self, stage: StageName, _index: usize, _total: usize) {
            self.started.lock().unwrap().push(stage);
        }
        fn stage_finished(&self, outcome: &StageOutcome) {
            self.finished.lock().unwrap().push(outcome.stage);
        }
        fn done(&self, summary: &RunSummary) {
            *self.done.lock().unwrap() = Some(summary.status);
        }
    }

    /// A stage that writes a row and then fails.
    struct ExplodingStage;

    #[async_trait]
    impl Stage for ExplodingStage {
        fn name(&self) -> StageName {
            StageName::Facts
        }

        async fn run(&self, ctx: &StageContext<'_>) -> Result<StageOutcome> {
            ctx.store
                .execute("DELETE FROM stg_orders", vec![])
                .await?;
            Err(StarloadError::integrity("seller s_ghost missing"))
        }
    }

    fn in_store_stages() -> Pipeline {
        Pipeline::new(vec![
            Box::new(CleanStage),
            Box::new(DimensionStage),
            Box::new(FactStage),
            Box::new(ViewStage),
            Box::new(ValidateStage),
        ])
    }

    #[test]
    fn standard_order() {
        assert_eq!(
            Pipeline::standard().stage_names(),
            [
                StageName::Extract,
                StageName::Load,
                StageName::Clean,
                StageName::Dimensions,
                StageName::Facts,
                StageName::Views,
                StageName::Validate,
            ]
        );
        let skipped = Pipeline::standard().without(StageName::Extract);
        assert_eq!(skipped.stage_names()[0], StageName::Load);
    }

    #[tokio::test]
    async fn successful_run_is_logged() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        let dir = write_fixture_dir(&[]);
        let config = test_run_config(&dir);
        let progress = RecordingProgress::default();

        let summary = run_pipeline(
            &in_store_stages(),
            &store,
            &config,
            &SourceManifest::olist(),
            RunOptions::default(),
            &progress,
        )
        .await
        .expect("run");

        assert_eq!(summary.status, RunStatus::Succeeded);
        assert!(summary.validation().is_some_and(ValidationReport::passed));
        assert_eq!(progress.finished.lock().unwrap().len(), 5);
        assert_eq!(*progress.done.lock().unwrap(), Some(RunStatus::Succeeded));

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].kind, "run");
        let stats: serde_json::Value =
            serde_json::from_str(runs[0].stats_json.as_deref().unwrap()).unwrap();
        assert_eq!(stats["stages"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn failed_stage_rolls_back_and_stops() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        let dir = write_fixture_dir(&[]);
        let config = test_run_config(&dir);
        let progress = RecordingProgress::default();
        let pipeline = Pipeline::new(vec![
            Box::new(CleanStage),
            Box::new(ExplodingStage),
            Box::new(ViewStage),
        ]);

        let err = run_pipeline(
            &pipeline,
            &store,
            &config,
            &SourceManifest::olist(),
            RunOptions::default(),
            &progress,
        )
        .await
        .unwrap_err();

        assert_eq!(err.stage(), Some(StageName::Facts));
        assert!(err.to_string().contains("s_ghost"));
        // The failing stage's delete was rolled back; the next stage never ran.
        assert!(store.count_rows("stg_orders").await.unwrap() > 0);
        assert_eq!(
            *progress.started.lock().unwrap(),
            [StageName::Clean, StageName::Facts]
        );
        assert!(!store.in_transaction());

        let runs = store.recent_runs(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].failed_stage.as_deref(), Some("facts"));
    }

    #[tokio::test]
    async fn validation_findings_flag_the_run() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        store
            .execute(
                "INSERT INTO stg_order_payments VALUES ('o3', 2, 'voucher', 1, -5.00)",
                vec![],
            )
            .await
            .unwrap();
        let dir = write_fixture_dir(&[]);
        let config = test_run_config(&dir);

        let summary = run_pipeline(
            &in_store_stages(),
            &store,
            &config,
            &SourceManifest::olist(),
            RunOptions::default(),
            &SilentProgress,
        )
        .await
        .expect("business-rule findings do not abort");

        assert_eq!(summary.status, RunStatus::Flagged);
        let report = summary.validation().unwrap();
        let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, ["business_rule:payment_value_non_negative"]);
        assert_eq!(store.recent_runs(1).await.unwrap()[0].status, RunStatus::Flagged);
    }

    #[tokio::test]
    async fn concurrent_run_refused_unless_forced() {
        let store = test_store().await;
        seed_minimal_star(&store).await;
        store.insert_run(&RunId::new(), "run").await.unwrap();
        let dir = write_fixture_dir(&[]);
        let config = test_run_config(&dir);

        let err = run_validation_only(&store, &config, RunOptions::default(), &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("another run is in progress"));

        let summary = run_validation_only(&store, &config, RunOptions { force: true }, &SilentProgress)
            .await
            .expect("forced");
        assert_eq!(summary.kind, RunKind::Validate);
        assert!(store.running_runs().await.unwrap().is_empty());
    }

    fn fixture_dir() -> std::path::PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../../fixtures/olist")
            .canonicalize()
            .expect("fixture dataset present")
    }

    #[tokio::test]
    async fn end_to_end_over_fixture_dataset() {
        let store = test_store().await;
        let data_dir = write_fixture_dir(&[]);
        let mut config = test_run_config(&data_dir);
        config.base_url =
            starload_shared::parse_base_url(&format!("file://{}", fixture_dir().display()))
                .unwrap();

        let summary = run_pipeline(
            &Pipeline::standard(),
            &store,
            &config,
            &SourceManifest::olist(),
            RunOptions::default(),
            &SilentProgress,
        )
        .await
        .expect("pipeline over fixtures");

        let failures: Vec<String> = summary
            .validation()
            .map(|v| v.failures().map(|c| format!("{}: {}", c.name, c.detail)).collect())
            .unwrap_or_default();
        assert_eq!(summary.status, RunStatus::Succeeded, "{failures:?}");
        assert_eq!(summary.stages.len(), 7);
        assert_eq!(summary.stages[0].tables["olist_geolocation_dataset.csv"], 12);

        assert_eq!(store.count_rows("stg_geolocation").await.unwrap(), 12);
        assert_eq!(store.count_rows("dim_geography").await.unwrap(), 3);
        assert_eq!(store.count_rows("fact_orders").await.unwrap(), 7);
        assert_eq!(store.count_rows("fact_reviews").await.unwrap(), 5);

        // Dirty casing and padding in the source files were normalized.
        let statuses = store
            .query("SELECT DISTINCT order_status FROM fact_orders ORDER BY 1", vec![])
            .await
            .unwrap();
        let statuses: Vec<String> = statuses
            .rows
            .iter()
            .map(|r| starload_storage::display_value(&r[0]))
            .collect();
        assert_eq!(statuses, ["canceled", "delivered", "shipped"]);

        let segments = crate::views::customer_segments(&store).await.unwrap();
        let u2 = segments.iter().find(|s| s.customer_unique_id == "u2").unwrap();
        assert_eq!(u2.segment, crate::views::Segment::Returning);

        // A full rerun from the extracted files reproduces the same star.
        let keys_before = store
            .query("SELECT customer_id, customer_key FROM dim_customers ORDER BY customer_id", vec![])
            .await
            .unwrap();
        let rerun = run_pipeline(
            &Pipeline::standard().without(StageName::Extract),
            &store,
            &config,
            &SourceManifest::olist(),
            RunOptions::default(),
            &SilentProgress,
        )
        .await
        .expect("rerun");
        assert_eq!(rerun.status, RunStatus::Succeeded);
        assert_eq!(store.count_rows("stg_geolocation").await.unwrap(), 12);
        assert_eq!(store.count_rows("fact_orders").await.unwrap(), 7);
        let keys_after = store
            .query("SELECT customer_id, customer_key FROM dim_customers ORDER BY customer_id", vec![])
            .await
            .unwrap();
        assert_eq!(keys_before.rows, keys_after.rows);
    }
}
