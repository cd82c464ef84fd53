//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use starload_core::{
    CheckResult, Pipeline, ProgressReporter, RunOptions, RunSummary, StageOutcome, ViewSample,
    run_pipeline, run_validation_only, sample_view, view_json,
};
use starload_extract::{ExtractOptions, extract};
use starload_shared::{
    AppConfig, Namespace, RunConfig, RunStatus, SourceManifest, StageName, init_config,
    load_config, load_config_from,
};
use starload_storage::Store;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// starload: rebuild the Olist star schema from the raw export.
#[derive(Parser)]
#[command(
    name = "starload",
    version,
    about = "Extract, load, clean, and model the Olist dataset into a validated star schema.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that override values from the config file.
#[derive(Args, Debug)]
pub(crate) struct Overrides {
    /// Config file to read instead of ~/.starload/starload.toml.
    #[arg(long, env = "STARLOAD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Database file (overrides store.path).
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Data directory (overrides load.data_dir).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the full pipeline: extract, load, clean, model, validate.
    Run {
        /// Reuse the files already in the data dir.
        #[arg(long)]
        skip_extract: bool,

        /// Start even if the run log shows another run in progress.
        #[arg(long)]
        force: bool,
    },

    /// Fetch the raw files into the data dir and stop.
    Extract,

    /// Re-validate the current store without rebuilding anything.
    Validate {
        /// Start even if the run log shows another run in progress.
        #[arg(long)]
        force: bool,
    },

    /// Show row counts per namespace and the most recent runs.
    Status {
        /// Number of runs to list.
        #[arg(long, default_value = "5")]
        runs: u32,
    },

    /// Print the rows of an analytical view.
    View {
        /// View name, e.g. vw_monthly_revenue.
        name: String,

        /// Maximum rows to print.
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Print rows as typed JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "starload=info",
        1 => "starload=debug",
        _ => "starload=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let overrides = cli.overrides;
    match cli.command {
        Command::Run {
            skip_extract,
            force,
        } => cmd_run(&overrides, skip_extract, force).await,
        Command::Extract => cmd_extract(&overrides).await,
        Command::Validate { force } => cmd_validate(&overrides, force).await,
        Command::Status { runs } => cmd_status(&overrides, runs).await,
        Command::View { name, limit, json } => cmd_view(&overrides, &name, limit, json).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&overrides).await,
        },
    }
}

/// Load the config file (explicit path or default location) and apply flag
/// overrides on top.
fn resolve_config(overrides: &Overrides) -> Result<AppConfig> {
    let mut config = match &overrides.config {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    if let Some(db) = &overrides.db {
        config.store.path = db.to_string_lossy().into_owned();
    }
    if let Some(dir) = &overrides.data_dir {
        config.load.data_dir = dir.to_string_lossy().into_owned();
    }
    Ok(config)
}

fn resolve_run_config(overrides: &Overrides) -> Result<(AppConfig, RunConfig)> {
    let config = resolve_config(overrides)?;
    let run_config = RunConfig::try_from(&config)?;
    Ok((config, run_config))
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(overrides: &Overrides, skip_extract: bool, force: bool) -> Result<()> {
    let (config, run_config) = resolve_run_config(overrides)?;
    let store = Store::open(Path::new(&config.store.path)).await?;

    let mut pipeline = Pipeline::standard();
    if skip_extract {
        pipeline = pipeline.without(StageName::Extract);
    }

    info!(
        db = %config.store.path,
        data_dir = %run_config.data_dir.display(),
        skip_extract,
        force,
        "starting pipeline run"
    );

    let reporter = CliProgress::new();
    let summary = run_pipeline(
        &pipeline,
        &store,
        &run_config,
        &SourceManifest::olist(),
        RunOptions { force },
        &reporter,
    )
    .await?;

    print_summary(&summary);
    finish(&summary)
}

async fn cmd_extract(overrides: &Overrides) -> Result<()> {
    let (_, run_config) = resolve_run_config(overrides)?;
    let opts = ExtractOptions {
        base_url: run_config.base_url.clone(),
        data_dir: run_config.data_dir.clone(),
        timeout_secs: run_config.timeout_secs,
    };

    info!(base_url = %opts.base_url, data_dir = %opts.data_dir.display(), "extracting");

    let spinner = spinner();
    spinner.set_message("Extracting source files");
    let result = extract(&SourceManifest::olist(), &opts).await;
    spinner.finish_and_clear();
    let report = result?;

    println!();
    println!("  Extracted into {}", report.data_dir.display());
    let rows: Vec<Vec<String>> = report
        .files
        .iter()
        .map(|f| {
            vec![
                f.name.clone(),
                f.parts.to_string(),
                f.data_rows.to_string(),
                f.bytes.to_string(),
                f.sha256.chars().take(12).collect(),
            ]
        })
        .collect();
    print_table(&["file", "parts", "rows", "bytes", "sha256"], &rows);
    println!("  Total rows: {}", report.total_rows());
    println!();

    Ok(())
}

async fn cmd_validate(overrides: &Overrides, force: bool) -> Result<()> {
    let (config, run_config) = resolve_run_config(overrides)?;
    let store = Store::open(Path::new(&config.store.path)).await?;

    let reporter = CliProgress::new();
    let summary = run_validation_only(&store, &run_config, RunOptions { force }, &reporter).await?;

    print_summary(&summary);
    finish(&summary)
}

async fn cmd_status(overrides: &Overrides, runs: u32) -> Result<()> {
    let config = resolve_config(overrides)?;
    let store = Store::open_readonly(Path::new(&config.store.path)).await?;

    println!();
    println!("  Store: {} (schema v{})", config.store.path, store.schema_version().await);

    for namespace in [
        Namespace::Staging,
        Namespace::Dimension,
        Namespace::Fact,
        Namespace::View,
    ] {
        let mut rows = Vec::new();
        for relation in namespace.relations() {
            let count = if store.relation_exists(relation).await? {
                store.count_rows(relation).await?.to_string()
            } else {
                "missing".to_string()
            };
            rows.push(vec![(*relation).to_string(), count]);
        }
        println!();
        println!("  [{}]", namespace.as_str());
        print_table(&["relation", "rows"], &rows);
    }

    let recent = store.recent_runs(runs).await?;
    println!();
    println!("  Recent runs");
    if recent.is_empty() {
        println!("  (none)");
    } else {
        let rows: Vec<Vec<String>> = recent
            .iter()
            .map(|r| {
                vec![
                    r.id.clone(),
                    r.kind.clone(),
                    r.status.to_string(),
                    r.started_at.clone(),
                    r.finished_at.clone().unwrap_or_else(|| "-".into()),
                    r.failed_stage.clone().unwrap_or_else(|| "-".into()),
                ]
            })
            .collect();
        print_table(
            &["id", "kind", "status", "started", "finished", "failed stage"],
            &rows,
        );
    }
    println!();

    Ok(())
}

async fn cmd_view(overrides: &Overrides, name: &str, limit: u32, json: bool) -> Result<()> {
    let config = resolve_config(overrides)?;
    let store = Store::open_readonly(Path::new(&config.store.path)).await?;

    if json {
        let value = first_rows(view_json(&store, name).await?, limit);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let sample = sample_view(&store, name, limit).await?;
    println!();
    print_sample(&sample);
    println!();
    Ok(())
}

/// Keep the first `limit` rows of a JSON row array.
fn first_rows(mut value: serde_json::Value, limit: u32) -> serde_json::Value {
    if let serde_json::Value::Array(rows) = &mut value {
        rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
    }
    value
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(overrides: &Overrides) -> Result<()> {
    let config = resolve_config(overrides)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        Self { spinner: spinner() }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: StageName, index: usize, total: usize) {
        self.spinner.set_message(format!("[{}/{total}] {stage}", index + 1));
    }

    fn stage_finished(&self, outcome: &StageOutcome) {
        self.spinner.println(format!(
            "  done  {:<10} {:>9} rows  {:>6} ms",
            outcome.stage.as_str(),
            outcome.total_rows(),
            outcome.elapsed_ms
        ));
    }

    fn done(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Run:     {}", summary.run_id);
    println!("  Kind:    {}", summary.kind.as_str());
    println!("  Status:  {}", summary.status);
    println!("  Time:    {:.1}s", summary.elapsed_ms as f64 / 1000.0);

    for outcome in &summary.stages {
        if outcome.tables.is_empty() || outcome.validation.is_some() {
            continue;
        }
        println!();
        println!("  [{}]", outcome.stage);
        let rows: Vec<Vec<String>> = outcome
            .tables
            .iter()
            .map(|(table, count)| vec![table.clone(), count.to_string()])
            .collect();
        print_table(&["table", "rows"], &rows);
    }

    if let Some(report) = summary.validation() {
        println!();
        println!(
            "  Validation: {} passed, {} failed",
            report.pass_count(),
            report.failures().count()
        );
        for check in &report.checks {
            print_check(check);
        }
        for sample in report.checks.iter().filter_map(|c| c.sample.as_ref()) {
            println!();
            print_sample(sample);
        }
    }
    println!();
}

fn print_check(check: &CheckResult) {
    let mark = if check.passed() { "PASS" } else { "FAIL" };
    println!("  {mark}  {:<58} {}", check.name, check.detail);
}

fn print_sample(sample: &ViewSample) {
    println!("  {} ({} rows)", sample.view, sample.rows.len());
    let headers: Vec<&str> = sample.columns.iter().map(String::as_str).collect();
    print_table(&headers, &sample.rows);
}

/// Print rows as a left-aligned, space-padded table.
fn print_table<S: AsRef<str>>(headers: &[S], rows: &[Vec<String>]) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.as_ref().chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(i) {
                *w = (*w).max(cell.chars().count());
            }
        }
    }

    let render = |cells: &[&str]| -> String {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:<width$}", width = *width))
            .collect();
        format!("  {}", padded.join("  ").trim_end())
    };

    let header: Vec<&str> = headers.iter().map(|h| h.as_ref()).collect();
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let rule: Vec<&str> = rule.iter().map(String::as_str).collect();

    println!("{}", render(&header));
    println!("{}", render(&rule));
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        println!("{}", render(&cells));
    }
}

/// Turn a flagged run into a non-zero exit.
fn finish(summary: &RunSummary) -> Result<()> {
    match summary.status {
        RunStatus::Flagged => {
            let failed = summary
                .validation()
                .map(|r| r.failures().count())
                .unwrap_or_default();
            Err(eyre!(
                "run {} flagged: {failed} validation check(s) failed",
                summary.run_id
            ))
        }
        _ => Ok(()),
    }
}
