//! Core pipeline stages and orchestration for starload.
//!
//! This crate turns the extracted Olist files into a star schema: bulk load
//! into staging, clean in place, build dimensions and facts, define the
//! analytical views, and validate the result. [`pipeline`] wires the stages
//! into an ordered, transactional run.

pub mod calendar;
pub mod clean;
pub mod dimensions;
pub mod facts;
pub mod load;
pub mod pipeline;
pub mod validate;
pub mod views;

#[cfg(test)]
pub(crate) mod test_support;

pub use pipeline::{
    Pipeline, ProgressReporter, RunKind, RunOptions, RunSummary, SilentProgress, Stage,
    StageContext, StageOutcome, run_pipeline, run_validation_only,
};
pub use validate::{CheckCategory, CheckResult, Outcome, ValidationReport};
pub use views::{ViewSample, sample_view, view_json};
