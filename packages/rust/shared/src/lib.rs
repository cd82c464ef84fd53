//! Shared types, error model, and configuration for starload.
//!
//! This crate is the foundation depended on by all other starload crates.
//! It provides:
//! - [`StarloadError`], the unified error type
//! - Domain types ([`SourceManifest`], [`StageName`], [`RunId`], the table catalog)
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DEFAULT_MAX_ROWS, LoadConfig, RowBound, RunConfig, SourceConfig, StoreConfig,
    ValidateConfig, config_dir, config_file_path, init_config, load_config, load_config_from,
    parse_base_url,
};
pub use error::{Result, StarloadError};
pub use types::{
    DIMENSION_TABLES, FACT_TABLES, Namespace, RunId, RunStatus, STAGING_TABLES, SourceFile,
    SourceManifest, StageName, VIEW_NAMES, part_number,
};
