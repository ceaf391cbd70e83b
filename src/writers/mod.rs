//! Result writers: sinks for statistics records

pub mod csv_writer;
pub mod http_writer;
pub mod postgres_writer;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{ProbeError, Result};
use crate::stats::StatisticsRecord;

pub use csv_writer::CsvWriter;
pub use http_writer::HttpWriter;
pub use postgres_writer::PostgresWriter;

/// Plugin keyword arguments
pub type Kwargs = BTreeMap<String, String>;

/// Run description handed to every writer before the first record
#[derive(Debug, Clone, Serialize)]
pub struct RunInfo {
    pub run_id: Uuid,
    /// Service list (or replayed statistics file)
    pub services: PathBuf,
    pub result_dir: PathBuf,
    pub started: DateTime<Local>,
    pub replay: bool,
}

impl RunInfo {
    pub fn new(services: impl Into<PathBuf>, result_dir: impl Into<PathBuf>, replay: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            services: services.into(),
            result_dir: result_dir.into(),
            started: Local::now(),
            replay,
        }
    }

    /// File stem of the service list, used to name output files
    pub fn services_stem(&self) -> String {
        self.services
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "services".to_string())
    }
}

#[async_trait]
pub trait ResultWriter: Send {
    fn name(&self) -> &str;

    async fn begin(&mut self, run: &RunInfo) -> Result<()>;

    /// Called once per record, in enumeration order
    async fn one_result(&mut self, stats: &StatisticsRecord) -> Result<()>;

    async fn end(&mut self) -> Result<()>;
}

/// Fail on kwargs the plugin does not understand
pub(crate) fn check_kwargs(plugin: &str, kwargs: &Kwargs, allowed: &[&str]) -> Result<()> {
    match kwargs.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(key) => Err(ProbeError::Config(format!(
            "plugin {} does not accept argument '{}' (expected one of: {})",
            plugin,
            key,
            allowed.join(", ")
        ))),
        None => Ok(()),
    }
}

/// Record values in column order
pub(crate) fn ordered_values(stats: &StatisticsRecord) -> Vec<(String, Value)> {
    let mut row = stats.row_values();
    stats
        .columns()
        .into_iter()
        .map(|col| {
            let value = row.remove(&col).unwrap_or(Value::Null);
            (col, value)
        })
        .collect()
}
