//! Run configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cone::{DEFAULT_MAX_RADIUS, DEFAULT_MIN_RADIUS};
use crate::error::{ProbeError, Result};
use crate::http::default_user_agent;
use crate::models::TapMode;
use crate::stats::{StatsLayout, DEFAULT_MAX_EXTRA_DURATIONS, RESULT_META_FIELDS};
use crate::tap::PollPolicy;

pub const DEFAULT_RESULT_DIR: &str = "results";
pub const DEFAULT_CONE_LIMIT: usize = 100_000_000;
pub const DEFAULT_WRITER: &str = "csv_writer";
pub const DEFAULT_QUERY_PLUGIN: &str = "timed_query";
pub const DEFAULT_PLUGIN_DIR: &str = "plugins";

/// Per-query settings shared by every attempt of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub result_dir: PathBuf,
    /// Store results under `<result_dir>/<base_name>/`
    pub use_subdir: bool,
    pub tap_mode: TapMode,
    /// Keep result files after their metadata has been read
    pub save_results: bool,
    pub user_agent: String,
    pub max_extra_durations: usize,
    pub poll: PollPolicy,
    /// TAP `FORMAT` parameter
    pub result_format: String,
    pub delete_jobs: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            result_dir: PathBuf::from(DEFAULT_RESULT_DIR),
            use_subdir: true,
            tap_mode: TapMode::Async,
            save_results: false,
            user_agent: default_user_agent(),
            max_extra_durations: DEFAULT_MAX_EXTRA_DURATIONS,
            poll: PollPolicy::default(),
            result_format: "votable".to_string(),
            delete_jobs: false,
        }
    }
}

impl QueryOptions {
    pub fn layout(&self) -> StatsLayout {
        StatsLayout::new(self.max_extra_durations, &RESULT_META_FIELDS)
    }
}

/// Where the positions of a run come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum ConeSource {
    /// Services are queried as-is (replay or fully bound queries)
    None,
    File { path: PathBuf },
    Random {
        num_cones: usize,
        min_radius: f64,
        max_radius: f64,
    },
}

impl ConeSource {
    pub fn random(num_cones: usize, min_radius: Option<f64>, max_radius: Option<f64>) -> Self {
        ConeSource::Random {
            num_cones,
            min_radius: min_radius.unwrap_or(DEFAULT_MIN_RADIUS),
            max_radius: max_radius.unwrap_or(DEFAULT_MAX_RADIUS),
        }
    }
}

/// Everything one batch run needs, as resolved from the command line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Service list, or a statistics file when replaying
    pub services: PathBuf,
    pub replay: bool,
    pub cones: ConeSource,
    pub start_index: usize,
    /// Inclusive cap on the number of positions processed
    pub cone_limit: usize,
    pub writers: Vec<String>,
    pub query_plugin: String,
    pub load_plugins: Option<PathBuf>,
    pub query: QueryOptions,
}

impl RunConfig {
    pub fn new(services: impl Into<PathBuf>, cones: ConeSource) -> Self {
        Self {
            services: services.into(),
            replay: false,
            cones,
            start_index: 0,
            cone_limit: DEFAULT_CONE_LIMIT,
            writers: vec![DEFAULT_WRITER.to_string()],
            query_plugin: DEFAULT_QUERY_PLUGIN.to_string(),
            load_plugins: None,
            query: QueryOptions::default(),
        }
    }

    pub fn replay(services: impl Into<PathBuf>) -> Self {
        Self {
            replay: true,
            ..Self::new(services, ConeSource::None)
        }
    }

    /// Plugin location to scan and whether it must exist
    pub fn plugin_source(&self) -> (PathBuf, bool) {
        match &self.load_plugins {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(DEFAULT_PLUGIN_DIR), false),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.query.max_extra_durations == 0 {
            return Err(ProbeError::Config(
                "max_extra_durations must be at least 1".into(),
            ));
        }
        if self.query.poll.total_timeout.is_zero() {
            return Err(ProbeError::Config("async timeout must be positive".into()));
        }
        if self.writers.is_empty() {
            return Err(ProbeError::Config("at least one writer is required".into()));
        }
        if let ConeSource::Random {
            num_cones,
            min_radius,
            max_radius,
        } = &self.cones
        {
            if *num_cones == 0 {
                return Err(ProbeError::Config("num_cones must be positive".into()));
            }
            if !(0.0 <= *min_radius && min_radius < max_radius) {
                return Err(ProbeError::Config(
                    "min-radius must be in the range [0,max_radius)".into(),
                ));
            }
        }
        Ok(())
    }
}
