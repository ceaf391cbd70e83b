//! Command line

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    ConeSource, RunConfig, DEFAULT_CONE_LIMIT, DEFAULT_QUERY_PLUGIN, DEFAULT_RESULT_DIR,
};
use crate::error::{ProbeError, Result};
use crate::models::TapMode;
use crate::stats::DEFAULT_MAX_EXTRA_DURATIONS;

#[derive(Parser, Debug)]
#[command(name = "voprobe", author, version, about = "Time cone search and TAP queries against VO services")]
pub struct Cli {
    /// Debug logging, including HTTP traffic
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Query every service at every cone
    Query(QueryArgs),
    /// Re-run the queries recorded in a statistics file
    Replay(ReplayArgs),
    /// Generate random cones into a JSON file
    Conegen(ConegenArgs),
    /// List the available plugins
    Plugins(PluginsArgs),
}

#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Directory for result files
    #[arg(short = 'r', long, env = "VOPROBE_RESULT_DIR", default_value = DEFAULT_RESULT_DIR)]
    pub result_dir: PathBuf,

    /// Plugin directory or manifest file
    #[arg(short = 'l', long, env = "VOPROBE_PLUGINS")]
    pub load_plugins: Option<PathBuf>,

    /// Result writer spec, `name[:key=value,...]`; may be repeated
    #[arg(short = 'w', long = "writer", value_name = "SPEC")]
    pub writers: Vec<String>,

    /// Keep the downloaded result files
    #[arg(short = 's', long)]
    pub save_results: bool,

    /// TAP submission mode: sync or async
    #[arg(short = 't', long, env = "VOPROBE_TAP_MODE", default_value = "async")]
    pub tap_mode: TapMode,

    #[arg(short = 'u', long, env = "VOPROBE_USER_AGENT")]
    pub user_agent: Option<String>,

    /// Number of extra duration column pairs in the statistics
    #[arg(long, env = "VOPROBE_MAX_EXTRA_DURATIONS", default_value_t = DEFAULT_MAX_EXTRA_DURATIONS)]
    pub max_extra_durations: usize,

    /// Seconds to wait for an async TAP job to finish
    #[arg(long, env = "VOPROBE_ASYNC_TIMEOUT", value_name = "SECONDS", default_value_t = 120.0)]
    pub async_timeout: f64,

    /// Delete async TAP jobs once their result is stored
    #[arg(long)]
    pub delete_jobs: bool,

    #[arg(long, default_value = DEFAULT_QUERY_PLUGIN)]
    pub query_plugin: String,

    /// Print the effective configuration and exit
    #[arg(short = 'n', long)]
    pub norun: bool,
}

impl CommonArgs {
    fn apply(&self, config: &mut RunConfig) -> Result<()> {
        let query = &mut config.query;
        query.result_dir = self.result_dir.clone();
        query.save_results = self.save_results;
        query.tap_mode = self.tap_mode;
        if let Some(agent) = &self.user_agent {
            query.user_agent = agent.clone();
        }
        query.max_extra_durations = self.max_extra_durations;
        query.delete_jobs = self.delete_jobs;

        let timeout = Duration::try_from_secs_f64(self.async_timeout)
            .map_err(|e| ProbeError::Config(format!("invalid async timeout {}: {}", self.async_timeout, e)))?;
        query.poll = query.poll.clone().with_total_timeout(timeout);

        if !self.writers.is_empty() {
            config.writers = self.writers.clone();
        }
        config.query_plugin = self.query_plugin.clone();
        config.load_plugins = self.load_plugins.clone();
        Ok(())
    }
}

#[derive(Args, Debug)]
#[command(group(ArgGroup::new("cone_source").required(true).args(["cone_file", "num_cones"])))]
pub struct QueryArgs {
    /// Service list (.json or .csv)
    pub services: PathBuf,

    /// Cone list (.json or .csv)
    #[arg(long)]
    pub cone_file: Option<PathBuf>,

    /// Number of random cones to generate
    #[arg(long)]
    pub num_cones: Option<usize>,

    #[arg(long, requires = "num_cones")]
    pub min_radius: Option<f64>,

    #[arg(long, requires = "num_cones")]
    pub max_radius: Option<f64>,

    /// Number of cones to skip
    #[arg(long, default_value_t = 0)]
    pub start_index: usize,

    /// Maximum number of cones to query
    #[arg(long, default_value_t = DEFAULT_CONE_LIMIT)]
    pub cone_limit: usize,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl QueryArgs {
    pub fn to_config(&self) -> Result<RunConfig> {
        let cones = match (&self.cone_file, self.num_cones) {
            (Some(path), _) => ConeSource::File { path: path.clone() },
            (None, Some(n)) => ConeSource::random(n, self.min_radius, self.max_radius),
            (None, None) => {
                return Err(ProbeError::Config(
                    "one of --cone-file or --num-cones is required".into(),
                ))
            }
        };
        let mut config = RunConfig::new(&self.services, cones);
        config.start_index = self.start_index;
        config.cone_limit = self.cone_limit;
        self.common.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Statistics .csv file written by an earlier run
    pub file_to_replay: PathBuf,

    /// Number of services to skip
    #[arg(long, default_value_t = 0)]
    pub start_index: usize,

    /// Maximum number of services to query
    #[arg(long, default_value_t = DEFAULT_CONE_LIMIT)]
    pub cone_limit: usize,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl ReplayArgs {
    pub fn to_config(&self) -> Result<RunConfig> {
        let mut config = RunConfig::replay(&self.file_to_replay);
        config.start_index = self.start_index;
        config.cone_limit = self.cone_limit;
        self.common.apply(&mut config)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct ConegenArgs {
    /// Output JSON file; strftime elements are expanded
    pub output: String,

    #[arg(long)]
    pub num_cones: usize,

    #[arg(long)]
    pub min_radius: Option<f64>,

    #[arg(long)]
    pub max_radius: Option<f64>,
}

#[derive(Args, Debug)]
pub struct PluginsArgs {
    /// Plugin directory or manifest file
    #[arg(short = 'l', long, env = "VOPROBE_PLUGINS")]
    pub load_plugins: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_query_with_random_cones() {
        let cli = parse(&[
            "voprobe", "-v", "query", "services.json", "--num-cones", "5", "--max-radius", "0.1",
            "-w", "csv_writer:outfile=out.csv", "-w", "http_writer:url=http://h/", "-t", "sync",
            "--async-timeout", "30", "--delete-jobs",
        ]);
        assert!(cli.verbose);
        let Command::Query(args) = cli.command else {
            panic!("expected query");
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.cones, ConeSource::random(5, Some(0.0), Some(0.1)));
        assert_eq!(config.writers.len(), 2);
        assert_eq!(config.query.tap_mode, TapMode::Sync);
        assert_eq!(config.query.poll.total_timeout, Duration::from_secs(30));
        assert!(config.query.delete_jobs);
        assert!(!args.common.norun);
    }

    #[test]
    fn test_query_with_cone_file_defaults() {
        let cli = parse(&["voprobe", "query", "services.csv", "--cone-file", "cones.json", "-n"]);
        let Command::Query(args) = cli.command else {
            panic!("expected query");
        };
        assert!(args.common.norun);
        let config = args.to_config().unwrap();
        assert_eq!(config.writers, vec!["csv_writer"]);
        assert_eq!(config.start_index, 0);
        assert_eq!(config.cone_limit, DEFAULT_CONE_LIMIT);
        assert_eq!(config.plugin_source(), (PathBuf::from("plugins"), false));
    }

    #[test]
    fn test_cone_source_is_required_and_exclusive() {
        assert!(Cli::try_parse_from(["voprobe", "query", "s.json"]).is_err());
        assert!(Cli::try_parse_from([
            "voprobe", "query", "s.json", "--cone-file", "c.json", "--num-cones", "3"
        ])
        .is_err());
        assert!(Cli::try_parse_from([
            "voprobe", "query", "s.json", "--cone-file", "c.json", "--min-radius", "0.1"
        ])
        .is_err());
    }

    #[test]
    fn test_bad_timeout_rejected() {
        let cli = parse(&["voprobe", "replay", "stats.csv", "--async-timeout=-1"]);
        let Command::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        assert!(matches!(args.to_config(), Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_replay_config() {
        let cli = parse(&["voprobe", "replay", "stats.csv", "--start-index", "2", "-l", "my_plugins"]);
        let Command::Replay(args) = cli.command else {
            panic!("expected replay");
        };
        let config = args.to_config().unwrap();
        assert!(config.replay);
        assert_eq!(config.cones, ConeSource::None);
        assert_eq!(config.start_index, 2);
        assert_eq!(config.plugin_source(), (PathBuf::from("my_plugins"), true));
    }
}
