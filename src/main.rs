//! voprobe - VO service query monitor

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use voprobe::cli::{Cli, Command, ConegenArgs, LogFormat, PluginsArgs};
use voprobe::config::{ConeSource, RunConfig, DEFAULT_PLUGIN_DIR};
use voprobe::cone::{generate_random, DEFAULT_MAX_RADIUS, DEFAULT_MIN_RADIUS};
use voprobe::input::{load_cones, load_replay, load_services, write_cones};
use voprobe::plugins::{expand_time_elements, PluginRegistry};
use voprobe::runner::BatchRunner;
use voprobe::state::ProbeState;
use voprobe::writers::RunInfo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    #[cfg(unix)]
    spawn_signal_logger();

    match cli.command {
        Command::Query(args) => {
            let config = args.to_config()?;
            if args.common.norun {
                return print_config(&config);
            }
            run_batch(config).await
        }
        Command::Replay(args) => {
            let config = args.to_config()?;
            if args.common.norun {
                return print_config(&config);
            }
            run_batch(config).await
        }
        Command::Conegen(args) => conegen(&args),
        Command::Plugins(args) => list_plugins(&args),
    }
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default_filter = if verbose {
        "voprobe=debug,reqwest=debug"
    } else {
        "voprobe=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

/// Log SIGHUP, SIGQUIT and SIGTERM so batches can run detached
#[cfg(unix)]
fn spawn_signal_logger() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut hup), Ok(mut quit), Ok(mut term)) = (
        signal(SignalKind::hangup()),
        signal(SignalKind::quit()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Unable to install signal handlers");
        return;
    };

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = hup.recv() => "SIGHUP",
                _ = quit.recv() => "SIGQUIT",
                _ = term.recv() => "SIGTERM",
            };
            warn!(signal = name, at = %chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"), "Received signal");
        }
    });
}

fn print_config(config: &RunConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

async fn run_batch(config: RunConfig) -> anyhow::Result<()> {
    info!("voprobe v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Services: {}", config.services.display());
    info!("Result directory: {}", config.query.result_dir.display());
    info!("TAP mode: {}", config.query.tap_mode);

    let mut registry = PluginRegistry::builtin();
    let (plugin_path, required) = config.plugin_source();
    registry
        .load_path(&plugin_path, required)
        .with_context(|| format!("loading plugins from {}", plugin_path.display()))?;

    let services = if config.replay {
        load_replay(&config.services)
    } else {
        load_services(&config.services)
    }
    .with_context(|| format!("reading {}", config.services.display()))?;

    let cones = match &config.cones {
        ConeSource::None => None,
        ConeSource::File { path } => {
            Some(load_cones(path).with_context(|| format!("reading cones from {}", path.display()))?)
        }
        ConeSource::Random {
            num_cones,
            min_radius,
            max_radius,
        } => Some(generate_random(*num_cones, *min_radius, *max_radius)?),
    };

    let state = ProbeState::connect(config.query.clone())?;
    let writers = config
        .writers
        .iter()
        .map(|spec| registry.create_writer(spec).with_context(|| format!("writer {}", spec)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let query = registry
        .create_timed_query(&config.query_plugin, &state)
        .with_context(|| format!("query plugin {}", config.query_plugin))?;

    let run = RunInfo::new(&config.services, &config.query.result_dir, config.replay);
    let mut runner = BatchRunner::new(query, writers, state.metrics.clone())
        .with_window(config.start_index, config.cone_limit);
    let summary = runner.run(&run, &services, cones.as_deref()).await?;

    info!("Finished: {}", summary);
    Ok(())
}

fn conegen(args: &ConegenArgs) -> anyhow::Result<()> {
    let output = PathBuf::from(expand_time_elements(&args.output, &chrono::Local::now()));
    let cones = generate_random(
        args.num_cones,
        args.min_radius.unwrap_or(DEFAULT_MIN_RADIUS),
        args.max_radius.unwrap_or(DEFAULT_MAX_RADIUS),
    )?;
    write_cones(&output, &cones)?;
    Ok(())
}

fn list_plugins(args: &PluginsArgs) -> anyhow::Result<()> {
    let mut registry = PluginRegistry::builtin();
    let (path, required) = match &args.load_plugins {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_PLUGIN_DIR), false),
    };
    registry.load_path(&path, required)?;

    for plugin in registry.list() {
        match &plugin.base {
            Some(base) => println!("{:<14} {:<20} {} (preset of {})", plugin.kind, plugin.name, plugin.description, base),
            None => println!("{:<14} {:<20} {}", plugin.kind, plugin.name, plugin.description),
        }
    }
    Ok(())
}
