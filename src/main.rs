// src/main.rs

mod cli;
mod config;
mod errors;
mod ippool;
mod model;
mod orchestrator;
mod overseer;
mod platform;
mod provisioner;
mod registry;
mod secrets;
mod ssh;

use anyhow::Result;
use clap::Parser;
use std::fs::create_dir_all;
use std::path::Path;
use std::sync::Arc;

use cli::Cli;
use config::{Config, APP_NAME};
use errors::DomeError;
use ippool::IpPool;
use orchestrator::LabOrchestrator;
use overseer::knowledge::KnowledgeIndex;
use overseer::Overseer;
use provisioner::OsProvisioner;
use registry::poller;
use registry::Registry;
use secrets::SecretsContext;
use ssh::SshPool;

use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{
    filter::EnvFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Registry as TracingRegistry,
};
use xdg::BaseDirectories;

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(()) => 0,
        Err(err) => match err.downcast_ref::<DomeError>() {
            Some(dome) => {
                error!("{dome}");
                eprintln!("error ({}): {dome}", dome.kind());
                dome.exit_code()
            }
            None => {
                error!("{err:#}");
                eprintln!("error: {err:#}");
                1
            }
        },
    };
    std::process::exit(exit_code);
}

/// Console logging on stderr always; when `mirror_dir` is given (resident
/// mode) a daily-rolled JSON log is kept there too. The returned guard must
/// outlive the process while file logging is active.
fn init_tracing(level: &str, mirror_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);
    let stack = TracingRegistry::default().with(filter).with(console);

    let Some(dir) = mirror_dir else {
        stack.init();
        return Ok(None);
    };
    create_dir_all(dir)?;
    let (sink, guard) = tracing_appender::non_blocking(rolling::daily(dir, "glassdome.jsonl"));
    stack
        .with(fmt::layer().json().with_ansi(false).with_writer(sink))
        .init();
    Ok(Some(guard))
}

async fn run() -> Result<()> {
    let cli_args = Cli::parse();

    // The resident supervisor (no subcommand) mirrors its log to disk; a
    // one-shot CLI invocation stays console-only.
    let resident_mode = cli_args.command.is_none();
    let cache_dir = BaseDirectories::with_prefix(APP_NAME)?.get_cache_home();
    let _log_guard = init_tracing(
        &cli_args.log_level.to_string(),
        resident_mode.then_some(cache_dir.as_path()),
    )?;
    if resident_mode {
        info!("log mirrored to {}", cache_dir.join("glassdome.jsonl").display());
    }

    info!("Glassdome initializing...");

    let config = match Config::load(cli_args.config.as_deref()) {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    config.validate().map_err(anyhow::Error::new)?;
    debug!("Loaded app config: {:?}", config);

    // Secrets are resolved exactly once and stay immutable for the process.
    let secrets = SecretsContext::load(&config).await.map_err(anyhow::Error::new)?;
    info!("Secrets context loaded.");

    let ssh_pool = Arc::new(SshPool::new(config.ssh));
    let adapters = Arc::new(
        platform::build_adapters(&config, &secrets, Arc::clone(&ssh_pool))
            .map_err(anyhow::Error::new)?,
    );
    info!("{} platform adapter(s) registered.", adapters.len());

    let ip_pool = Arc::new(IpPool::from_config(&config.ip_pools).map_err(anyhow::Error::new)?);

    let registry = Arc::new(
        Registry::open(&config.registry.persistence_dir(), config.registry.event_bus.capacity)
            .await
            .map_err(anyhow::Error::new)?,
    );
    info!("Registry opened at {:?}.", config.registry.persistence_dir());

    let provisioner = Arc::new(OsProvisioner::new(
        Arc::clone(&adapters),
        Arc::clone(&ip_pool),
        &config,
    ));
    let orchestrator = Arc::new(LabOrchestrator::new(
        Arc::clone(&adapters),
        provisioner,
        Arc::clone(&ip_pool),
        Arc::clone(&registry),
        Arc::clone(&config),
    ));

    let knowledge_path = config
        .knowledge_index
        .path
        .as_ref()
        .map(|p| shellexpand::tilde(p).into_owned());
    let knowledge = Arc::new(KnowledgeIndex::load(knowledge_path.as_deref().map(Path::new)));
    if !knowledge.is_empty() {
        info!("Knowledge index loaded ({} passages).", knowledge.len());
    }

    let overseer = Overseer::new(
        Arc::clone(&registry),
        Arc::clone(&adapters),
        Arc::clone(&orchestrator),
        Arc::clone(&ip_pool),
        Arc::clone(&knowledge),
        Arc::clone(&config),
    )
    .await
    .map_err(anyhow::Error::new)?;
    info!("Overseer initialized.");

    if let Some(command) = cli_args.command {
        // One-shot commands run against a freshly primed view of the fleet.
        if matches!(
            command,
            cli::Commands::Deploy { .. } | cli::Commands::Destroy { .. } | cli::Commands::Hosts
        ) {
            for adapter in adapters.values() {
                if let Err(err) = poller::poll_platform_host(adapter.as_ref(), &registry).await {
                    warn!(platform = %adapter.platform_id(), %err, "priming poll failed");
                }
            }
        }
        cli::handle_command(command, Arc::clone(&registry), Arc::clone(&overseer))
            .await
            .map_err(anyhow::Error::new)?;
        return Ok(());
    }

    // Resident supervisor: polling agents plus the four overseer loops, until
    // interrupted.
    for adapter in adapters.values() {
        if let Err(err) = poller::poll_platform_host(adapter.as_ref(), &registry).await {
            warn!(platform = %adapter.platform_id(), %err, "initial platform poll failed");
        }
    }
    let labs: Vec<model::LabRecord> = registry.list(model::EntityKind::Lab).await;
    if !labs.is_empty() {
        info!("Known labs at startup:");
        for lab in &labs {
            cli::print_lab_line(lab);
        }
    }

    let poller_handles = poller::spawn(
        Arc::clone(&adapters),
        Arc::clone(&registry),
        overseer.watch_set(),
        config.registry.poll_intervals,
    );
    let overseer_handle = overseer.spawn_loops();
    info!("Overseer resident; four loops and {} polling agent(s) running.", adapters.len());

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received; shutting down.");
    overseer_handle.shutdown();
    poller_handles.shutdown();

    info!("Glassdome shutting down.");
    Ok(())
}
