//! ntpwatch entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

mod cli;
mod collector;
mod config;
mod error;
mod image;
mod lifecycle;
mod peers;
mod runtime;
mod status;
mod types;

use cli::{Cli, CollectArgs, Commands};
use collector::{AppendGuard, Collector, ContainerQuery, LocalQuery, MountedLogGuard};
use config::Config;
use lifecycle::Lifecycle;
use runtime::DockerRuntime;
use status::StatusReport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();

    // Load configuration
    let cfg = Config::load(cli.config.as_deref())?;
    info!("Loaded config: {:?}", cfg);

    match cli.cmd {
        Commands::Build => {
            let runtime = docker(&cfg)?;
            Lifecycle::new(&runtime, &cfg).build().await?;
        }
        Commands::Start => {
            let runtime = docker(&cfg)?;
            Lifecycle::new(&runtime, &cfg).start().await?;
        }
        Commands::Enter => {
            let runtime = docker(&cfg)?;
            Lifecycle::new(&runtime, &cfg).enter().await?;
        }
        Commands::Stop => {
            let runtime = docker(&cfg)?;
            Lifecycle::new(&runtime, &cfg).stop().await?;
        }
        Commands::Status => {
            let runtime = docker(&cfg)?;
            print!("{}", StatusReport::gather(&runtime, &cfg).await?);
        }
        Commands::Collect(args) => collect(&cfg, args, false).await?,
        Commands::Watch(args) => collect(&cfg, args, true).await?,
        Commands::Parse(args) => {
            let input = args.input.unwrap_or_else(|| cfg.log_path());
            let text = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("reading {}", input.display()))?;

            let parsed = peers::parse_log(&text);
            let written = peers::write_report(&args.output, &parsed).await?;
            println!("Successfully parsed {} data points", parsed.samples.len());
            if parsed.malformed > 0 || parsed.orphaned > 0 {
                println!(
                    "Skipped {} malformed and {} orphaned rows",
                    parsed.malformed, parsed.orphaned
                );
            }
            if parsed.truncated {
                println!("Stopped early at an unreadable timestamp header");
            }
            println!("Wrote {}", written.display());
            println!();
            print!("{}", peers::render_summary(&peers::summarize(&parsed.samples)));
        }
    }

    Ok(())
}

fn docker(cfg: &Config) -> anyhow::Result<DockerRuntime> {
    DockerRuntime::new(cfg.docker_cli.clone(), cfg.stop_timeout_secs)
}

async fn collect(cfg: &Config, args: CollectArgs, repeat: bool) -> anyhow::Result<()> {
    let log_path = args.log.unwrap_or_else(|| cfg.log_path());

    if args.local {
        let mut collector = Collector::new(log_path, LocalQuery::new(cfg.peer_query.clone()));
        // no reachable daemon means no container whose cron could share the log
        match docker(cfg) {
            Ok(runtime) => {
                collector = collector.with_guard(mounted_log_guard(Arc::new(runtime), cfg));
            }
            Err(e) => warn!("Not checking for a running container: {:#}", e),
        }
        return run_collector(&collector, cfg, repeat).await;
    }

    let runtime = Arc::new(docker(cfg)?);
    let query = ContainerQuery::new(
        runtime.as_ref(),
        cfg.container_name.clone(),
        cfg.peer_query.clone(),
    );
    let collector =
        Collector::new(log_path, query).with_guard(mounted_log_guard(Arc::clone(&runtime), cfg));
    run_collector(&collector, cfg, repeat).await
}

fn mounted_log_guard(runtime: Arc<DockerRuntime>, cfg: &Config) -> Box<dyn AppendGuard> {
    Box::new(MountedLogGuard::new(
        runtime,
        cfg.container_name.clone(),
        cfg.log_path(),
    ))
}

async fn run_collector<Q: collector::PeerQuery>(
    collector: &Collector<Q>,
    cfg: &Config,
    repeat: bool,
) -> anyhow::Result<()> {
    if repeat {
        collector.watch(cfg.collect_interval()).await
    } else {
        collector.collect().await?;
        println!("Appended peer table to {}", collector.log_path().display());
        Ok(())
    }
}
