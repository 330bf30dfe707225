mod cli;
mod format;
mod jobs_file;
mod shutdown;

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use reqwest::Url;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, fmt};

use jobmill_core::settings::{EngineSettings, load_settings, save_settings, settings_path};
use jobmill_engine::{
    CommandRunner, EngineDeps, EngineEvent, HttpTracker, JobClient, JobTracker, NoopTracker,
    start_engine,
};
use jobmill_store::{MemoryStore, QueueStore, RedisStore};

use crate::cli::{Cli, Command, ConfigCommand, GlobalArgs, RunArgs, StoreKind, SubmitArgs};
use crate::format::{format_event, is_diagnostic, status_json};
use crate::shutdown::{ShutdownController, ShutdownEvent, spawn_ctrl_c_handler};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobmill=info,jobmill_engine=info,jobmill_store=warn".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn connect_redis(redis_url: &str) -> anyhow::Result<Arc<dyn QueueStore>> {
    let store = RedisStore::connect(redis_url)
        .await
        .with_context(|| format!("connect to {redis_url}"))?;
    Ok(Arc::new(store))
}

fn tracker(global: &GlobalArgs, settings: &EngineSettings) -> anyhow::Result<Arc<dyn JobTracker>> {
    let tracker: Arc<dyn JobTracker> = match global.tracker_url(settings)? {
        Some(url) => Arc::new(HttpTracker::new(url)?),
        None => Arc::new(NoopTracker),
    };
    Ok(tracker)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let settings = match load_settings() {
        Ok(settings) => settings.unwrap_or_default(),
        Err(err) => {
            tracing::warn!("failed to read settings file: {err:#}");
            EngineSettings::default()
        }
    };

    match &cli.command {
        Command::Run(args) => run(&cli.global, args, &settings).await,
        Command::Submit(args) => submit(&cli.global, args, &settings).await,
        Command::Status { job_id } => status(&cli.global, job_id, &settings).await,
        Command::Config { action } => config(action, settings),
    }
}

async fn run(global: &GlobalArgs, args: &RunArgs, settings: &EngineSettings) -> anyhow::Result<()> {
    let cfg = args.apply(global.engine_config(settings), settings);

    // Parse the batch before connecting so a bad file fails fast.
    let seed = match &args.jobs {
        Some(path) => Some(jobs_file::load_jobs(path, &cfg.queue_type, args.team.as_deref())?),
        None => None,
    };
    if args.store == StoreKind::Memory && seed.is_none() {
        tracing::warn!("memory store without --jobs: nothing can submit work to this engine");
    }

    let store = match args.store {
        StoreKind::Memory => MemoryStore::arc() as Arc<dyn QueueStore>,
        StoreKind::Redis => connect_redis(&global.redis_url(settings)).await?,
    };
    let runner = Arc::new(CommandRunner::new(args.program.clone(), args.args.clone()));
    let deps = EngineDeps::new(store, runner).with_tracker(tracker(global, settings)?);

    println!(
        "jobmill {} queue={} workers={}..={} program={}",
        env!("CARGO_PKG_VERSION"),
        cfg.queue_type,
        cfg.min_workers,
        cfg.max_concurrent_jobs,
        args.program
    );

    let engine = start_engine(cfg, deps);
    let mut events = engine.subscribe();

    let shutdown = Arc::new(ShutdownController::new());
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::unbounded_channel::<ShutdownEvent>();
    spawn_ctrl_c_handler(shutdown, shutdown_tx);

    if let Some(jobs) = seed {
        let batch = engine.add_jobs(jobs).await?;
        println!(
            "session {}: {} jobs queued",
            batch.session_id,
            batch.job_ids.len()
        );
    }

    let mut immediate_exit = false;

    loop {
        tokio::select! {
            ev_opt = shutdown_rx.recv() => {
                match ev_opt {
                    Some(ShutdownEvent::Graceful) => {
                        eprintln!("Stop requested: finishing in-flight jobs before exiting (press Ctrl-C again to stop immediately).");
                        engine.request_stop();
                    }
                    Some(ShutdownEvent::Immediate) => {
                        eprintln!("Stop requested again: stopping now. In-flight jobs are requeued on the next start.");
                        immediate_exit = true;
                        engine.stop();
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event stream lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if let Some(line) = format_event(&evt) {
                    if is_diagnostic(&evt) {
                        eprintln!("{line}");
                    } else {
                        println!("{line}");
                    }
                }
                if matches!(evt, EngineEvent::Stopped) {
                    break;
                }
            }
        }
    }

    engine.wait().await?;
    if immediate_exit {
        std::process::exit(130);
    }
    Ok(())
}

async fn submit(global: &GlobalArgs, args: &SubmitArgs, settings: &EngineSettings) -> anyhow::Result<()> {
    let cfg = global.engine_config(settings);
    let jobs = jobs_file::load_jobs(&args.file, &cfg.queue_type, args.team.as_deref())?;
    let store = connect_redis(&global.redis_url(settings)).await?;
    let client = JobClient::new(cfg, store, tracker(global, settings)?);

    let batch = client.add_jobs(jobs).await?;
    println!("{}", batch.session_id);
    for job_id in &batch.job_ids {
        eprintln!("  {job_id}");
    }
    Ok(())
}

async fn status(global: &GlobalArgs, job_id: &str, settings: &EngineSettings) -> anyhow::Result<()> {
    let store = connect_redis(&global.redis_url(settings)).await?;
    let client = JobClient::new(global.engine_config(settings), store, Arc::new(NoopTracker));

    let Some(record) = client.get_job_status(job_id).await? else {
        anyhow::bail!("no status record for job {job_id} (unknown, expired, or another queue)");
    };
    let label = client.mapped_status(record.status.as_str());
    println!("{}", serde_json::to_string_pretty(&status_json(&record, &label)?)?);
    Ok(())
}

fn config(action: &ConfigCommand, mut settings: EngineSettings) -> anyhow::Result<()> {
    let path = settings_path()?;
    match action {
        ConfigCommand::Show => {
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
        ConfigCommand::SetRedisUrl { url } => {
            let parsed = Url::parse(url.trim()).with_context(|| format!("invalid redis url {url:?}"))?;
            if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
                anyhow::bail!("unsupported redis url scheme {:?}", parsed.scheme());
            }
            settings.redis_url = Some(url.trim().to_string());
            save_settings(&settings)?;
            println!("saved {}", path.display());
        }
    }
    Ok(())
}
