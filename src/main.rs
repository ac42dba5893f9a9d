use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use podserve_protocol::NewJobRequest;
use tokio::net::TcpListener;

use podserve::config::{expand_home, Config, EngineKind, DEFAULT_CONFIG_PATH};
use podserve::engine::{CandleEngine, EchoEngine, InferenceEngine};
use podserve::logging::init_logging;
use podserve::registry::Registry;
use podserve::scheduler::{Scheduler, SchedulerOptions};
use podserve::server;
use podserve::session::SessionStore;

#[derive(Debug, Parser)]
#[command(name = "podserve", version, about = "Queue LLM jobs onto model pods over HTTP")]
struct Cli {
    /// TOML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// `candle` or `echo`
    #[arg(long)]
    engine: Option<EngineKind>,

    /// Run a single prompt through the first free pod, print the answer and exit
    #[arg(long)]
    prompt: Option<String>,

    /// Log a queue/job snapshot every N seconds
    #[arg(long, value_name = "SECS")]
    monitor: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(engine) = cli.engine {
        cfg.engine = engine;
    }

    let log_file = cfg.log.as_deref().map(expand_home);
    let _guard = init_logging(log_file.as_deref()).context("cannot set up logging")?;
    tracing::info!(id = %cfg.id, config = %cli.config.display(), engine = ?cfg.engine, "podserve starting");

    let engine: Arc<dyn InferenceEngine> = match cfg.engine {
        EngineKind::Echo => Arc::new(EchoEngine::new(
            Duration::from_millis(cfg.echo.delay_ms),
            cfg.echo.reply.clone(),
        )),
        EngineKind::Candle => Arc::new(CandleEngine::new()),
    };

    let registry = Registry::initialize(&cfg, engine.as_ref()).context("startup aborted")?;
    tracing::info!("{}", registry.format_list());

    let sessions = match cfg.swap.as_deref() {
        Some(dir) => SessionStore::with_swap_dir(&expand_home(dir))?,
        None => SessionStore::in_memory(),
    };

    let scheduler = Scheduler::new(
        Arc::new(registry),
        engine,
        sessions,
        SchedulerOptions::from_config(&cfg),
    );
    let admission = scheduler.start().context("cannot start admission loop")?;

    if let Some(prompt) = cli.prompt {
        let runner = Arc::clone(&scheduler);
        let output = tokio::task::spawn_blocking(move || run_once(&runner, prompt)).await??;
        println!("{}", output);
        scheduler.begin_shutdown();
        return join_admission(admission);
    }

    if let Some(secs) = cli.monitor {
        spawn_monitor(Arc::clone(&scheduler), Duration::from_secs(secs.max(1)))?;
    }

    let listener = TcpListener::bind(cfg.addr())
        .await
        .with_context(|| format!("cannot bind {}", cfg.addr()))?;
    server::serve(
        listener,
        Arc::clone(&scheduler),
        shutdown_signal(Arc::clone(&scheduler)),
    )
    .await?;

    join_admission(admission)?;
    tracing::info!("podserve stopped");
    Ok(())
}

/// Resolves after Ctrl-C once every queued and running job is done.
async fn shutdown_signal(scheduler: Arc<Scheduler>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "cannot listen for ctrl-c");
        return;
    }
    scheduler.begin_shutdown();
    let tick = scheduler.options().tick;
    while !scheduler.is_drained() {
        tokio::time::sleep(tick).await;
    }
}

fn run_once(scheduler: &Scheduler, prompt: String) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    scheduler.submit(NewJobRequest {
        id: id.clone(),
        prompt,
        ..NewJobRequest::default()
    })?;

    let wait = scheduler.options().chat_timeout.max(Duration::from_secs(1));
    loop {
        let job = scheduler
            .wait_for_completion(&id, wait)
            .ok_or_else(|| anyhow!("job {} expired in the queue", id))?;
        if job.status.is_terminal() {
            return Ok(job.output);
        }
    }
}

fn spawn_monitor(scheduler: Arc<Scheduler>, every: Duration) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("podserve-monitor".to_string())
        .spawn(move || loop {
            thread::sleep(every);
            if scheduler.is_drained() {
                break;
            }
            tracing::info!("status\n{}", scheduler.snapshot());
        })?;
    Ok(handle)
}

fn join_admission(handle: JoinHandle<()>) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("admission thread panicked"))
}
