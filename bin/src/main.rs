#![allow(clippy::cognitive_complexity)]
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};

mod startup_health;

use burrow_core::{
    RegistryConfig, ServiceRegistry,
    cache::RegistryCache,
    config::{
        cli::{self, Parser},
        trace,
    },
    metrics,
    store::memory::MemoryStore,
    tokio::{self, runtime::Builder, signal, task::JoinHandle},
    tracing::*,
};
use startup_health::{verify_background_task_running, verify_registry_connected};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.burrow_log, &config.log_format)?;
    debug!(?config, ?trace_config);
    if let Err(err) = dotenv::dotenv() {
        debug!(?err, ".env file not loaded");
    }

    let mut builder = Builder::new_multi_thread();
    // configure thread name & enable IO/time
    builder.thread_name(&config.thread_name).enable_all();
    // default num threads will be num logical CPUs
    // if we have a configured value here, set it
    if let Some(num) = config.threads {
        builder.worker_threads(num);
    }
    // build the runtime
    let rt = builder.build()?;

    rt.block_on(async move {
        match tokio::spawn(async move { start(config).await }).await {
            Err(err) => error!(?err, "failed to start registry"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let registry_cfg = RegistryConfig::from_cli(&config).context("invalid configuration")?;
    // the network client is provided by the embedding application; standalone
    // mode registers against a process-local store
    info!(address = %registry_cfg.connect.address, "starting in standalone mode (in-memory store)");
    // forces the start time to be recorded
    let _ = *metrics::START_TIME;

    let report_interval = registry_cfg.report_interval;
    let registry = ServiceRegistry::start(registry_cfg, Arc::new(MemoryStore::new()))
        .await
        .map_err(|err| anyhow!("registry start-up failed: {err}"))?;
    verify_registry_connected(registry.state())?;

    let token = CancellationToken::new();
    let mut report_task = report_interval
        .map(|interval| spawn_report_task(Arc::clone(registry.cache()), interval, token.clone()));
    if let Some(task) = report_task.as_mut() {
        if let Err(err) = verify_background_task_running("registry report", task).await {
            token.cancel();
            registry.shutdown().await;
            return Err(err);
        }
    }

    let mut state = registry.state_watcher();
    let shutdown = shutdown_signal(token.clone());
    tokio::pin!(shutdown);
    let result = loop {
        tokio::select! {
            res = &mut shutdown => break res,
            changed = state.changed() => {
                if changed.is_err() {
                    break Err(anyhow!("registry router stopped"));
                }
                let current = *state.borrow_and_update();
                let status = registry.recovery_status();
                if status.auth_failed {
                    token.cancel();
                    break Err(anyhow!("coordination store rejected our credentials"));
                }
                debug!(?current, ?status, "registry state changed");
            }
        }
    };

    token.cancel();
    registry.shutdown().await;
    if let Some(task) = report_task {
        if let Err(err) = task.await {
            error!(?err, "error waiting for registry report task");
        }
    }
    result
}

fn spawn_report_task(
    cache: Arc<RegistryCache>,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("registry report task stopping");
                    return;
                }
                _ = ticker.tick() => {
                    let services = cache.services();
                    info!(
                        services = services.len(),
                        instances = cache.instance_count(),
                        generation = cache.generation(),
                        uptime = ?metrics::START_TIME.elapsed(),
                        "registry report"
                    );
                    for service in services {
                        let instances: Vec<String> = cache
                            .lookup(&service)
                            .iter()
                            .map(ToString::to_string)
                            .collect();
                        info!(%service, ?instances, "registry entry");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    tokio::select! {
        ret = signal::ctrl_c() => {
            token.cancel();
            ret.map_err(|err| anyhow!(err))
        }
        _ = token.cancelled() => Ok(()),
    }
}
