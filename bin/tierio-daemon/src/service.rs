//! Engine and plugin processes

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tierio_common::Config;
use tierio_engine::{BackendDescriptor, Engine};
use tierio_plugin::{FileStore, PluginHost, PluginListener, RpcClient};
use tracing::{debug, error, info, warn};

/// Run the engine until ctrl-c
pub async fn serve(config: Config, stats_interval: Duration) -> Result<()> {
    let rpc = Arc::new(RpcClient::from_config(&config.rpc));
    let sweeper = rpc.spawn_timeout_sweeper(config.rpc.sweep_interval());

    let socket = PluginListener::bind(&config.rpc.listen).await?;
    let listener = Arc::new(PluginListener::new(
        Arc::clone(&rpc),
        config.rpc.max_frame_bytes,
    ));
    let listener_task = tokio::spawn(listener.serve(socket));

    let engine = Engine::start(&config, Some(Arc::clone(&rpc)))?;
    let added = add_backends(&engine, &rpc, &config).await;
    if let Err(e) = added {
        error!("backend setup failed: {e:#}");
        shutdown(&engine).await;
        listener_task.abort();
        sweeper.abort();
        return Err(e);
    }

    let stats = engine.stats().await?;
    info!(
        "serving {} bytes ({} sectors of {} bytes) on {} backends",
        stats.size_bytes,
        stats.logical_sectors,
        stats.blocksize,
        stats.backends.len()
    );

    let mut ticker = tokio::time::interval(stats_interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("waiting for ctrl-c failed: {e}");
                }
                info!("shutting down");
                break;
            }
            _ = ticker.tick(), if !stats_interval.is_zero() => report(&engine).await,
        }
    }

    shutdown(&engine).await;
    listener_task.abort();
    sweeper.abort();
    info!("tierio stopped");
    Ok(())
}

async fn add_backends(engine: &Engine, rpc: &RpcClient, config: &Config) -> Result<()> {
    for backend in &config.backends {
        let descriptor = BackendDescriptor::from_config(backend)?;
        if let BackendDescriptor::Remote { name } = &descriptor {
            info!("waiting for plugin '{name}' to register");
            rpc.wait_registered(name, config.rpc.timeout()).await?;
        }
        let label = format!("{descriptor:?}");
        let id = engine
            .add_backend(descriptor)
            .await
            .with_context(|| format!("adding backend {label}"))?;
        debug!("added {label} as backend {id}");
    }
    Ok(())
}

async fn report(engine: &Engine) {
    match engine.stats().await {
        Ok(stats) => {
            for backend in &stats.backends {
                info!(
                    "backend {} ({}): ready={} used={}/{} rank={}",
                    backend.id,
                    backend.name,
                    backend.ready,
                    backend.used_sectors,
                    backend.used_sectors + backend.free_sectors,
                    backend.rank_score
                );
            }
            match serde_json::to_string(&stats) {
                Ok(json) => debug!("stats: {json}"),
                Err(e) => warn!("stats not serializable: {e}"),
            }
        }
        Err(e) => warn!("stats unavailable: {e}"),
    }
}

async fn shutdown(engine: &Engine) {
    if let Err(e) = engine.shutdown().await {
        error!("engine shutdown incomplete: {e}");
    }
}

/// Serve `path` to the engine at `engine_addr` until ctrl-c
pub async fn run_plugin(
    name: &str,
    path: &Path,
    create_size: Option<u64>,
    engine_addr: &str,
    max_frame: usize,
) -> Result<()> {
    let store = FileStore::open(path, create_size)
        .with_context(|| format!("opening plugin store {}", path.display()))?;
    let handle = PluginHost::new(name, Arc::new(store))
        .with_max_frame(max_frame)
        .connect(engine_addr)
        .await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("plugin '{name}' shutting down");
    handle.stop().await?;
    Ok(())
}
