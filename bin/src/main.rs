#![allow(clippy::cognitive_complexity)]
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};

mod startup_health;

use attachments::{AttachmentCoordinator, Reconciler};
use config::FabricConfig;
use external_api::{ExternalApi, Health};
use fabric_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    tokio::{self, runtime::Builder, signal},
    tracing::*,
};
use netconf::{Fabric, NetconfFabric};
use startup_health::verify_startup_subsystems;
use vlan_manager::{VlanManager, sqlite::SqliteDb};

#[cfg(not(target_env = "musl"))]
use jemallocator::Jemalloc;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_env = "musl"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    let trace_config = trace::Config::parse(&config.fabric_log)?;
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
            Err(err) => error!(?err, "failed to start agent"),
            Ok(Err(err)) => error!(?err, "exited with error"),
            Ok(_) => debug!("exiting..."),
        }
    });

    Ok(())
}

async fn start(config: cli::Config) -> Result<()> {
    let instance_id = config.instance_id.clone();
    info!(?instance_id, "using id");

    debug!("parsing fabric config");
    let fabric_cfg = Arc::new(FabricConfig::parse(&config.config_path)?);
    let controller = fabric_cfg.controller();
    info!(host = %controller.host, port = controller.port, "using controller");

    let database_url = config.database_url.clone();
    info!(?database_url, "using database at path");
    let db = SqliteDb::new(&database_url)
        .await
        .with_context(|| format!("failed to open database {database_url}"))?;
    let vlans = VlanManager::new(db, fabric_cfg.vlan_range());

    // the session connects on first use and reconnects after failures, a
    // controller that's down at startup isn't fatal
    let client = netconf::connect_lazy(controller);
    let fabric = Arc::new(NetconfFabric::new(client.clone()));
    match client.connect().await {
        Ok(()) => match fabric.version().await {
            Ok(version) => info!(?version, "controller reachable"),
            Err(err) => warn!(?err, "failed to read controller version"),
        },
        Err(err) => warn!(?err, "controller unreachable at startup, will retry on demand"),
    }

    let coordinator = Arc::new(AttachmentCoordinator::new(
        vlans,
        fabric_cfg.lock(),
        fabric,
        fabric_cfg.network_prefix(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&coordinator),
        fabric_cfg.reconcile(),
    ));
    let api = ExternalApi::new(
        config.external_api,
        Arc::clone(&fabric_cfg),
        Arc::clone(&coordinator),
    );

    let token = CancellationToken::new();
    let api_sender = api.sender();
    let mut api_guard = api.start(token.clone());
    let mut reconciler_task = reconciler.spawn(token.clone());

    // Keep health BAD until all startup-critical tasks are confirmed running.
    if let Err(err) = verify_startup_subsystems(&mut api_guard, &mut reconciler_task).await {
        let _ = api_sender.send(Health::Bad).await;
        token.cancel();
        client.close().await;
        return Err(err);
    }

    debug!("changing health to good after startup checks passed");
    api_sender
        .send(Health::Good)
        .await
        .context("error occurred in changing health status to Good")?;

    let res = shutdown_signal(token.clone()).await;
    info!("shutting down");
    let _ = api_sender.send(Health::Bad).await;
    if let Err(err) = api_guard.await {
        error!(?err, "error waiting for web server API");
    }
    if let Err(err) = reconciler_task.await {
        error!(?err, "error waiting for reconciler");
    }
    client.close().await;
    res
}

async fn shutdown_signal(token: CancellationToken) -> Result<()> {
    let ret = signal::ctrl_c().await.map_err(|err| anyhow!(err));
    token.cancel();
    ret
}
