use anyhow::{bail, Context, Result};
use nicbond_server::net::capacity::{CapacityModel, ChoiceCell, LaneChoices};
use nicbond_server::net::clients::ClientPool;
use nicbond_server::net::inventory::{self, NicInfo};
use nicbond_server::net::ledger::ByteLedger;
use nicbond_server::net::speedtest;
use nicbond_server::policy::PolicyStore;
use nicbond_server::sched::fetch::FetchEngine;
use nicbond_server::tls::ca::RootCa;
use nicbond_server::tls::forge::ForgeCache;
use nicbond_server::{cache::UrlStore, config::Config, dashboard, proxy, telemetry, Core};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default CryptoProvider before any TLS usage.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install default CryptoProvider");

    telemetry::init();

    let config = Config::from_env();
    info!("starting nicbond-server");

    let ca = Arc::new(RootCa::load_or_generate(&config.cert_dir).context("root CA setup failed")?);
    info!(
        "root CA ready; install {} into your trust store",
        config.cert_dir.join("rootCA.crt").display()
    );

    let policy = PolicyStore::new();
    if let Err(e) = policy.load(&config.policy_path) {
        warn!("policy load failed ({e:#}), continuing with defaults");
    }

    let urls = UrlStore::new(&config.cache_dir);
    urls.load();

    let nics = inventory::discover().context("interface discovery failed")?;
    if nics.is_empty() {
        bail!("no usable egress interface found");
    }
    let ips: Vec<IpAddr> = nics.iter().map(NicInfo::ip_addr).collect();

    let pool = Arc::new(ClientPool::new(ips.clone()));
    let ledger = Arc::new(ByteLedger::new(ips.clone()));

    let profiles = speedtest::run_all(&nics, &pool, &config.speedtest).await;
    if let Some(best) = speedtest::best_probe_ip(&profiles) {
        info!("preferred probe interface: {best}");
    }
    let best_chunks = profiles.iter().map(|(&ip, p)| (ip, p.best_chunk)).collect();

    let shutdown = CancellationToken::new();
    let choices = Arc::new(ChoiceCell::new(LaneChoices::initial(&ips)));
    let (cards_tx, cards_rx) = watch::channel(Vec::new());

    let monitor = CapacityModel::new(&profiles, ledger.clone(), choices.clone(), cards_tx);
    tokio::spawn(monitor.run(shutdown.clone()));

    let dash_addr = config.dashboard_addr;
    let dash_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = dashboard::run(dash_addr, cards_rx, dash_shutdown).await {
            error!("dashboard failed: {e:#}");
        }
    });

    let engine = FetchEngine::new(pool.clone(), ledger.clone(), config.continue_on_client_close);
    let listen_addr = config.listen_addr;
    let core = Arc::new(Core {
        config,
        policy,
        urls,
        forge: ForgeCache::new(ca),
        pool,
        ledger,
        choices,
        best_chunks,
        engine,
        shutdown: shutdown.clone(),
    });

    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let listener_core = core.clone();
    let listener_task = tokio::spawn(async move {
        if let Err(e) = proxy::listener::run(listener_core, ready_tx).await {
            error!("proxy listener failed: {e:#}");
        }
    });
    ready_rx.await.context("proxy failed to start")?;

    // System proxy configuration stays external; just say where to point it.
    info!("configure your system HTTP(S) proxy to {listen_addr}");

    wait_for_shutdown(&shutdown).await;
    shutdown.cancel();

    if let Err(e) = core.urls.persist() {
        warn!("failed to persist url metadata: {e:#}");
    }
    let _ = listener_task.await;

    info!("nicbond-server shut down");
    Ok(())
}

/// Block until SIGINT, SIGTERM, or a dashboard-triggered stop.
async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("received SIGINT, shutting down"),
            Err(e) => error!("failed to listen for SIGINT: {e}"),
        },
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = shutdown.cancelled() => info!("stop signal received, shutting down"),
    }
}
