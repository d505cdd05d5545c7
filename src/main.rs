use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use engage_dispatch::api::api_routes;
use engage_dispatch::clock::{Clock, SystemClock};
use engage_dispatch::compliance::ComplianceGate;
use engage_dispatch::config::{CounterBackend, EngineConfig, ServerConfig};
use engage_dispatch::counter::{CounterStore, InProcessCounterStore, ResilientCounterStore, SqlCounterStore};
use engage_dispatch::dispatch::{self, DispatchQueue, Gateway, LogGateway, WhatsAppCloudGateway};
use engage_dispatch::pipeline::MessageProcessor;
use engage_dispatch::ratelimit::RateLimiter;
use engage_dispatch::rules::{MasterSwitch, RuleMatcher};
use engage_dispatch::store::{LibSqlRepository, Repository};

/// How often expired counters and idle duplicate-tracking state are dropped.
const PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The guard flushes the file writer on exit.
    let _log_guard = init_logging(ServerConfig::from_env().log_dir.as_deref());

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let server = &config.server;

    eprintln!("📨 Engage Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}/api", server.bind_addr());
    eprintln!("   Events WS: ws://{}/ws", server.bind_addr());

    // ── Database ─────────────────────────────────────────────────────────
    let db = LibSqlRepository::new_local(&server.db_path)
        .await
        .with_context(|| format!("failed to open database at {}", server.db_path.display()))?;
    eprintln!("   Database: {}", server.db_path.display());

    let counter_primary: Arc<dyn CounterStore> = match server.counter_backend {
        CounterBackend::Sql => Arc::new(SqlCounterStore::new(db.connection())),
        CounterBackend::Memory => Arc::new(InProcessCounterStore::new()),
    };
    let counters = Arc::new(ResilientCounterStore::new(counter_primary));
    eprintln!("   Counters: {}", counters.primary_name());

    let repo: Arc<dyn Repository> = Arc::new(db);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── Gateway ──────────────────────────────────────────────────────────
    let gateway: Arc<dyn Gateway> = match config.whatsapp.clone() {
        Some(whatsapp) => {
            eprintln!("   Gateway: WhatsApp Cloud (phone number id {})", whatsapp.phone_number_id);
            Arc::new(WhatsAppCloudGateway::new(whatsapp))
        }
        None => {
            eprintln!("   Gateway: log only (WHATSAPP_PHONE_NUMBER_ID not set)");
            Arc::new(LogGateway)
        }
    };

    // ── Pipeline ─────────────────────────────────────────────────────────
    let gate = Arc::new(ComplianceGate::new(&config.compliance, Arc::clone(&repo), Arc::clone(&clock))?);
    let limiter = Arc::new(RateLimiter::new(
        counters,
        config.rate_limit.clone(),
        gate.business_hours().clone(),
        Arc::clone(&clock),
    ));
    let switch = Arc::new(MasterSwitch::new(config.matcher.automation_enabled));
    let matcher = Arc::new(RuleMatcher::new(
        Arc::clone(&repo),
        Arc::clone(&clock),
        switch,
        config.matcher.min_confidence,
    ));
    let queue = DispatchQueue::new(
        config.dispatch.clone(),
        config.rate_limit.global_per_minute as usize,
        gateway,
        Arc::clone(&repo),
        Arc::clone(&clock),
    );

    // ── Startup Recovery: resume items left unfinished ──────────────────
    match queue.recover().await {
        Ok(0) => {}
        Ok(recovered) => eprintln!("   Recovered {} unfinished queue items", recovered),
        Err(e) => eprintln!("   Warning: queue recovery failed: {}", e),
    }
    let _retention_handle = dispatch::spawn_retention_task(Arc::clone(&queue));

    let processor = Arc::new(MessageProcessor::new(
        Arc::clone(&repo),
        Arc::clone(&gate),
        Arc::clone(&limiter),
        matcher,
        Arc::clone(&queue),
        Arc::clone(&clock),
    ));

    let _purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let counters = limiter.purge_expired().await;
            let contacts = gate.purge().await;
            tracing::debug!(counters, contacts, "Purged expired limiter and duplicate state");
        }
    });

    // ── API server ───────────────────────────────────────────────────────
    let app = api_routes(processor, clock);
    let listener = tokio::net::TcpListener::bind(server.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", server.bind_addr()))?;
    tracing::info!(addr = %server.bind_addr(), "API server started");
    eprintln!();

    let shutdown_queue = Arc::clone(&queue);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Shutdown requested");
            shutdown_queue.shutdown();
        })
        .await
        .context("API server failed")?;

    Ok(())
}

fn init_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "engage-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(false))
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
