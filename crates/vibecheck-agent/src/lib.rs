pub mod agent;
pub mod config;
pub mod connection;
pub mod executor;
pub mod scheduler;
pub mod sdk;
pub mod security;
pub mod session;
pub mod workspace;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use agent::Agent;
use config::AgentConfig;
use connection::Outbound;
use executor::QueryExecutor;
use scheduler::Scheduler;
use security::SecurityMediator;
use session::SessionStore;

/// Wire everything up and serve until a termination signal arrives.
pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let session_dir = config::session_dir()?;

    let store = Arc::new(SessionStore::new(&session_dir, &config.work_dir_str()));
    if config.new_session {
        info!("starting a fresh conversation (--new-session)");
    } else {
        store.load();
    }

    let outbound = Outbound::new();
    let security = Arc::new(SecurityMediator::new(
        config.work_dir.clone(),
        outbound.clone(),
    ));
    let executor = Arc::new(QueryExecutor::new(
        config.clone(),
        store.clone(),
        security.clone(),
        outbound.clone(),
    ));

    let (fire_tx, mut fire_rx) = mpsc::unbounded_channel();
    let scheduler = Arc::new(Scheduler::new(session_dir.join("schedules.json"), fire_tx));

    let agent = Arc::new(Agent::new(
        config.clone(),
        outbound.clone(),
        store,
        security,
        executor,
        scheduler,
    ));

    info!("==================================================");
    info!("  VibeCheck Agent");
    info!("  work dir: {}", config.work_dir.display());
    info!("  relay:    {}", config.server_url);
    info!("==================================================");

    // Cron firings compete with interactive queries for the execution slot.
    let task_agent = agent.clone();
    tokio::spawn(async move {
        while let Some(task) = fire_rx.recv().await {
            let agent = task_agent.clone();
            tokio::spawn(async move {
                agent.run_scheduled(task).await;
            });
        }
    });

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    connection::run(agent, outbound, shutdown).await;

    info!("agent stopped");
    Ok(())
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "cannot register SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("termination signal received, shutting down");
        shutdown.cancel();
    });
}
