//! Process wiring: open the store, build every component, recover, then run
//! the coordinator, the HTTP API and the GitHub poll loop until shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cn_agents::process::TokioProcessSpawner;
use cn_agents::supervisor::{AgentSupervisor, SupervisorSettings};
use cn_bridge::commands::{command_channel, CoordinatorHandle};
use cn_bridge::event_bus::EventBus;
use cn_bridge::http_api::{self, ApiState};
use cn_core::config::{expand_home, Config};
use cn_core::git::WorkspaceGit;
use cn_core::store::Store;
use cn_core::workspace::WorkspaceRegistry;
use cn_harness::guardrails::GuardrailGate;
use cn_harness::quota::QuotaLedger;
use cn_harness::shutdown::ShutdownSignal;
use cn_integrations::github::client::{GhCli, ScmClient};
use cn_integrations::github::poller::GitHubPoller;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::coordinator::{Coordinator, CoordinatorParts};
use crate::rules::RulesEngine;

/// How long the daemon waits for its loops after the shutdown signal.
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Daemon {
    config: Config,
    shutdown: ShutdownSignal,
    bus: EventBus,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: ShutdownSignal::new(),
            bus: EventBus::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until the shutdown signal fires and every loop has stopped.
    pub async fn run(self) -> Result<()> {
        let config = &self.config;

        let db_path = expand_home(&config.general.database_path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Arc::new(
            Store::open(&db_path)
                .await
                .with_context(|| format!("failed to open store at {}", db_path.display()))?,
        );

        let mut registry = WorkspaceRegistry::new();
        let root = expand_home(&config.workspaces.root);
        let found = registry
            .discover(&root, &config.workspaces.prefix)
            .with_context(|| format!("failed to scan {}", root.display()))?;
        info!(root = %root.display(), workspaces = found.len(), "workspaces discovered");
        if registry.is_empty() {
            warn!("no workspaces registered, tasks will wait in ready");
        }

        let gate = Arc::new(GuardrailGate::new(&config.guardrails).context("invalid guardrails")?);
        let quota = Arc::new(QuotaLedger::new(config.quota.clone()));
        let rules = RulesEngine::load(&expand_home(&config.rules.path)).context("failed to load rules")?;

        let (reports_tx, reports_rx) = flume::unbounded();
        let supervisor = Arc::new(AgentSupervisor::new(
            Arc::new(TokioProcessSpawner),
            Arc::new(WorkspaceGit::new()),
            gate.clone(),
            quota.clone(),
            SupervisorSettings::from_config(config),
            self.bus.clone(),
            reports_tx,
        ));

        let scm: Arc<dyn ScmClient> = Arc::new(GhCli::new(config.github.repo.clone()));
        let (handle, commands) = command_channel();

        let mut coordinator = Coordinator::new(
            CoordinatorParts {
                store,
                registry,
                quota,
                gate,
                supervisor,
                reports: reports_rx,
                commands,
                rules,
                scm: Some(scm.clone()),
                bus: self.bus.clone(),
            },
            config,
        );
        coordinator.recover().await.context("state recovery failed")?;

        let mut loops = 1;
        let shutdown = self.shutdown.clone();
        tokio::spawn(coordinator.run(shutdown));

        let api = Arc::new(ApiState::new(handle.clone(), self.bus.clone()));
        let bind = config.general.api_bind.clone();
        let api_shutdown = self.shutdown.clone();
        let api_guard = self.shutdown.guard();
        loops += 1;
        tokio::spawn(async move {
            let _guard = api_guard;
            let signal = api_shutdown.clone();
            if let Err(e) = http_api::serve(api, &bind, async move { signal.wait().await }).await {
                error!(bind = %bind, error = %e, "API server error");
                api_shutdown.trigger();
            }
        });

        if config.github.repo.is_some() {
            let poller = GitHubPoller::new(scm, config.github.reviewer_login.clone());
            let every = Duration::from_secs(config.github.poll_interval_secs.max(1));
            loops += 1;
            tokio::spawn(poll_loop(poller, handle, every, self.shutdown.clone()));
        } else {
            info!("github.repo not set, PR polling disabled");
        }

        info!(bind = %config.general.api_bind, "conductor running");
        self.shutdown.wait().await;

        let mut shutdown = self.shutdown.clone();
        let stopped = shutdown.wait_for_loops(loops, LOOP_STOP_TIMEOUT).await;
        info!(stopped, expected = loops, "daemon stopped");
        Ok(())
    }
}

/// Poll every PR an active lifecycle tracks and feed every observed event to
/// the coordinator, which drops the ones it has already processed.
async fn poll_loop(
    poller: GitHubPoller,
    handle: CoordinatorHandle,
    every: Duration,
    shutdown: ShutdownSignal,
) {
    let _guard = shutdown.guard();
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.wait() => {
                info!("shutdown signal received, stopping PR poller");
                break;
            }
        }

        let prs: Vec<u64> = match handle.snapshot().await {
            Ok(state) => state
                .lifecycles
                .iter()
                .filter(|p| !p.stage.is_terminal())
                .filter_map(|p| p.pr_number)
                .collect(),
            Err(e) => {
                warn!(error = %e, "coordinator snapshot failed, skipping poll");
                continue;
            }
        };
        if prs.is_empty() {
            continue;
        }

        let events = poller.poll(&prs).await;
        debug!(prs = prs.len(), events = events.len(), "poll finished");
        for event in events {
            let id = event.id.clone();
            if let Err(e) = handle.submit_event(event).await {
                warn!(event_id = %id, error = %e, "event rejected");
            }
        }
    }
}
