//! The single-writer coordinator.
//!
//! One loop owns the task scheduler, the workspace registry, PR lifecycles
//! and the agent records. Everything else (HTTP handlers, the GitHub poller,
//! agent monitors, slow `gh`/git calls) talks to it through channels:
//!
//! - [`Command`]s from [`CoordinatorHandle`](cn_bridge::commands::CoordinatorHandle),
//!   answered on a oneshot.
//! - [`SupervisorReport`]s from agent monitors.
//! - Internal completions of work the coordinator started off-loop.
//! - A periodic tick that re-evaluates dependencies and admits ready tasks.
//!
//! Every state change is written to the store before it is published on the
//! event bus.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cn_agents::supervisor::{AgentExit, AgentSupervisor, ExitOutcome, SupervisorError, SupervisorReport};
use cn_bridge::commands::{
    CancelOutcome, Command, CommandError, CommandResult, EventReceipt, NewLifecycle, PlanUpdate,
    Reply, StateSnapshot,
};
use cn_bridge::event_bus::EventBus;
use cn_bridge::protocol::StateChange;
use cn_core::config::Config;
use cn_core::error::{CoreError, FailureKind};
use cn_core::store::{QuotaUsage, Store, StoreError};
use cn_core::types::{
    Agent, AgentStatus, BlockReason, ExternalEvent, LifecycleId, NewTask, PrLifecycle, PrStage,
    Task, TaskId, Workspace,
};
use cn_core::workspace::WorkspaceRegistry;
use cn_harness::guardrails::GuardrailGate;
use cn_harness::quota::{Admission, AdmissionKind, DenyReason, QuotaLedger};
use cn_harness::shutdown::ShutdownSignal;
use cn_integrations::github::client::ScmClient;
use cn_integrations::types::CreatePr;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pr_pipeline::{Effect, PrPipeline};
use crate::rules::RulesEngine;
use crate::scheduler::{CancelStep, TaskScheduler};

/// Failed-check logs attached to CI fix tasks are cut to this many chars.
const CI_LOG_MAX_CHARS: usize = 3000;
const GH_CALL_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Everything the coordinator owns or talks to.
pub struct CoordinatorParts {
    pub store: Arc<Store>,
    pub registry: WorkspaceRegistry,
    pub quota: Arc<QuotaLedger>,
    pub gate: Arc<GuardrailGate>,
    pub supervisor: Arc<AgentSupervisor>,
    pub reports: flume::Receiver<SupervisorReport>,
    pub commands: flume::Receiver<Command>,
    pub rules: RulesEngine,
    /// `None` runs without GitHub: PR creation escalates, comments are skipped.
    pub scm: Option<Arc<dyn ScmClient>>,
    pub bus: EventBus,
}

/// Work finished off-loop, fed back into the coordinator.
enum Internal {
    PrCreated {
        lifecycle_id: LifecycleId,
        result: Result<u64, String>,
    },
    FollowUp {
        lifecycle_id: LifecycleId,
        task: NewTask,
    },
    RestoreDone {
        workspace: String,
        result: Result<(), String>,
        reply: Option<Reply<Workspace>>,
    },
}

pub struct Coordinator {
    store: Arc<Store>,
    scheduler: TaskScheduler,
    registry: WorkspaceRegistry,
    quota: Arc<QuotaLedger>,
    gate: Arc<GuardrailGate>,
    supervisor: Arc<AgentSupervisor>,
    pipeline: PrPipeline,
    rules: RulesEngine,
    scm: Option<Arc<dyn ScmClient>>,
    bus: EventBus,

    lifecycles: BTreeMap<LifecycleId, PrLifecycle>,
    agents: BTreeMap<Uuid, Agent>,
    /// Workspaces with a restore in flight; never admitted into.
    restoring: BTreeSet<String>,

    commands: flume::Receiver<Command>,
    reports: flume::Receiver<SupervisorReport>,
    internal_tx: flume::Sender<Internal>,
    internal_rx: flume::Receiver<Internal>,

    tick_interval: Duration,
    kill_deadline: Duration,
    last_usage: Option<(String, QuotaUsage)>,
    shutting_down: bool,
}

fn store_err(e: StoreError) -> CommandError {
    CoreError::from(e).into()
}

impl Coordinator {
    pub fn new(parts: CoordinatorParts, config: &Config) -> Self {
        let (internal_tx, internal_rx) = flume::unbounded();
        Self {
            store: parts.store,
            scheduler: TaskScheduler::new(config.guardrails.max_retries),
            registry: parts.registry,
            quota: parts.quota,
            gate: parts.gate,
            supervisor: parts.supervisor,
            pipeline: PrPipeline::new(config.pr_pipeline.clone()),
            rules: parts.rules,
            scm: parts.scm,
            bus: parts.bus,
            lifecycles: BTreeMap::new(),
            agents: BTreeMap::new(),
            restoring: BTreeSet::new(),
            commands: parts.commands,
            reports: parts.reports,
            internal_tx,
            internal_rx,
            tick_interval: Duration::from_millis(config.daemon.tick_interval_ms.max(10)),
            kill_deadline: Duration::from_secs(config.agents.kill_deadline_secs),
            last_usage: None,
            shutting_down: false,
        }
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Reload persisted state. Runs once, before [`Coordinator::run`].
    ///
    /// No agent survives a restart: running tasks go back to `ready`, their
    /// agents are recorded `killed`, and every lease starts free.
    pub async fn recover(&mut self) -> Result<(), CoreError> {
        let tasks = self.store.list_tasks().await?;
        let requeued = self.scheduler.load(tasks);
        self.commit_tasks(&requeued).await;

        for mut agent in self.store.list_agents().await? {
            if !agent.status.is_terminal() {
                agent.status = AgentStatus::Killed;
                agent.reason = Some("daemon restarted".into());
                agent.completed_at = Some(Utc::now());
                self.store.upsert_agent(&agent).await?;
            }
            self.agents.insert(agent.id, agent);
        }

        let stored: BTreeMap<String, Workspace> = self
            .store
            .list_workspaces()
            .await?
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        for ws in self.registry.list() {
            if let Some(snapshot) = stored.get(&ws.name).and_then(|w| w.snapshot.clone()) {
                let _ = self.registry.set_snapshot(&ws.name, Some(snapshot));
            }
        }
        let released = self.registry.release_all();
        for ws in self.registry.list() {
            self.store.upsert_workspace(&ws).await?;
        }

        for prl in self.store.list_lifecycles().await? {
            self.lifecycles.insert(prl.id, prl);
        }

        let (day, _) = self.quota.usage();
        if let Some(usage) = self.store.load_quota_usage(&day).await? {
            self.quota.restore_usage(&day, usage);
        }
        self.last_usage = Some(self.quota.usage());

        info!(
            tasks = self.scheduler.len(),
            requeued = requeued.len(),
            leases_released = released,
            workspaces = self.registry.len(),
            lifecycles = self.lifecycles.len(),
            "state recovered"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let _guard = shutdown.guard();
        let commands = self.commands.clone();
        let reports = self.reports.clone();
        let internal = self.internal_rx.clone();

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "coordinator started");

        loop {
            tokio::select! {
                cmd = commands.recv_async() => match cmd {
                    Ok(cmd) => self.handle_command(cmd).await,
                    Err(_) => {
                        info!("command channel closed");
                        break;
                    }
                },
                Ok(report) = reports.recv_async() => self.handle_report(report).await,
                Ok(msg) = internal.recv_async() => self.handle_internal(msg).await,
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.wait() => {
                    info!("shutdown signal received, stopping coordinator");
                    break;
                }
            }
        }
        self.drain().await;
    }

    /// Kill every agent and wait for their reports, bounded by the kill
    /// deadline. Tasks killed here stay `running` in the store so the next
    /// start returns them to `ready`.
    async fn drain(&mut self) {
        self.shutting_down = true;
        let killed = self.supervisor.kill_all();
        let deadline = tokio::time::Instant::now() + self.kill_deadline + Duration::from_secs(1);
        while self.supervisor.live_count() > 0 {
            match tokio::time::timeout_at(deadline, self.reports.recv_async()).await {
                Ok(Ok(report)) => self.handle_report(report).await,
                _ => break,
            }
        }
        let stranded = self.supervisor.live_count();
        if stranded > 0 {
            warn!(stranded, "agents still live after drain deadline");
        }
        self.persist_quota(true).await;
        info!(killed, "coordinator stopped");
    }

    async fn tick(&mut self) {
        let now = Utc::now();
        if self.quota.tick(now) {
            self.bus.publish(StateChange::QuotaChanged(self.quota.snapshot()));
        }
        let changed = self.scheduler.tick();
        self.commit_tasks(&changed).await;
        self.admit(now).await;
        self.persist_quota(false).await;
    }

    /// Promote ready tasks, best first, while workspaces and quota allow.
    async fn admit(&mut self, now: chrono::DateTime<Utc>) {
        let mut changed = Vec::new();
        for id in self.scheduler.admission_order(now) {
            let Some(task) = self.scheduler.get(id).cloned() else {
                continue;
            };
            // Refused before admission; a protected branch is never charged.
            if let Err(v) = self.gate.check_branch(&task.branch) {
                error!(
                    task_id = id,
                    rule = %v.rule,
                    detail = %v.detail,
                    "task rejected at spawn"
                );
                if self
                    .scheduler
                    .fail(id, FailureKind::Guardrail, v.to_string())
                    .is_ok()
                {
                    changed.push(id);
                }
                continue;
            }

            let free = self
                .registry
                .list()
                .into_iter()
                .find(|w| w.is_free() && !self.restoring.contains(&w.name))
                .map(|w| w.name);
            let Some(workspace) = free else {
                if self.scheduler.set_block_reason(id, Some(BlockReason::NoWorkspace)) {
                    changed.push(id);
                }
                continue;
            };

            let reserve = match self
                .quota
                .request_admission(AdmissionKind::AgentSpawn, task.human_initiated)
            {
                Admission::Granted { reserve } => {
                    debug!(task_id = id, reserve, "admission granted");
                    reserve
                }
                Admission::Denied(DenyReason::ConcurrencyCeiling { max }) => {
                    debug!(task_id = id, max, "concurrency ceiling reached");
                    break;
                }
                Admission::Denied(reason) => {
                    debug!(task_id = id, reason = %reason, "admission denied");
                    if self.scheduler.set_block_reason(id, Some(BlockReason::QuotaExhausted)) {
                        changed.push(id);
                    }
                    continue;
                }
            };

            match self.supervisor.spawn(&task, &workspace, &mut self.registry) {
                Ok(agent) => {
                    if let Err(e) = self.scheduler.mark_running(id, &workspace) {
                        error!(task_id = id, error = %e, "admitted task could not start");
                        self.supervisor.kill(agent.id);
                    }
                    self.save_agent(agent).await;
                    self.save_workspace(&workspace).await;
                    changed.push(id);
                }
                Err(SupervisorError::Guardrail(v)) => {
                    self.quota.refund_spawn(reserve);
                    error!(
                        task_id = id,
                        rule = %v.rule,
                        detail = %v.detail,
                        "task rejected at spawn"
                    );
                    if self
                        .scheduler
                        .fail(id, FailureKind::Guardrail, v.to_string())
                        .is_ok()
                    {
                        changed.push(id);
                    }
                }
                Err(e) => {
                    self.quota.refund_spawn(reserve);
                    warn!(task_id = id, workspace = %workspace, error = %e, "spawn failed");
                    break;
                }
            }
        }
        self.commit_tasks(&changed).await;
    }

    // -----------------------------------------------------------------------
    // Supervisor reports
    // -----------------------------------------------------------------------

    async fn handle_report(&mut self, report: SupervisorReport) {
        match report {
            SupervisorReport::Snapshot {
                agent_id,
                workspace,
                snapshot,
            } => {
                debug!(agent_id = %agent_id, workspace = %workspace, head = %snapshot.head, "snapshot taken");
                if let Err(e) = self.registry.set_snapshot(&workspace, Some(snapshot)) {
                    warn!(workspace = %workspace, error = %e, "snapshot for unknown workspace");
                    return;
                }
                self.save_workspace(&workspace).await;
            }
            SupervisorReport::AgentUpdated(agent) => {
                let status_changed = self
                    .agents
                    .get(&agent.id)
                    .is_none_or(|a| a.status != agent.status);
                if status_changed {
                    self.save_agent(agent).await;
                } else {
                    self.agents.insert(agent.id, agent);
                }
            }
            SupervisorReport::QuotaWait {
                agent_id,
                task_id,
                attempt,
                retry_after,
            } => match self.scheduler.note_quota_wait(task_id, retry_after) {
                Ok(()) => {
                    info!(agent_id = %agent_id, task_id, attempt, "task waiting out rate limit");
                    self.commit_tasks(&[task_id]).await;
                }
                Err(e) => debug!(task_id, error = %e, "quota wait for task not running"),
            },
            SupervisorReport::Finished(exit) => {
                if !self.supervisor.finish(exit.agent.id) {
                    debug!(agent_id = %exit.agent.id, "late report for finalized agent");
                    return;
                }
                self.finalize(exit).await;
            }
            SupervisorReport::DeadlineExpired { agent_id } => {
                let Some((task_id, workspace)) = self.supervisor.force_release(agent_id) else {
                    return;
                };
                let mut agent = self.agents.get(&agent_id).cloned().unwrap_or_else(|| {
                    let mut a = Agent::new(task_id, &workspace);
                    a.id = agent_id;
                    a
                });
                agent.status = AgentStatus::Killed;
                agent.reason = Some("did not stop before the kill deadline".into());
                agent.completed_at = Some(Utc::now());
                self.bus.publish(StateChange::AgentStatus(agent.clone()));
                self.finalize(AgentExit {
                    agent,
                    outcome: ExitOutcome::Killed,
                    rolled_back: false,
                    tail: Vec::new(),
                })
                .await;
                self.start_restore(&workspace, None);
            }
        }
    }

    /// Settle an agent that reached a terminal state: give back its
    /// concurrency slot and lease, then move its task on.
    async fn finalize(&mut self, exit: AgentExit) {
        let AgentExit {
            agent,
            outcome,
            rolled_back,
            tail,
        } = exit;
        let task_id = agent.task_id;
        let workspace = agent.workspace.clone();

        self.quota.agent_stopped();
        if let Err(e) = self.registry.release(&workspace) {
            warn!(workspace = %workspace, error = %e, "release failed");
        }
        self.save_workspace(&workspace).await;
        self.save_agent(agent).await;

        let Some(task) = self.scheduler.get(task_id) else {
            warn!(task_id, "finished agent's task is gone");
            return;
        };
        let cancel_requested = task.cancel_requested;

        if self.shutting_down && !cancel_requested && outcome == ExitOutcome::Killed {
            info!(task_id, "task left for restart recovery");
            return;
        }

        let result = if cancel_requested {
            self.scheduler.finish_cancel(task_id)
        } else {
            match &outcome {
                ExitOutcome::Completed => self.scheduler.complete(task_id),
                other => {
                    let kind = other.failure_kind().unwrap_or(FailureKind::Permanent);
                    let reason = other.reason().unwrap_or_else(|| "agent failed".into());
                    if kind == FailureKind::Guardrail {
                        error!(
                            task_id,
                            workspace = %workspace,
                            reason = %reason,
                            rolled_back,
                            "task failed on guardrail violation"
                        );
                        if !rolled_back {
                            warn!(workspace = %workspace, "workspace was not restored after violation");
                        }
                    }
                    debug!(task_id, tail = tail.len(), "agent output tail retained");
                    self.scheduler.retry_or_fail(task_id, kind, reason).map(|_| ())
                }
            }
        };
        match result {
            Ok(()) => self.commit_tasks(&[task_id]).await,
            Err(e) => warn!(task_id, error = %e, "task outcome not applied"),
        }
    }

    // -----------------------------------------------------------------------
    // Off-loop completions
    // -----------------------------------------------------------------------

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::PrCreated {
                lifecycle_id,
                result,
            } => {
                let Some(mut prl) = self.lifecycles.get(&lifecycle_id).cloned() else {
                    return;
                };
                let effects = self.pipeline.on_pr_created(&mut prl, result);
                if let Err(e) = self.save_lifecycle(prl).await {
                    error!(prl_id = lifecycle_id, error = %e, "failed to persist lifecycle");
                    return;
                }
                self.apply_effects(lifecycle_id, effects).await;
            }
            Internal::FollowUp { lifecycle_id, task } => {
                let still_fixing = self
                    .lifecycles
                    .get(&lifecycle_id)
                    .is_some_and(|p| p.stage == PrStage::CiFixing);
                if !still_fixing {
                    debug!(prl_id = lifecycle_id, title = %task.title, "follow-up dropped, lifecycle moved on");
                    return;
                }
                match self.insert_task(task).await {
                    Ok(task) => self.track_tasks(lifecycle_id, &[task.id]).await,
                    Err(e) => error!(prl_id = lifecycle_id, error = %e, "failed to create follow-up task"),
                }
            }
            Internal::RestoreDone {
                workspace,
                result,
                reply,
            } => {
                self.restoring.remove(&workspace);
                match &result {
                    Ok(()) => info!(workspace = %workspace, "workspace restored to snapshot"),
                    Err(e) => error!(workspace = %workspace, error = %e, "workspace restore failed"),
                }
                self.save_workspace(&workspace).await;
                if let Some(reply) = reply {
                    let answer = match result {
                        Ok(()) => self.registry.get(&workspace).cloned().ok_or_else(|| {
                            CommandError::NotFound {
                                entity: "workspace".into(),
                                id: workspace.clone(),
                            }
                        }),
                        Err(e) => Err(CommandError::Internal(e)),
                    };
                    let _ = reply.send(answer);
                }
            }
        }
    }

    /// Restore `workspace` to its last snapshot off-loop. Returns `false`
    /// when there is no snapshot to restore.
    fn start_restore(&mut self, workspace: &str, reply: Option<Reply<Workspace>>) -> bool {
        let Some((path, snapshot)) = self
            .registry
            .get(workspace)
            .and_then(|w| w.snapshot.clone().map(|s| (w.path.clone(), s)))
        else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(CommandError::Precondition(format!(
                    "workspace {workspace} has no snapshot"
                ))));
            }
            return false;
        };
        self.restoring.insert(workspace.to_string());
        let supervisor = self.supervisor.clone();
        let tx = self.internal_tx.clone();
        let workspace = workspace.to_string();
        tokio::spawn(async move {
            let result = supervisor
                .restore_workspace(path, snapshot)
                .await
                .map_err(|e| e.to_string());
            let _ = tx.send(Internal::RestoreDone {
                workspace,
                result,
                reply,
            });
        });
        true
    }

    // -----------------------------------------------------------------------
    // PR pipeline plumbing
    // -----------------------------------------------------------------------

    async fn on_linked_task_finished(&mut self, task: &Task) {
        let Some(id) = task.lifecycle_id else {
            return;
        };
        let Some(mut prl) = self
            .lifecycles
            .get(&id)
            .filter(|p| p.open_tasks.contains(&task.id))
            .cloned()
        else {
            return;
        };
        let effects = self.pipeline.on_task_finished(&mut prl, task);
        if let Err(e) = self.save_lifecycle(prl).await {
            error!(prl_id = id, error = %e, "failed to persist lifecycle");
            return;
        }
        self.apply_effects(id, effects).await;
    }

    /// Carry out pipeline effects. Returns the ids of tasks created on the
    /// spot.
    async fn apply_effects(&mut self, lifecycle_id: LifecycleId, effects: Vec<Effect>) -> Vec<TaskId> {
        let mut created = Vec::new();
        for effect in effects {
            match effect {
                Effect::CreateTask(new) => match self.insert_task(new).await {
                    Ok(task) => created.push(task.id),
                    Err(e) => error!(prl_id = lifecycle_id, error = %e, "failed to create follow-up task"),
                },
                Effect::FixCi {
                    check_name,
                    branch,
                    task,
                } => self.fix_ci(lifecycle_id, check_name, branch, task),
                Effect::CreatePr(request) => self.open_pr(lifecycle_id, request),
                Effect::Comment { pr_number, body } => self.post_comment(pr_number, body),
            }
        }
        if !created.is_empty() {
            self.track_tasks(lifecycle_id, &created).await;
        }
        created
    }

    async fn track_tasks(&mut self, lifecycle_id: LifecycleId, ids: &[TaskId]) {
        let Some(mut prl) = self.lifecycles.get(&lifecycle_id).cloned() else {
            return;
        };
        for id in ids {
            self.pipeline.track_task(&mut prl, *id);
        }
        if let Err(e) = self.save_lifecycle(prl).await {
            error!(prl_id = lifecycle_id, error = %e, "failed to persist lifecycle");
        }
    }

    /// Fetch the failing check's log, then inject the fix task with it.
    fn fix_ci(&self, lifecycle_id: LifecycleId, check: String, branch: String, mut task: NewTask) {
        let tx = self.internal_tx.clone();
        let Some(scm) = self.scm.clone() else {
            let _ = tx.send(Internal::FollowUp { lifecycle_id, task });
            return;
        };
        tokio::spawn(async move {
            let log = tokio::time::timeout(GH_CALL_TIMEOUT, scm.failed_check_log(&branch, &check)).await;
            match log {
                Ok(Ok(Some(log))) => {
                    let excerpt: String = log.chars().take(CI_LOG_MAX_CHARS).collect();
                    task.description
                        .push_str(&format!("\n\nFailed log excerpt:\n```\n{excerpt}\n```"));
                }
                Ok(Ok(None)) => debug!(check = %check, "no failed run log found"),
                Ok(Err(e)) => warn!(check = %check, error = %e, "failed to fetch CI log"),
                Err(_) => warn!(check = %check, "timed out fetching CI log"),
            }
            let _ = tx.send(Internal::FollowUp { lifecycle_id, task });
        });
    }

    fn open_pr(&self, lifecycle_id: LifecycleId, request: CreatePr) {
        let tx = self.internal_tx.clone();
        let Some(scm) = self.scm.clone() else {
            let _ = tx.send(Internal::PrCreated {
                lifecycle_id,
                result: Err("no GitHub repository configured".into()),
            });
            return;
        };
        tokio::spawn(async move {
            let result = match tokio::time::timeout(GH_CALL_TIMEOUT, scm.create_pr(&request, None)).await {
                Ok(res) => res.map_err(|e| e.to_string()),
                Err(_) => Err("timed out creating the pull request".into()),
            };
            let _ = tx.send(Internal::PrCreated {
                lifecycle_id,
                result,
            });
        });
    }

    fn post_comment(&self, pr_number: u64, body: String) {
        let Some(scm) = self.scm.clone() else {
            debug!(pr_number, "no GitHub repository configured, comment skipped");
            return;
        };
        tokio::spawn(async move {
            match tokio::time::timeout(GH_CALL_TIMEOUT, scm.comment_on_pr(pr_number, &body)).await {
                Ok(Ok(())) => debug!(pr_number, "comment posted"),
                Ok(Err(e)) => warn!(pr_number, error = %e, "failed to comment on PR"),
                Err(_) => warn!(pr_number, "timed out commenting on PR"),
            }
        });
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: Command) {
        debug!(command = cmd.name(), "command received");
        match cmd {
            Command::CreateTask { task, reply } => {
                let result = self.insert_task(task).await;
                let created = result.is_ok();
                let _ = reply.send(result);
                if created {
                    self.tick().await;
                }
            }
            Command::DeleteTask { id, reply } => {
                let _ = reply.send(self.delete_task(id).await);
            }
            Command::CancelTask { id, reply } => {
                let _ = reply.send(self.cancel_task(id).await);
            }
            Command::KillAgent { id, reply } => {
                let _ = reply.send(Ok(self.supervisor.kill(id)));
            }
            Command::KillAll { reply } => {
                let _ = reply.send(Ok(self.supervisor.kill_all()));
            }
            Command::RollbackWorkspace { name, reply } => self.rollback_workspace(name, reply),
            Command::CreateLifecycle { lifecycle, reply } => {
                let _ = reply.send(self.create_lifecycle(lifecycle).await);
            }
            Command::ApprovePlan { id, update, reply } => {
                let _ = reply.send(self.approve_plan(id, update).await);
            }
            Command::ResumeLifecycle { id, reply } => {
                let _ = reply.send(self.resume_lifecycle(id).await);
            }
            Command::DeleteLifecycle { id, reply } => {
                let _ = reply.send(self.delete_lifecycle(id).await);
            }
            Command::SubmitEvent { event, reply } => {
                let result = self.submit_event(event).await;
                let created = result.as_ref().is_ok_and(|r| !r.tasks_created.is_empty());
                let _ = reply.send(result);
                if created {
                    self.tick().await;
                }
            }
            Command::ResumeQuota { reply } => {
                self.quota.resume();
                let state = self.quota.snapshot();
                self.bus.publish(StateChange::QuotaChanged(state.clone()));
                let _ = reply.send(Ok(state));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    async fn insert_task(&mut self, new: NewTask) -> CommandResult<Task> {
        let id = self.store.next_id("task").await.map_err(store_err)?;
        let task = self.scheduler.create(id, new)?;
        if let Err(e) = self.store.insert_task(&task).await {
            self.scheduler.forget(id);
            return Err(store_err(e));
        }
        info!(
            task_id = id,
            title = %task.title,
            priority = %task.priority,
            status = %task.status,
            "task created"
        );
        self.bus.publish(StateChange::TaskCreated(task.clone()));
        Ok(task)
    }

    async fn delete_task(&mut self, id: TaskId) -> CommandResult<()> {
        let task = self
            .scheduler
            .get(id)
            .ok_or_else(|| CoreError::not_found("task", id))?;
        if !task.status.is_terminal() {
            return Err(CommandError::Precondition(format!(
                "task {id} is {} and not terminal; cancel it first",
                task.status
            )));
        }
        self.store.delete_task(id).await.map_err(store_err)?;
        let (_, edited) = self.scheduler.delete(id)?;
        self.bus.publish(StateChange::TaskDeleted { id });
        self.commit_tasks(&edited).await;
        Ok(())
    }

    async fn cancel_task(&mut self, id: TaskId) -> CommandResult<CancelOutcome> {
        match self.scheduler.cancel(id)? {
            CancelStep::Cancelled => {
                self.commit_tasks(&[id]).await;
                Ok(CancelOutcome::Cancelled)
            }
            CancelStep::KillAgent => match self.supervisor.agent_for_task(id) {
                Some(agent_id) => {
                    self.commit_tasks(&[id]).await;
                    self.supervisor.kill(agent_id);
                    Ok(CancelOutcome::Killing { agent_id })
                }
                None => {
                    self.scheduler.finish_cancel(id)?;
                    self.commit_tasks(&[id]).await;
                    Ok(CancelOutcome::Cancelled)
                }
            },
        }
    }

    fn rollback_workspace(&mut self, name: String, reply: Reply<Workspace>) {
        let precondition = match self.registry.get(&name) {
            None => {
                let _ = reply.send(Err(CommandError::NotFound {
                    entity: "workspace".into(),
                    id: name,
                }));
                return;
            }
            Some(ws) if !ws.is_free() => Some(format!(
                "workspace {name} is leased to task {}",
                ws.task_id.map_or_else(|| "?".to_string(), |t| t.to_string())
            )),
            Some(_) if self.restoring.contains(&name) => {
                Some(format!("workspace {name} is already being restored"))
            }
            Some(_) => None,
        };
        if let Some(msg) = precondition {
            let _ = reply.send(Err(CommandError::Precondition(msg)));
            return;
        }
        info!(workspace = %name, "rollback requested");
        self.start_restore(&name, Some(reply));
    }

    async fn create_lifecycle(&mut self, new: NewLifecycle) -> CommandResult<PrLifecycle> {
        let title = new.title.trim();
        let branch = new.branch.trim();
        if title.is_empty() {
            return Err(CommandError::Invalid("title must not be empty".into()));
        }
        if branch.is_empty() {
            return Err(CommandError::Invalid("branch must not be empty".into()));
        }
        if self.gate.is_protected(branch) {
            return Err(CommandError::Invalid(format!("branch {branch} is protected")));
        }
        if let Some(pr) = new.pr_number {
            if let Some(existing) = self
                .lifecycles
                .values()
                .find(|p| p.pr_number == Some(pr) && !p.stage.is_terminal())
            {
                return Err(CommandError::Precondition(format!(
                    "PR #{pr} is already tracked by lifecycle {}",
                    existing.id
                )));
            }
        }

        let id = self.store.next_id("lifecycle").await.map_err(store_err)?;
        let prl = self
            .pipeline
            .new_lifecycle(id, title, branch, new.plan, new.pr_number);
        self.store.insert_lifecycle(&prl).await.map_err(store_err)?;
        self.lifecycles.insert(id, prl.clone());
        self.bus.publish(StateChange::LifecycleChanged(prl.clone()));
        Ok(prl)
    }

    async fn approve_plan(&mut self, id: LifecycleId, update: PlanUpdate) -> CommandResult<PrLifecycle> {
        let mut prl = self.lifecycle(id)?;
        let effects = self.pipeline.approve(&mut prl, update.title, update.plan)?;
        self.save_lifecycle(prl).await?;
        self.apply_effects(id, effects).await;
        self.lifecycle(id)
    }

    async fn resume_lifecycle(&mut self, id: LifecycleId) -> CommandResult<PrLifecycle> {
        let mut prl = self.lifecycle(id)?;
        self.pipeline.resume(&mut prl)?;
        Ok(self.save_lifecycle(prl).await?)
    }

    async fn delete_lifecycle(&mut self, id: LifecycleId) -> CommandResult<()> {
        self.lifecycle(id)?;
        self.store.delete_lifecycle(id).await.map_err(store_err)?;
        self.lifecycles.remove(&id);
        info!(prl_id = id, "lifecycle deleted");
        self.bus.publish(StateChange::LifecycleDeleted { id });
        Ok(())
    }

    /// Route one external event: suppress duplicates by identity, advance
    /// the lifecycle that owns its PR, then fire every matching rule.
    async fn submit_event(&mut self, event: ExternalEvent) -> CommandResult<EventReceipt> {
        if event.id.trim().is_empty() {
            return Err(CommandError::Invalid("event id must not be empty".into()));
        }
        let fresh = self
            .store
            .mark_event_processed(&event.id, &event.kind.to_string())
            .await
            .map_err(store_err)?;
        if !fresh {
            debug!(event_id = %event.id, "duplicate event ignored");
            return Ok(EventReceipt {
                duplicate: true,
                ..EventReceipt::default()
            });
        }

        let mut receipt = EventReceipt::default();
        let owner = event.pr_number().and_then(|n| {
            self.lifecycles
                .values()
                .find(|p| p.pr_number == Some(n) && !p.stage.is_terminal())
                .cloned()
        });
        let branch = owner.as_ref().map(|p| p.branch.clone());

        if let Some(mut prl) = owner {
            let id = prl.id;
            let before = serde_json::to_value(&prl).ok();
            let effects = self.pipeline.on_event(&mut prl, &event);
            if serde_json::to_value(&prl).ok() != before {
                self.save_lifecycle(prl).await?;
                receipt.lifecycles_changed.push(id);
            }
            receipt
                .tasks_created
                .extend(self.apply_effects(id, effects).await);
        }

        for new in self.rules.evaluate(&event, branch.as_deref()) {
            match self.insert_task(new).await {
                Ok(task) => receipt.tasks_created.push(task.id),
                Err(e) => warn!(event_id = %event.id, error = %e, "rule task not created"),
            }
        }
        info!(
            event_id = %event.id,
            kind = %event.kind,
            tasks = receipt.tasks_created.len(),
            lifecycles = receipt.lifecycles_changed.len(),
            "event processed"
        );
        Ok(receipt)
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            tasks: self.scheduler.list(),
            agents: self.agents.values().cloned().collect(),
            workspaces: self.registry.list(),
            lifecycles: self.lifecycles.values().cloned().collect(),
            quota: self.quota.snapshot(),
            time_until_reset: self.quota.time_until_reset(Utc::now()),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence helpers
    // -----------------------------------------------------------------------

    fn lifecycle(&self, id: LifecycleId) -> CommandResult<PrLifecycle> {
        self.lifecycles
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("pr_lifecycle", id).into())
    }

    /// Write, then adopt and publish. On error nothing in memory changes.
    async fn save_lifecycle(&mut self, mut prl: PrLifecycle) -> Result<PrLifecycle, CoreError> {
        self.store.update_lifecycle(&mut prl).await?;
        self.lifecycles.insert(prl.id, prl.clone());
        self.bus.publish(StateChange::LifecycleChanged(prl.clone()));
        Ok(prl)
    }

    /// Persist and publish tasks the scheduler changed, then let the PR
    /// pipeline react to linked tasks that reached a terminal status.
    async fn commit_tasks(&mut self, ids: &[TaskId]) {
        if ids.is_empty() {
            return;
        }
        let mut tasks: Vec<Task> = ids
            .iter()
            .filter_map(|id| self.scheduler.get(*id).cloned())
            .collect();
        match self.store.update_tasks(&mut tasks).await {
            Ok(()) => {
                for task in &tasks {
                    self.scheduler.replace(task.clone());
                }
            }
            Err(e) => error!(count = tasks.len(), error = %e, "failed to persist tasks"),
        }
        for task in &tasks {
            self.bus.publish(StateChange::TaskUpdated(task.clone()));
        }
        for task in tasks
            .iter()
            .filter(|t| t.status.is_terminal() && t.lifecycle_id.is_some())
        {
            self.on_linked_task_finished(task).await;
        }
    }

    async fn save_agent(&mut self, agent: Agent) {
        if let Err(e) = self.store.upsert_agent(&agent).await {
            error!(agent_id = %agent.id, error = %e, "failed to persist agent");
        }
        self.agents.insert(agent.id, agent);
    }

    async fn save_workspace(&self, name: &str) {
        let Some(ws) = self.registry.get(name).cloned() else {
            return;
        };
        if let Err(e) = self.store.upsert_workspace(&ws).await {
            error!(workspace = name, error = %e, "failed to persist workspace");
        }
        self.bus.publish(StateChange::WorkspaceChanged(ws));
    }

    async fn persist_quota(&mut self, force: bool) {
        let current = self.quota.usage();
        if !force && self.last_usage.as_ref() == Some(&current) {
            return;
        }
        if let Err(e) = self.store.save_quota_usage(&current.0, current.1).await {
            error!(error = %e, "failed to persist quota usage");
            return;
        }
        self.last_usage = Some(current);
        self.bus.publish(StateChange::QuotaChanged(self.quota.snapshot()));
    }
}
