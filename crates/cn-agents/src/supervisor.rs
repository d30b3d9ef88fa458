use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cn_bridge::event_bus::EventBus;
use cn_bridge::protocol::StateChange;
use cn_core::config::Config;
use cn_core::error::FailureKind;
use cn_core::git::{GitError, WorkspaceGit};
use cn_core::types::{Agent, AgentStatus, Snapshot, Task, TaskId};
use cn_core::workspace::{RegistryError, WorkspaceRegistry};
use cn_harness::guardrails::{GuardrailGate, GuardrailViolation};
use cn_harness::quota::QuotaLedger;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::classifier::{Classification, FailureClassifier, HeuristicClassifier, RunOutcome};
use crate::process::{LaunchSpec, ProcessControl, ProcessSpawner, SpawnedProcess};
use crate::state_machine::{AgentEvent, AgentStateMachine};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Guardrail(#[from] GuardrailViolation),
    #[error(transparent)]
    Lease(#[from] RegistryError),
    #[error("git: {0}")]
    Git(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub command: String,
    pub prompt_flag: String,
    pub args: Vec<String>,
    pub task_timeout: Duration,
    pub quota_backoff: Duration,
    pub kill_grace: Duration,
    pub kill_deadline: Duration,
    pub output_tail_lines: usize,
    pub auto_rollback: bool,
}

impl SupervisorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            command: cfg.agents.command.clone(),
            prompt_flag: cfg.agents.prompt_flag.clone(),
            args: cfg.agents.args.clone(),
            task_timeout: Duration::from_secs(cfg.guardrails.task_timeout_minutes * 60),
            quota_backoff: Duration::from_secs(cfg.agents.quota_backoff_secs),
            kill_grace: Duration::from_secs(cfg.agents.kill_grace_secs),
            kill_deadline: Duration::from_secs(cfg.agents.kill_deadline_secs),
            output_tail_lines: cfg.agents.output_tail_lines,
            auto_rollback: cfg.guardrails.auto_rollback_on_failure,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// How an agent run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    Completed,
    /// Stopped by `kill` or `kill_all`.
    Killed,
    Guardrail(GuardrailViolation),
    Failed {
        classification: Classification,
        reason: String,
    },
    TimedOut {
        after: Duration,
    },
    /// Rate-limit waits used up the retry budget.
    QuotaExhausted {
        attempts: u32,
    },
    /// The process could not be prepared or started.
    LaunchFailed(String),
}

impl ExitOutcome {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ExitOutcome::Completed => None,
            ExitOutcome::Guardrail(_) => Some(FailureKind::Guardrail),
            ExitOutcome::Failed { classification, .. } => Some(classification.failure_kind()),
            ExitOutcome::QuotaExhausted { .. } => Some(FailureKind::Transient),
            ExitOutcome::Killed | ExitOutcome::TimedOut { .. } | ExitOutcome::LaunchFailed(_) => {
                Some(FailureKind::Permanent)
            }
        }
    }

    /// Human-readable reason recorded on the task and agent.
    pub fn reason(&self) -> Option<String> {
        match self {
            ExitOutcome::Completed => None,
            ExitOutcome::Killed => Some("killed by operator".into()),
            ExitOutcome::Guardrail(v) => Some(v.to_string()),
            ExitOutcome::Failed { reason, .. } => Some(reason.clone()),
            ExitOutcome::TimedOut { after } => {
                Some(format!("timed out after {} minutes", after.as_secs() / 60))
            }
            ExitOutcome::QuotaExhausted { attempts } => Some(format!(
                "rate limited, gave up after {attempts} backoff retries"
            )),
            ExitOutcome::LaunchFailed(reason) => Some(format!("launch failed: {reason}")),
        }
    }

    fn wants_rollback(&self, auto_rollback: bool) -> bool {
        match self {
            ExitOutcome::Completed => false,
            ExitOutcome::Killed | ExitOutcome::Guardrail(_) => true,
            ExitOutcome::Failed {
                classification: Classification::Guardrail,
                ..
            } => true,
            _ => auto_rollback,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentExit {
    /// Final agent record, already in a terminal status.
    pub agent: Agent,
    pub outcome: ExitOutcome,
    pub rolled_back: bool,
    pub tail: Vec<String>,
}

/// Messages from monitored agents to the coordinator. The supervisor never
/// touches scheduling state itself.
#[derive(Debug, Clone)]
pub enum SupervisorReport {
    Snapshot {
        agent_id: Uuid,
        workspace: String,
        snapshot: Snapshot,
    },
    /// Status, pid or request count changed.
    AgentUpdated(Agent),
    QuotaWait {
        agent_id: Uuid,
        task_id: TaskId,
        attempt: u32,
        retry_after: DateTime<Utc>,
    },
    Finished(AgentExit),
    /// A kill was requested `kill_deadline` ago. If the agent has not
    /// finished yet, the coordinator finalizes it anyway.
    DeadlineExpired { agent_id: Uuid },
}

// ---------------------------------------------------------------------------
// AgentSupervisor
// ---------------------------------------------------------------------------

struct LiveAgent {
    task_id: TaskId,
    workspace: String,
    kill_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs each admitted task's agent process as an independently monitored,
/// cancellable tokio task.
pub struct AgentSupervisor {
    spawner: Arc<dyn ProcessSpawner>,
    git: Arc<WorkspaceGit>,
    gate: Arc<GuardrailGate>,
    quota: Arc<QuotaLedger>,
    classifier: Arc<dyn FailureClassifier>,
    settings: SupervisorSettings,
    bus: EventBus,
    reports: flume::Sender<SupervisorReport>,
    live: Arc<DashMap<Uuid, LiveAgent>>,
}

impl AgentSupervisor {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        git: Arc<WorkspaceGit>,
        gate: Arc<GuardrailGate>,
        quota: Arc<QuotaLedger>,
        settings: SupervisorSettings,
        bus: EventBus,
        reports: flume::Sender<SupervisorReport>,
    ) -> Self {
        Self {
            spawner,
            git,
            gate,
            quota,
            classifier: Arc::new(HeuristicClassifier::new()),
            settings,
            bus,
            reports,
            live: Arc::new(DashMap::new()),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Lease `workspace` for `task` and start monitoring a new agent on it.
    ///
    /// Fails before anything starts when the task targets a protected branch
    /// or the workspace is already leased.
    pub fn spawn(
        &self,
        task: &Task,
        workspace: &str,
        registry: &mut WorkspaceRegistry,
    ) -> Result<Agent> {
        self.gate.check_branch(&task.branch)?;

        let agent = Agent::new(task.id, workspace);
        let path = registry.acquire(workspace, task.id, agent.id)?.path.clone();

        let (kill_tx, kill_rx) = watch::channel(false);
        let monitor = Monitor {
            agent: agent.clone(),
            task: task.clone(),
            path,
            sm: AgentStateMachine::new(),
            tail: VecDeque::with_capacity(self.settings.output_tail_lines),
            kill_rx,
            spawner: self.spawner.clone(),
            git: self.git.clone(),
            gate: self.gate.clone(),
            quota: self.quota.clone(),
            classifier: self.classifier.clone(),
            settings: self.settings.clone(),
            bus: self.bus.clone(),
            reports: self.reports.clone(),
        };
        let handle = tokio::spawn(monitor.run());
        self.live.insert(
            agent.id,
            LiveAgent {
                task_id: task.id,
                workspace: workspace.to_string(),
                kill_tx,
                handle,
            },
        );
        info!(
            agent_id = %agent.id,
            task_id = task.id,
            workspace,
            "agent spawned"
        );
        Ok(agent)
    }

    /// Request termination. Idempotent: returns `false` when the agent is not
    /// live, and repeated calls do not restart the deadline.
    pub fn kill(&self, agent_id: Uuid) -> bool {
        let Some(live) = self.live.get(&agent_id) else {
            return false;
        };
        if *live.kill_tx.borrow() {
            return true;
        }
        let _ = live.kill_tx.send(true);
        info!(agent_id = %agent_id, task_id = live.task_id, "kill requested");
        drop(live);

        let reports = self.reports.clone();
        let deadline = self.settings.kill_deadline;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = reports.send(SupervisorReport::DeadlineExpired { agent_id });
        });
        true
    }

    /// Emergency stop. Never waits on a process; each agent gets its own
    /// deadline after which it is finalized regardless.
    pub fn kill_all(&self) -> usize {
        let ids: Vec<Uuid> = self.live.iter().map(|e| *e.key()).collect();
        let count = ids.iter().filter(|id| self.kill(**id)).count();
        warn!(count, "kill_all issued");
        count
    }

    /// Drop bookkeeping for an agent whose `Finished` report was received.
    /// Returns `false` for late reports about agents already finalized.
    pub fn finish(&self, agent_id: Uuid) -> bool {
        self.live.remove(&agent_id).is_some()
    }

    /// Abort a monitor that missed its kill deadline. Dropping the process
    /// handle kills the child.
    pub fn force_release(&self, agent_id: Uuid) -> Option<(TaskId, String)> {
        let (_, live) = self.live.remove(&agent_id)?;
        live.handle.abort();
        warn!(
            agent_id = %agent_id,
            task_id = live.task_id,
            workspace = %live.workspace,
            "agent missed kill deadline, force released"
        );
        Some((live.task_id, live.workspace))
    }

    pub fn is_live(&self, agent_id: Uuid) -> bool {
        self.live.contains_key(&agent_id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Live agent bound to `task_id`, if any.
    pub fn agent_for_task(&self, task_id: TaskId) -> Option<Uuid> {
        self.live
            .iter()
            .find(|e| e.task_id == task_id)
            .map(|e| *e.key())
    }

    /// Restore a workspace to `snapshot`, bounded by the kill deadline.
    pub async fn restore_workspace(&self, path: PathBuf, snapshot: Snapshot) -> Result<()> {
        restore(self.git.clone(), path, snapshot, self.settings.kill_deadline).await
    }
}

async fn with_git<T, F>(git: Arc<WorkspaceGit>, path: PathBuf, f: F) -> Result<T>
where
    F: FnOnce(&WorkspaceGit, &Path) -> std::result::Result<T, GitError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&git, &path)).await {
        Ok(res) => res.map_err(|e| SupervisorError::Git(e.to_string())),
        Err(e) => Err(SupervisorError::Git(format!("git task failed: {e}"))),
    }
}

async fn restore(
    git: Arc<WorkspaceGit>,
    path: PathBuf,
    snapshot: Snapshot,
    limit: Duration,
) -> Result<()> {
    let fut = with_git(git, path, move |git, dir| git.restore(dir, &snapshot));
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(SupervisorError::Git(format!(
            "restore did not finish within {}s",
            limit.as_secs()
        ))),
    }
}

/// Resolves once a kill has been requested. Pends forever if the sender is
/// gone, which only happens after the agent was finalized.
async fn kill_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let requested = *rx.borrow_and_update();
        if requested {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor: one per agent
// ---------------------------------------------------------------------------

enum Next {
    Kill,
    Timeout,
    Line(Option<String>),
}

enum StreamEnd {
    Eof,
    Killed,
    TimedOut,
    Violation(GuardrailViolation),
}

enum Waited {
    Exited(Option<i32>),
    Killed,
    TimedOut,
}

struct Monitor {
    agent: Agent,
    task: Task,
    path: PathBuf,
    sm: AgentStateMachine,
    tail: VecDeque<String>,
    kill_rx: watch::Receiver<bool>,
    spawner: Arc<dyn ProcessSpawner>,
    git: Arc<WorkspaceGit>,
    gate: Arc<GuardrailGate>,
    quota: Arc<QuotaLedger>,
    classifier: Arc<dyn FailureClassifier>,
    settings: SupervisorSettings,
    bus: EventBus,
    reports: flume::Sender<SupervisorReport>,
}

impl Monitor {
    async fn run(mut self) {
        let (outcome, snapshot) = self.execute().await;

        let rolled_back = match (&snapshot, outcome.wants_rollback(self.settings.auto_rollback)) {
            (Some(snap), true) => self.rollback(snap.clone()).await,
            _ => false,
        };
        self.finalize(outcome, rolled_back);
    }

    async fn execute(&mut self) -> (ExitOutcome, Option<Snapshot>) {
        let snapshot = match with_git(self.git.clone(), self.path.clone(), |git, dir| {
            git.snapshot(dir)
        })
        .await
        {
            Ok(snap) => snap,
            Err(e) => return (ExitOutcome::LaunchFailed(e.to_string()), None),
        };
        self.report(SupervisorReport::Snapshot {
            agent_id: self.agent.id,
            workspace: self.agent.workspace.clone(),
            snapshot: snapshot.clone(),
        });

        if !self.task.branch.is_empty() {
            let branch = self.task.branch.clone();
            if let Err(e) =
                with_git(self.git.clone(), self.path.clone(), move |git, dir| {
                    git.checkout(dir, &branch)
                })
                .await
            {
                return (ExitOutcome::LaunchFailed(e.to_string()), Some(snapshot));
            }
        }

        let outcome = self.drive(&snapshot).await;
        (outcome, Some(snapshot))
    }

    /// Launch, stream, and relaunch after rate-limit backoffs.
    async fn drive(&mut self, snapshot: &Snapshot) -> ExitOutcome {
        let prompt = format!(
            "{}{}",
            self.gate.preamble(&self.path, self.task.id),
            self.task.prompt_body()
        );
        let deadline = Instant::now() + self.settings.task_timeout;
        let budget = self.task.max_retries.saturating_sub(self.task.retry_count);
        let mut attempts = 0u32;

        loop {
            let requested = *self.kill_rx.borrow();
            if requested {
                return ExitOutcome::Killed;
            }
            let spec = self.launch_spec(&prompt);
            let SpawnedProcess {
                pid,
                lines,
                mut control,
            } = match self.spawner.spawn(&spec).await {
                Ok(p) => p,
                Err(e) => return ExitOutcome::LaunchFailed(e.to_string()),
            };
            self.agent.pid = pid;
            self.transition(AgentEvent::Launched);

            match self.stream(&lines, deadline).await {
                StreamEnd::Violation(v) => {
                    self.stop(control.as_mut()).await;
                    return ExitOutcome::Guardrail(v);
                }
                StreamEnd::Killed => {
                    self.stop(control.as_mut()).await;
                    return ExitOutcome::Killed;
                }
                StreamEnd::TimedOut => {
                    self.stop(control.as_mut()).await;
                    return self.timed_out();
                }
                StreamEnd::Eof => {}
            }

            let waited = tokio::select! {
                code = control.wait() => Waited::Exited(code),
                _ = kill_requested(&mut self.kill_rx) => Waited::Killed,
                _ = tokio::time::sleep_until(deadline) => Waited::TimedOut,
            };
            let code = match waited {
                Waited::Exited(code) => code,
                Waited::Killed => {
                    self.stop(control.as_mut()).await;
                    return ExitOutcome::Killed;
                }
                Waited::TimedOut => {
                    self.stop(control.as_mut()).await;
                    return self.timed_out();
                }
            };
            self.agent.exit_code = code;

            if code == Some(0) {
                return self.check_diff(snapshot).await;
            }

            let tail: Vec<String> = self.tail.iter().cloned().collect();
            let classification = self.classifier.classify(&RunOutcome {
                exit_code: code,
                tail: &tail,
            });
            if classification != Classification::RateLimited {
                let code_text = code.map_or_else(|| "none".to_string(), |c| c.to_string());
                return ExitOutcome::Failed {
                    classification,
                    reason: format!("{classification} (exit code {code_text})"),
                };
            }
            if attempts >= budget {
                return ExitOutcome::QuotaExhausted { attempts };
            }
            attempts += 1;
            if !self.backoff(attempts).await {
                return ExitOutcome::Killed;
            }
        }
    }

    fn launch_spec(&self, prompt: &str) -> LaunchSpec {
        let mut args = vec![self.settings.prompt_flag.clone(), prompt.to_string()];
        args.extend(self.settings.args.iter().cloned());
        LaunchSpec {
            program: self.settings.command.clone(),
            args,
            cwd: self.path.clone(),
            env: vec![("CONDUCTOR_TASK_ID".into(), self.task.id.to_string())],
        }
    }

    async fn stream(&mut self, lines: &flume::Receiver<String>, deadline: Instant) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = kill_requested(&mut self.kill_rx) => Next::Kill,
                _ = tokio::time::sleep_until(deadline) => Next::Timeout,
                line = lines.recv_async() => Next::Line(line.ok()),
            };
            match next {
                Next::Kill => return StreamEnd::Killed,
                Next::Timeout => return StreamEnd::TimedOut,
                Next::Line(None) => return StreamEnd::Eof,
                Next::Line(Some(line)) => {
                    if let Err(v) = self.on_line(line) {
                        return StreamEnd::Violation(v);
                    }
                }
            }
        }
    }

    fn on_line(&mut self, line: String) -> std::result::Result<(), GuardrailViolation> {
        if self.tail.len() >= self.settings.output_tail_lines.max(1) {
            self.tail.pop_front();
        }
        self.tail.push_back(line.clone());
        self.bus.publish(StateChange::AgentOutput {
            agent_id: self.agent.id,
            task_id: self.task.id,
            line: line.clone(),
        });

        self.gate.scan_line(&line, &self.path)?;

        if is_tool_use(&line) {
            self.quota.record_agent_requests(1);
            self.agent.request_count += 1;
            self.report(SupervisorReport::AgentUpdated(self.agent.clone()));
        }
        Ok(())
    }

    /// SIGTERM, then SIGKILL after the grace period. Both waits are bounded.
    async fn stop(&mut self, control: &mut dyn ProcessControl) {
        if let Err(e) = control.terminate() {
            warn!(agent_id = %self.agent.id, error = %e, "terminate failed");
        }
        let grace = self.settings.kill_grace;
        if let Ok(code) = tokio::time::timeout(grace, control.wait()).await {
            self.agent.exit_code = code;
            return;
        }
        warn!(agent_id = %self.agent.id, "agent ignored SIGTERM, killing");
        if let Err(e) = control.kill() {
            warn!(agent_id = %self.agent.id, error = %e, "kill failed");
        }
        if let Ok(code) = tokio::time::timeout(grace, control.wait()).await {
            self.agent.exit_code = code;
        }
    }

    /// Wait out a rate-limit backoff. Returns `false` if killed meanwhile.
    async fn backoff(&mut self, attempt: u32) -> bool {
        self.transition(AgentEvent::Pause);
        let retry_after = Utc::now()
            + chrono::Duration::from_std(self.settings.quota_backoff)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        warn!(
            agent_id = %self.agent.id,
            task_id = self.task.id,
            attempt,
            backoff_secs = self.settings.quota_backoff.as_secs(),
            "agent rate limited, backing off"
        );
        self.report(SupervisorReport::QuotaWait {
            agent_id: self.agent.id,
            task_id: self.task.id,
            attempt,
            retry_after,
        });

        let backoff = self.settings.quota_backoff;
        let killed = tokio::select! {
            _ = tokio::time::sleep(backoff) => false,
            _ = kill_requested(&mut self.kill_rx) => true,
        };
        if killed {
            return false;
        }
        self.transition(AgentEvent::Resume);
        true
    }

    async fn check_diff(&mut self, snapshot: &Snapshot) -> ExitOutcome {
        let head = snapshot.head.clone();
        match with_git(self.git.clone(), self.path.clone(), move |git, dir| {
            git.diff_stats(dir, &head)
        })
        .await
        {
            Ok(stats) => match self.gate.check_diff(&stats) {
                Ok(()) => ExitOutcome::Completed,
                Err(v) => ExitOutcome::Guardrail(v),
            },
            Err(e) => {
                warn!(agent_id = %self.agent.id, error = %e, "diff stats unavailable, skipping diff limits");
                ExitOutcome::Completed
            }
        }
    }

    fn timed_out(&self) -> ExitOutcome {
        warn!(
            agent_id = %self.agent.id,
            task_id = self.task.id,
            timeout_secs = self.settings.task_timeout.as_secs(),
            "agent timed out"
        );
        ExitOutcome::TimedOut {
            after: self.settings.task_timeout,
        }
    }

    async fn rollback(&self, snapshot: Snapshot) -> bool {
        match restore(
            self.git.clone(),
            self.path.clone(),
            snapshot,
            self.settings.kill_deadline,
        )
        .await
        {
            Ok(()) => {
                info!(agent_id = %self.agent.id, workspace = %self.agent.workspace, "workspace rolled back");
                true
            }
            Err(e) => {
                error!(
                    agent_id = %self.agent.id,
                    workspace = %self.agent.workspace,
                    error = %e,
                    "rollback failed"
                );
                false
            }
        }
    }

    fn transition(&mut self, event: AgentEvent) {
        match self.sm.transition(event) {
            Ok(status) => {
                self.agent.status = status;
                self.bus.publish(StateChange::AgentStatus(self.agent.clone()));
                self.report(SupervisorReport::AgentUpdated(self.agent.clone()));
            }
            Err(e) => warn!(agent_id = %self.agent.id, error = %e, "ignored agent transition"),
        }
    }

    fn finalize(mut self, outcome: ExitOutcome, rolled_back: bool) {
        let (event, status) = match &outcome {
            ExitOutcome::Completed => (AgentEvent::Complete, AgentStatus::Completed),
            ExitOutcome::Killed => (AgentEvent::Kill, AgentStatus::Killed),
            _ => (AgentEvent::Fail, AgentStatus::Failed),
        };
        if let Err(e) = self.sm.transition(event) {
            warn!(agent_id = %self.agent.id, error = %e, "forcing terminal status");
        }
        self.agent.status = status;
        self.agent.reason = outcome.reason();
        self.agent.completed_at = Some(Utc::now());
        self.bus.publish(StateChange::AgentStatus(self.agent.clone()));

        info!(
            agent_id = %self.agent.id,
            task_id = self.task.id,
            status = %status,
            rolled_back,
            requests = self.agent.request_count,
            "agent finished"
        );
        let exit = AgentExit {
            agent: self.agent.clone(),
            outcome,
            rolled_back,
            tail: self.tail.drain(..).collect(),
        };
        self.report(SupervisorReport::Finished(exit));
    }

    fn report(&self, report: SupervisorReport) {
        if self.reports.send(report).is_err() {
            warn!(agent_id = %self.agent.id, "coordinator gone, dropping report");
        }
    }
}

fn is_tool_use(line: &str) -> bool {
    let line = line.trim();
    if !line.starts_with('{') {
        return false;
    }
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "tool_use"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_use_detection() {
        assert!(is_tool_use(r#"{"type":"tool_use","tool_name":"read_file"}"#));
        assert!(!is_tool_use(r#"{"type":"message","content":"tool_use"}"#));
        assert!(!is_tool_use("tool_use"));
    }

    #[test]
    fn guardrail_outcomes_always_roll_back() {
        let v = ExitOutcome::Killed;
        assert!(v.wants_rollback(false));
        assert!(!ExitOutcome::Completed.wants_rollback(true));
        assert!(ExitOutcome::LaunchFailed("x".into()).wants_rollback(true));
        assert!(!ExitOutcome::TimedOut {
            after: Duration::from_secs(60)
        }
        .wants_rollback(false));
    }

    #[test]
    fn outcome_reasons() {
        assert_eq!(
            ExitOutcome::TimedOut {
                after: Duration::from_secs(1800)
            }
            .reason()
            .as_deref(),
            Some("timed out after 30 minutes")
        );
        assert_eq!(ExitOutcome::Completed.failure_kind(), None);
        assert_eq!(
            ExitOutcome::QuotaExhausted { attempts: 2 }.failure_kind(),
            Some(FailureKind::Transient)
        );
    }
}
