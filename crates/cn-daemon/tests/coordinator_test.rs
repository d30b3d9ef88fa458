use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cn_agents::process::{LaunchSpec, ProcessControl, ProcessError, ProcessSpawner, SpawnedProcess};
use cn_agents::supervisor::{AgentSupervisor, SupervisorSettings};
use cn_bridge::commands::{
    command_channel, CancelOutcome, CommandError, CoordinatorHandle, NewLifecycle, StateSnapshot,
};
use cn_bridge::event_bus::EventBus;
use cn_core::config::{Config, QuotaConfig};
use cn_core::error::FailureKind;
use cn_core::git::{GitOutput, GitRunner, WorkspaceGit};
use cn_core::store::Store;
use cn_core::types::{
    Agent, AgentStatus, EventKind, ExternalEvent, NewTask, Payload, PrStage, Priority, Task,
    TaskKind, TaskStatus, Workspace, WorkspaceStatus,
};
use cn_core::workspace::WorkspaceRegistry;
use cn_daemon::coordinator::{Coordinator, CoordinatorParts};
use cn_daemon::rules::RulesEngine;
use cn_harness::guardrails::GuardrailGate;
use cn_harness::quota::QuotaLedger;
use cn_harness::shutdown::ShutdownSignal;
use tokio::sync::Notify;

// ===========================================================================
// Scripted agent process
// ===========================================================================

#[derive(Clone, Default)]
struct Script {
    lines: Vec<String>,
    code: Option<i32>,
    hang: bool,
    /// Ignores both SIGTERM and SIGKILL.
    stubborn: bool,
}

impl Script {
    fn exits(code: i32) -> Self {
        Self {
            code: Some(code),
            ..Default::default()
        }
    }

    fn hangs() -> Self {
        Self {
            code: Some(143),
            hang: true,
            ..Default::default()
        }
    }

    fn stubborn() -> Self {
        Self {
            stubborn: true,
            ..Self::hangs()
        }
    }

    fn printing(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|l| l.to_string()).collect();
        self
    }
}

struct FakeControl {
    code: Option<i32>,
    hold: Option<flume::Sender<String>>,
    done: Arc<Notify>,
    stubborn: bool,
}

#[async_trait]
impl ProcessControl for FakeControl {
    fn terminate(&mut self) -> Result<(), ProcessError> {
        if self.stubborn {
            return Ok(());
        }
        self.hold = None;
        self.done.notify_one();
        Ok(())
    }

    fn kill(&mut self) -> Result<(), ProcessError> {
        if self.stubborn {
            return Ok(());
        }
        self.code = None;
        self.hold = None;
        self.done.notify_one();
        Ok(())
    }

    async fn wait(&mut self) -> Option<i32> {
        if self.hold.is_some() {
            self.done.notified().await;
        }
        self.code
    }
}

#[derive(Default)]
struct ScriptedSpawner {
    scripts: Mutex<VecDeque<Script>>,
    launches: Mutex<usize>,
}

impl ScriptedSpawner {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    fn launches(&self) -> usize {
        *self.launches.lock().unwrap()
    }
}

#[async_trait]
impl ProcessSpawner for ScriptedSpawner {
    async fn spawn(&self, _spec: &LaunchSpec) -> Result<SpawnedProcess, ProcessError> {
        *self.launches.lock().unwrap() += 1;
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::exits(0));
        let (tx, rx) = flume::unbounded();
        for line in &script.lines {
            tx.send(line.clone()).unwrap();
        }
        let hold = if script.hang { Some(tx) } else { None };
        Ok(SpawnedProcess {
            pid: Some(4242),
            lines: rx,
            control: Box::new(FakeControl {
                code: script.code,
                hold,
                done: Arc::new(Notify::new()),
                stubborn: script.stubborn,
            }),
        })
    }
}

/// Clean working copies; records every git invocation.
#[derive(Clone, Default)]
struct QuietGit {
    calls: Arc<Mutex<Vec<String>>>,
}

impl QuietGit {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl GitRunner for QuietGit {
    fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        let joined = args.join(" ");
        self.calls.lock().unwrap().push(joined.clone());
        let stdout = if joined == "rev-parse HEAD" {
            "abc1234def\n".to_string()
        } else if joined.starts_with("stash push") {
            "No local changes to save\n".to_string()
        } else {
            String::new()
        };
        Ok(GitOutput {
            success: true,
            stdout,
            stderr: String::new(),
        })
    }
}

// ===========================================================================
// Harness
// ===========================================================================

const CI_RULE: &str = r#"
[[rules]]
name = "lint"
trigger = { type = "ci_status", field = "check_name", pattern = "lint" }
action = { template = "Fix {check_name} on PR #{pr_number}" }
"#;

struct Harness {
    handle: CoordinatorHandle,
    store: Arc<Store>,
    spawner: Arc<ScriptedSpawner>,
    git: QuietGit,
    shutdown: ShutdownSignal,
}

fn config(max_concurrent: u32) -> Config {
    let mut config = Config::default();
    config.daemon.tick_interval_ms = 20;
    config.quota = QuotaConfig {
        max_concurrent,
        ..QuotaConfig::default()
    };
    config
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        command: "agent".into(),
        prompt_flag: "-p".into(),
        args: Vec::new(),
        task_timeout: Duration::from_secs(10),
        quota_backoff: Duration::from_millis(10),
        kill_grace: Duration::from_millis(50),
        kill_deadline: Duration::from_millis(300),
        output_tail_lines: 20,
        auto_rollback: false,
    }
}

fn registry() -> WorkspaceRegistry {
    let mut registry = WorkspaceRegistry::new();
    registry.register(Workspace::new("conductor-1", "/tmp/conductor-1"));
    registry.register(Workspace::new("conductor-2", "/tmp/conductor-2"));
    registry
}

fn coordinator(
    store: Arc<Store>,
    spawner: Arc<ScriptedSpawner>,
    git: QuietGit,
    config: &Config,
    rules: RulesEngine,
) -> (Coordinator, CoordinatorHandle) {
    let quota = Arc::new(QuotaLedger::new(config.quota.clone()));
    let gate = Arc::new(GuardrailGate::new(&config.guardrails).unwrap());
    let bus = EventBus::new();
    let (reports_tx, reports) = flume::unbounded();
    let supervisor = Arc::new(AgentSupervisor::new(
        spawner,
        Arc::new(WorkspaceGit::with_git_runner(Box::new(git))),
        gate.clone(),
        quota.clone(),
        settings(),
        bus.clone(),
        reports_tx,
    ));
    let (handle, commands) = command_channel();
    let coordinator = Coordinator::new(
        CoordinatorParts {
            store,
            registry: registry(),
            quota,
            gate,
            supervisor,
            reports,
            commands,
            rules,
            scm: None,
            bus,
        },
        config,
    );
    (coordinator, handle)
}

async fn start(scripts: Vec<Script>, max_concurrent: u32, rules: &str) -> Harness {
    let store = Arc::new(Store::new_in_memory().await.unwrap());
    let spawner = ScriptedSpawner::new(scripts);
    let rules = RulesEngine::from_toml(rules).unwrap();
    let git = QuietGit::default();
    let (mut coordinator, handle) = coordinator(
        store.clone(),
        spawner.clone(),
        git.clone(),
        &config(max_concurrent),
        rules,
    );
    coordinator.recover().await.unwrap();
    let shutdown = ShutdownSignal::new();
    tokio::spawn(coordinator.run(shutdown.clone()));
    Harness {
        handle,
        store,
        spawner,
        git,
        shutdown,
    }
}

async fn wait_for(handle: &CoordinatorHandle, pred: impl Fn(&StateSnapshot) -> bool) -> StateSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = handle.snapshot().await.unwrap();
        if pred(&state) {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached; tasks: {:?}",
            state.tasks.iter().map(|t| (t.id, t.status)).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn task(state: &StateSnapshot, id: u64) -> &Task {
    state.tasks.iter().find(|t| t.id == id).unwrap()
}

fn ci_failure(pr: u64, check: &str) -> ExternalEvent {
    ExternalEvent::new(
        format!("ci:{pr}:{check}:failure:2026-03-01T10:00:00Z"),
        EventKind::CiStatus,
        Payload::new()
            .with("pr_number", pr)
            .with("check_name", check)
            .with("conclusion", "failure"),
    )
}

// ===========================================================================
// Tasks
// ===========================================================================

#[tokio::test]
async fn task_runs_to_done_and_frees_workspace() {
    let h = start(vec![Script::exits(0)], 2, "").await;
    let created = h.handle.create_task(NewTask::new("Add retry to fetch")).await.unwrap();
    assert_eq!(created.status, TaskStatus::Ready);

    let state = wait_for(&h.handle, |s| task(s, created.id).status == TaskStatus::Done).await;
    assert!(state.workspaces.iter().all(|w| w.is_free()));
    assert_eq!(state.agents.len(), 1);
    assert_eq!(state.agents[0].status, AgentStatus::Completed);

    let stored = h.store.get_task(created.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Done);
    h.shutdown.trigger();
}

#[tokio::test]
async fn concurrency_ceiling_holds_tasks_in_ready() {
    let h = start(vec![Script::hangs(), Script::hangs()], 1, "").await;
    let a = h.handle.create_task(NewTask::new("a").with_priority(Priority::High)).await.unwrap();
    let b = h.handle.create_task(NewTask::new("b")).await.unwrap();

    wait_for(&h.handle, |s| task(s, a.id).status == TaskStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let state = h.handle.snapshot().await.unwrap();
    assert_eq!(task(&state, b.id).status, TaskStatus::Ready);
    assert_eq!(h.spawner.launches(), 1);

    h.handle.kill_all().await.unwrap();
    wait_for(&h.handle, |s| task(s, b.id).status == TaskStatus::Running).await;
    h.shutdown.trigger();
}

#[tokio::test]
async fn cancelling_running_task_kills_agent() {
    let h = start(vec![Script::hangs()], 2, "").await;
    let t = h.handle.create_task(NewTask::new("long job")).await.unwrap();
    wait_for(&h.handle, |s| task(s, t.id).status == TaskStatus::Running).await;

    match h.handle.cancel_task(t.id).await.unwrap() {
        CancelOutcome::Killing { .. } => {}
        other => panic!("expected Killing, got {other:?}"),
    }
    let state = wait_for(&h.handle, |s| task(s, t.id).status == TaskStatus::Cancelled).await;
    assert!(state.workspaces.iter().all(|w| w.is_free()));
    assert_eq!(state.agents[0].status, AgentStatus::Killed);

    // Terminal now, so it can be deleted.
    h.handle.delete_task(t.id).await.unwrap();
    assert!(h.store.get_task(t.id).await.unwrap().is_none());
    h.shutdown.trigger();
}

#[tokio::test]
async fn cancel_frees_workspace_when_process_ignores_signals() {
    let h = start(vec![Script::stubborn()], 2, "").await;
    let t = h.handle.create_task(NewTask::new("wedged job")).await.unwrap();
    wait_for(&h.handle, |s| task(s, t.id).status == TaskStatus::Running).await;

    h.handle.cancel_task(t.id).await.unwrap();
    let state = wait_for(&h.handle, |s| {
        task(s, t.id).status == TaskStatus::Cancelled && s.workspaces.iter().all(|w| w.is_free())
    })
    .await;
    assert_eq!(state.agents[0].status, AgentStatus::Killed);
    assert_eq!(state.quota.concurrent_agents, 0);
    h.shutdown.trigger();
}

#[tokio::test]
async fn destructive_output_fails_task_and_restores_workspace() {
    let h = start(vec![Script::hangs().printing(&["working...", "$ rm -rf /"])], 2, "").await;
    let t = h.handle.create_task(NewTask::new("tidy build dir")).await.unwrap();

    let state = wait_for(&h.handle, |s| {
        task(s, t.id).status == TaskStatus::Failed
            && s.workspaces.iter().all(|w| w.is_free())
            && s.agents.iter().all(|a| a.status.is_terminal())
    })
    .await;
    let failure = task(&state, t.id).failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::Guardrail);
    assert!(
        failure.reason.starts_with("guardrail recursive_delete_root"),
        "{}",
        failure.reason
    );
    assert_eq!(state.agents[0].status, AgentStatus::Failed);
    assert_eq!(state.agents[0].reason.as_deref(), Some(failure.reason.as_str()));
    assert!(h.git.calls().iter().any(|c| c == "reset --hard abc1234def"));

    // Never retried.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.spawner.launches(), 1);
    let stored = h.store.get_task(t.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    h.shutdown.trigger();
}

#[tokio::test]
async fn deleting_live_task_is_refused() {
    let h = start(vec![Script::hangs()], 2, "").await;
    let t = h.handle.create_task(NewTask::new("job")).await.unwrap();
    let err = h.handle.delete_task(t.id).await.unwrap_err();
    assert!(matches!(err, CommandError::Precondition(_)));
    assert!(h.store.get_task(t.id).await.unwrap().is_some());
    h.shutdown.trigger();
}

#[tokio::test]
async fn protected_branch_task_fails_without_agent() {
    let h = start(Vec::new(), 2, "").await;
    let t = h
        .handle
        .create_task(NewTask::new("hotfix").with_branch("main"))
        .await
        .unwrap();
    let state = wait_for(&h.handle, |s| task(s, t.id).status == TaskStatus::Failed).await;
    let failure = task(&state, t.id).failure.clone().unwrap();
    assert!(failure.reason.contains("protected"));
    assert_eq!(h.spawner.launches(), 0);
    assert!(state.workspaces.iter().all(|w| w.is_free()));
    assert_eq!(state.quota.agent_requests_used, 0);
    assert_eq!(state.quota.concurrent_agents, 0);
    h.shutdown.trigger();
}

// ===========================================================================
// Events
// ===========================================================================

#[tokio::test]
async fn duplicate_event_creates_one_task() {
    let h = start(vec![Script::hangs()], 2, CI_RULE).await;

    let first = h.handle.submit_event(ci_failure(12, "lint")).await.unwrap();
    assert!(!first.duplicate);
    assert_eq!(first.tasks_created.len(), 1);

    let second = h.handle.submit_event(ci_failure(12, "lint")).await.unwrap();
    assert!(second.duplicate);
    assert!(second.tasks_created.is_empty());

    let state = h.handle.snapshot().await.unwrap();
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].title, "Fix lint on PR #12");
    assert_eq!(state.tasks[0].kind, TaskKind::Rule);
    h.shutdown.trigger();
}

#[tokio::test]
async fn ci_failure_on_tracked_pr_injects_fix_task() {
    let h = start(vec![Script::hangs()], 2, "").await;
    let prl = h
        .handle
        .create_lifecycle(NewLifecycle {
            title: "Search".into(),
            branch: "feat/search".into(),
            plan: String::new(),
            pr_number: Some(31),
        })
        .await
        .unwrap();
    assert_eq!(prl.stage, PrStage::CiMonitoring);

    let receipt = h.handle.submit_event(ci_failure(31, "unit")).await.unwrap();
    assert_eq!(receipt.lifecycles_changed, vec![prl.id]);

    let state = wait_for(&h.handle, |s| {
        s.tasks.iter().any(|t| t.lifecycle_id == Some(prl.id))
    })
    .await;
    let fix = state.tasks.iter().find(|t| t.lifecycle_id == Some(prl.id)).unwrap();
    assert_eq!(fix.kind, TaskKind::CiFix);
    assert_eq!(fix.branch, "feat/search");
    assert_eq!(fix.priority, Priority::High);

    let state = wait_for(&h.handle, |s| {
        s.lifecycles[0].open_tasks.contains(&fix.id)
    })
    .await;
    assert_eq!(state.lifecycles[0].stage, PrStage::CiFixing);
    assert_eq!(state.lifecycles[0].ci_fix_count, 1);
    h.shutdown.trigger();
}

#[tokio::test]
async fn lifecycle_on_protected_branch_is_invalid() {
    let h = start(Vec::new(), 2, "").await;
    let err = h
        .handle
        .create_lifecycle(NewLifecycle {
            title: "Oops".into(),
            branch: "release/1.2".into(),
            ..NewLifecycle::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Invalid(_)));
    h.shutdown.trigger();
}

#[tokio::test]
async fn resume_outside_needs_human_is_a_precondition() {
    let h = start(Vec::new(), 2, "").await;
    let prl = h
        .handle
        .create_lifecycle(NewLifecycle {
            title: "Draft".into(),
            branch: "feat/draft".into(),
            ..NewLifecycle::default()
        })
        .await
        .unwrap();
    let err = h.handle.resume_lifecycle(prl.id).await.unwrap_err();
    assert!(matches!(err, CommandError::Precondition(_)));
    h.shutdown.trigger();
}

// ===========================================================================
// Restart
// ===========================================================================

#[tokio::test]
async fn restart_requeues_running_tasks_and_frees_leases() {
    let store = Arc::new(Store::new_in_memory().await.unwrap());

    let mut t = Task::new(store.next_id("task").await.unwrap(), "interrupted", Priority::Normal);
    t.status = TaskStatus::Running;
    t.workspace = Some("conductor-1".into());
    store.insert_task(&t).await.unwrap();

    let mut agent = Agent::new(t.id, "conductor-1");
    agent.status = AgentStatus::Running;
    store.upsert_agent(&agent).await.unwrap();

    let mut ws = Workspace::new("conductor-1", "/tmp/conductor-1");
    ws.status = WorkspaceStatus::Assigned;
    ws.task_id = Some(t.id);
    ws.agent_id = Some(agent.id);
    store.upsert_workspace(&ws).await.unwrap();

    let (mut coordinator, _handle) = coordinator(
        store.clone(),
        ScriptedSpawner::new(Vec::new()),
        QuietGit::default(),
        &config(2),
        RulesEngine::default(),
    );
    coordinator.recover().await.unwrap();

    let stored = store.get_task(t.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Ready);
    assert_eq!(stored.workspace, None);

    let agents = store.list_agents().await.unwrap();
    assert_eq!(agents[0].status, AgentStatus::Killed);
    assert_eq!(agents[0].reason.as_deref(), Some("daemon restarted"));

    let workspaces = store.list_workspaces().await.unwrap();
    assert!(workspaces.iter().all(|w| w.is_free()));
}
