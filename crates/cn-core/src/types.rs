use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;

pub type TaskId = u64;
pub type LifecycleId = u64;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Task priority. Declaration order is significant: `Critical` sorts highest.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Ready,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Statuses from which a task may still be cancelled.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Ready | TaskStatus::Running
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Blocked)
                | (TaskStatus::Pending, TaskStatus::Ready)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Blocked, TaskStatus::Ready)
                | (TaskStatus::Blocked, TaskStatus::Failed)
                | (TaskStatus::Blocked, TaskStatus::Cancelled)
                | (TaskStatus::Ready, TaskStatus::Running)
                | (TaskStatus::Ready, TaskStatus::Failed)
                | (TaskStatus::Ready, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Done)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Ready)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Why a task that is not running is being held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    Dependency,
    QuotaExhausted,
    NoWorkspace,
}

/// What produced a task. Follow-up kinds are injected by the PR pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Feature,
    Precheck,
    CiFix,
    AddressComments,
    Rule,
}

/// Reason attached to a task that ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub branch: String,
    pub workspace: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
    pub block_reason: Option<BlockReason>,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub human_initiated: bool,
    pub lifecycle_id: Option<LifecycleId>,
    pub failure: Option<TaskFailure>,
    /// Set once cancellation of a running task has been requested.
    #[serde(default)]
    pub cancel_requested: bool,
    /// Earliest instant the task may be admitted again after a quota backoff.
    pub retry_after: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped on every persisted change.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, title: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            description: String::new(),
            priority,
            kind: TaskKind::Feature,
            branch: String::new(),
            workspace: None,
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            block_reason: None,
            retry_count: 0,
            max_retries: 2,
            human_initiated: false,
            lifecycle_id: None,
            failure: None,
            cancel_requested: false,
            retry_after: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// The text handed to the agent as its instructions.
    pub fn prompt_body(&self) -> &str {
        if self.description.trim().is_empty() {
            &self.title
        } else {
            &self.description
        }
    }
}

/// A request to create a task, as submitted by a human, a rule, or the PR pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub lifecycle_id: Option<LifecycleId>,
    #[serde(default)]
    pub human_initiated: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    pub fn depends_on(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on = ids.into_iter().collect();
        self
    }

    pub fn human(mut self) -> Self {
        self.human_initiated = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Starting,
    Running,
    /// Waiting out a rate-limit backoff before relaunching.
    Paused,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Killed
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Killed => "killed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub task_id: TaskId,
    pub workspace: String,
    pub status: AgentStatus,
    pub pid: Option<u32>,
    pub request_count: u64,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(task_id: TaskId, workspace: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            workspace: workspace.into(),
            status: AgentStatus::Starting,
            pid: None,
            request_count: 0,
            exit_code: None,
            reason: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Free,
    Assigned,
}

/// Point-in-time capture of a working copy used for rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Commit checked out when the snapshot was taken.
    pub head: String,
    /// Stash commit holding uncommitted changes, if there were any.
    pub stash: Option<String>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub is_dirty: bool,
    pub status: WorkspaceStatus,
    pub task_id: Option<TaskId>,
    pub agent_id: Option<Uuid>,
    pub snapshot: Option<Snapshot>,
}

impl Workspace {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            branch: String::new(),
            is_dirty: false,
            status: WorkspaceStatus::Free,
            task_id: None,
            agent_id: None,
            snapshot: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == WorkspaceStatus::Free
    }
}

// ---------------------------------------------------------------------------
// PR lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStage {
    Planning,
    Coding,
    Prechecks,
    PrCreated,
    CiMonitoring,
    CiFixing,
    GreptileReview,
    AddressingComments,
    ReadyForReview,
    NeedsHuman,
    Merged,
}

impl PrStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PrStage::Merged)
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// Resetting to `Planning` after a real failure is allowed from every
    /// non-terminal stage.
    pub fn can_transition_to(&self, target: PrStage) -> bool {
        use PrStage::*;
        if target == Planning {
            return !self.is_terminal() && *self != Planning;
        }
        if target == NeedsHuman {
            return !matches!(self, Merged | NeedsHuman | Planning);
        }
        matches!(
            (self, target),
            (Planning, Coding)
                | (Coding, Prechecks)
                | (Prechecks, PrCreated)
                | (Prechecks, CiMonitoring)
                | (PrCreated, CiMonitoring)
                | (CiMonitoring, CiFixing)
                | (CiMonitoring, GreptileReview)
                | (CiFixing, CiMonitoring)
                | (GreptileReview, CiFixing)
                | (GreptileReview, AddressingComments)
                | (GreptileReview, ReadyForReview)
                | (AddressingComments, GreptileReview)
                | (ReadyForReview, Merged)
                | (NeedsHuman, Merged)
        )
    }
}

impl fmt::Display for PrStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PrStage::Planning => "planning",
            PrStage::Coding => "coding",
            PrStage::Prechecks => "prechecks",
            PrStage::PrCreated => "pr_created",
            PrStage::CiMonitoring => "ci_monitoring",
            PrStage::CiFixing => "ci_fixing",
            PrStage::GreptileReview => "greptile_review",
            PrStage::AddressingComments => "addressing_comments",
            PrStage::ReadyForReview => "ready_for_review",
            PrStage::NeedsHuman => "needs_human",
            PrStage::Merged => "merged",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrLifecycle {
    pub id: LifecycleId,
    pub title: String,
    #[serde(default)]
    pub plan: String,
    pub branch: String,
    pub pr_number: Option<u64>,
    pub stage: PrStage,
    /// Review cycles started so far. Shared by the whole machine.
    pub iteration: u32,
    pub max_iterations: u32,
    pub ci_fix_count: u32,
    pub max_ci_fix_attempts: u32,
    pub greptile_comments_total: u32,
    pub greptile_comments_resolved: u32,
    /// Set once every CI check has reported success for the current head.
    #[serde(default)]
    pub ci_green: bool,
    /// Follow-up tasks injected for the current stage that have not finished.
    #[serde(default)]
    pub open_tasks: BTreeSet<TaskId>,
    /// Automated-review comments that arrived before the review stage.
    #[serde(default)]
    pub deferred_comments: Vec<String>,
    /// The automated reviewer approved the current head.
    #[serde(default)]
    pub review_clean: bool,
    /// Why automation is paused (reset to planning or escalated).
    pub reason: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PrLifecycle {
    pub fn new(
        id: LifecycleId,
        title: impl Into<String>,
        branch: impl Into<String>,
        max_iterations: u32,
        max_ci_fix_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            plan: String::new(),
            branch: branch.into(),
            pr_number: None,
            stage: PrStage::Planning,
            iteration: 0,
            max_iterations,
            ci_fix_count: 0,
            max_ci_fix_attempts,
            greptile_comments_total: 0,
            greptile_comments_resolved: 0,
            ci_green: false,
            open_tasks: BTreeSet::new(),
            deferred_comments: Vec::new(),
            review_clean: false,
            reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn unresolved_comments(&self) -> u32 {
        self.greptile_comments_total
            .saturating_sub(self.greptile_comments_resolved)
    }
}

// ---------------------------------------------------------------------------
// Quota
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaState {
    pub agent_requests_used: u64,
    pub agent_requests_limit: u64,
    pub prompts_used: u64,
    pub prompts_limit: u64,
    pub concurrent_agents: u32,
    pub max_concurrent: u32,
    pub pause_at_percent: u8,
    pub reserve_requests: u64,
    /// Reserve units already granted to human-initiated work today.
    pub reserve_used: u64,
    pub is_paused: bool,
    pub reset_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub trigger: RuleTrigger,
    pub action: RuleAction,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTrigger {
    #[serde(rename = "type")]
    pub event_type: EventKind,
    /// Case-insensitive regular expression.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Payload field the pattern is tested against. All fields when absent.
    #[serde(default)]
    pub field: Option<String>,
    /// Case-insensitive equality against the payload `source` field.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    /// Title template; `{key}` placeholders are filled from the event payload.
    pub template: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

// ---------------------------------------------------------------------------
// External events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CiStatus,
    ReviewComment,
    PrEvent,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EventKind::CiStatus => "ci_status",
            EventKind::ReviewComment => "review_comment",
            EventKind::PrEvent => "pr_event",
        };
        f.write_str(label)
    }
}

/// A single payload value. Kept deliberately small so matching stays exhaustive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for PayloadValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadValue::Bool(b) => write!(f, "{b}"),
            PayloadValue::Int(i) => write!(f, "{i}"),
            PayloadValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PayloadValue {
    fn from(value: &str) -> Self {
        PayloadValue::Text(value.to_string())
    }
}

impl From<String> for PayloadValue {
    fn from(value: String) -> Self {
        PayloadValue::Text(value)
    }
}

impl From<i64> for PayloadValue {
    fn from(value: i64) -> Self {
        PayloadValue::Int(value)
    }
}

impl From<u64> for PayloadValue {
    fn from(value: u64) -> Self {
        PayloadValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for PayloadValue {
    fn from(value: bool) -> Self {
        PayloadValue::Bool(value)
    }
}

/// Typed key/value payload carried by an [`ExternalEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, PayloadValue>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<PayloadValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PayloadValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PayloadValue> {
        self.0.get(key)
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(PayloadValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// Integer accessor that also accepts numeric strings.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            PayloadValue::Int(i) => Some(*i),
            PayloadValue::Text(s) => s.trim().parse().ok(),
            PayloadValue::Bool(_) => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            PayloadValue::Bool(b) => Some(*b),
            PayloadValue::Text(s) => s.parse().ok(),
            PayloadValue::Int(_) => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PayloadValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalEvent {
    /// Stable identity used for duplicate suppression.
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl ExternalEvent {
    pub fn new(id: impl Into<String>, kind: EventKind, payload: Payload) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            received_at: Utc::now(),
        }
    }

    pub fn pr_number(&self) -> Option<u64> {
        self.payload.int("pr_number").and_then(|n| u64::try_from(n).ok())
    }

    pub fn source(&self) -> Option<&str> {
        self.payload.text("source")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_critical_first() {
        let mut ps = vec![Priority::Normal, Priority::Critical, Priority::Low, Priority::High];
        ps.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            ps,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn terminal_task_states_have_no_exits() {
        for from in [TaskStatus::Done, TaskStatus::Failed, TaskStatus::Cancelled] {
            for to in [
                TaskStatus::Pending,
                TaskStatus::Blocked,
                TaskStatus::Ready,
                TaskStatus::Running,
                TaskStatus::Done,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn blocked_cannot_jump_to_running() {
        assert!(!TaskStatus::Blocked.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Ready));
    }

    #[test]
    fn merged_is_only_reachable_from_review_or_human() {
        assert!(PrStage::ReadyForReview.can_transition_to(PrStage::Merged));
        assert!(PrStage::NeedsHuman.can_transition_to(PrStage::Merged));
        assert!(!PrStage::CiMonitoring.can_transition_to(PrStage::Merged));
        assert!(!PrStage::Merged.can_transition_to(PrStage::Planning));
    }

    #[test]
    fn payload_accessors_are_typed() {
        let payload = Payload::new()
            .with("pr_number", 42u64)
            .with("body", "please fix")
            .with("draft", false)
            .with("count", "7");
        assert_eq!(payload.int("pr_number"), Some(42));
        assert_eq!(payload.int("count"), Some(7));
        assert_eq!(payload.text("body"), Some("please fix"));
        assert_eq!(payload.flag("draft"), Some(false));
        assert_eq!(payload.text("pr_number"), None);
    }

    #[test]
    fn event_deserializes_from_webhook_shape() {
        let raw = r#"{"id":"gh-1","type":"review_comment","payload":{"pr_number":7,"source":"greptile","body":"nit"}}"#;
        let ev: ExternalEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.kind, EventKind::ReviewComment);
        assert_eq!(ev.pr_number(), Some(7));
        assert_eq!(ev.source(), Some("greptile"));
    }
}
