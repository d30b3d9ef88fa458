//! Request/reply command surface of the coordinator.
//!
//! Every command carries a oneshot reply channel; the coordinator applies it
//! on its own loop and answers with the outcome. Callers never touch
//! scheduling state directly.

use cn_core::error::CoreError;
use cn_core::types::{
    Agent, ExternalEvent, LifecycleId, NewTask, PrLifecycle, QuotaState, Task, TaskId, Workspace,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Invalid in the current state. Nothing changed.
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },
    /// A concurrent transition won. Re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("coordinator unavailable")]
    Unavailable,
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Conflict(_))
    }
}

impl From<CoreError> for CommandError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Precondition(msg) => CommandError::Precondition(msg),
            CoreError::NotFound { entity, id } => CommandError::NotFound {
                entity: entity.to_string(),
                id,
            },
            e @ CoreError::Conflict { .. } => CommandError::Conflict(e.to_string()),
            CoreError::Store(e) if e.is_conflict() => CommandError::Conflict(e.to_string()),
            CoreError::Store(e) => CommandError::Internal(e.to_string()),
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
pub type Reply<T> = oneshot::Sender<CommandResult<T>>;

// ---------------------------------------------------------------------------
// Request / response payloads
// ---------------------------------------------------------------------------

/// Start automation for a branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLifecycle {
    pub title: String,
    pub branch: String,
    #[serde(default)]
    pub plan: String,
    /// Attach to a PR that already exists instead of starting from planning.
    #[serde(default)]
    pub pr_number: Option<u64>,
}

/// Edits applied when a plan is approved.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub plan: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was not running and is now `cancelled`.
    Cancelled,
    /// A kill was issued; the task reaches `cancelled` once the agent exits
    /// or the kill deadline passes.
    Killing { agent_id: Uuid },
}

/// What happened to a submitted external event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReceipt {
    /// The event id was already processed; nothing was done.
    pub duplicate: bool,
    pub tasks_created: Vec<TaskId>,
    pub lifecycles_changed: Vec<LifecycleId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub tasks: Vec<Task>,
    pub agents: Vec<Agent>,
    pub workspaces: Vec<Workspace>,
    pub lifecycles: Vec<PrLifecycle>,
    pub quota: QuotaState,
    pub time_until_reset: String,
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

pub enum Command {
    CreateTask {
        task: NewTask,
        reply: Reply<Task>,
    },
    DeleteTask {
        id: TaskId,
        reply: Reply<()>,
    },
    CancelTask {
        id: TaskId,
        reply: Reply<CancelOutcome>,
    },
    KillAgent {
        id: Uuid,
        reply: Reply<bool>,
    },
    KillAll {
        reply: Reply<usize>,
    },
    RollbackWorkspace {
        name: String,
        reply: Reply<Workspace>,
    },
    CreateLifecycle {
        lifecycle: NewLifecycle,
        reply: Reply<PrLifecycle>,
    },
    ApprovePlan {
        id: LifecycleId,
        update: PlanUpdate,
        reply: Reply<PrLifecycle>,
    },
    ResumeLifecycle {
        id: LifecycleId,
        reply: Reply<PrLifecycle>,
    },
    DeleteLifecycle {
        id: LifecycleId,
        reply: Reply<()>,
    },
    SubmitEvent {
        event: ExternalEvent,
        reply: Reply<EventReceipt>,
    },
    ResumeQuota {
        reply: Reply<QuotaState>,
    },
    Snapshot {
        reply: Reply<StateSnapshot>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateTask { .. } => "create_task",
            Command::DeleteTask { .. } => "delete_task",
            Command::CancelTask { .. } => "cancel_task",
            Command::KillAgent { .. } => "kill_agent",
            Command::KillAll { .. } => "kill_all",
            Command::RollbackWorkspace { .. } => "rollback_workspace",
            Command::CreateLifecycle { .. } => "create_lifecycle",
            Command::ApprovePlan { .. } => "approve_plan",
            Command::ResumeLifecycle { .. } => "resume_lifecycle",
            Command::DeleteLifecycle { .. } => "delete_lifecycle",
            Command::SubmitEvent { .. } => "submit_event",
            Command::ResumeQuota { .. } => "resume_quota",
            Command::Snapshot { .. } => "snapshot",
        }
    }
}

// ---------------------------------------------------------------------------
// CoordinatorHandle
// ---------------------------------------------------------------------------

/// Cloneable client for the coordinator's command channel.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: flume::Sender<Command>,
}

/// Create a connected handle and the receiver the coordinator drains.
pub fn command_channel() -> (CoordinatorHandle, flume::Receiver<Command>) {
    let (tx, rx) = flume::unbounded();
    (CoordinatorHandle { tx }, rx)
}

impl CoordinatorHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> CommandResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send_async(build(reply))
            .await
            .map_err(|_| CommandError::Unavailable)?;
        rx.await.map_err(|_| CommandError::Unavailable)?
    }

    pub async fn create_task(&self, task: NewTask) -> CommandResult<Task> {
        self.request(|reply| Command::CreateTask { task, reply }).await
    }

    pub async fn delete_task(&self, id: TaskId) -> CommandResult<()> {
        self.request(|reply| Command::DeleteTask { id, reply }).await
    }

    pub async fn cancel_task(&self, id: TaskId) -> CommandResult<CancelOutcome> {
        self.request(|reply| Command::CancelTask { id, reply }).await
    }

    /// `Ok(false)` when the agent was already terminal.
    pub async fn kill_agent(&self, id: Uuid) -> CommandResult<bool> {
        self.request(|reply| Command::KillAgent { id, reply }).await
    }

    pub async fn kill_all(&self) -> CommandResult<usize> {
        self.request(|reply| Command::KillAll { reply }).await
    }

    pub async fn rollback_workspace(&self, name: impl Into<String>) -> CommandResult<Workspace> {
        let name = name.into();
        self.request(|reply| Command::RollbackWorkspace { name, reply })
            .await
    }

    pub async fn create_lifecycle(&self, lifecycle: NewLifecycle) -> CommandResult<PrLifecycle> {
        self.request(|reply| Command::CreateLifecycle { lifecycle, reply })
            .await
    }

    pub async fn approve_plan(
        &self,
        id: LifecycleId,
        update: PlanUpdate,
    ) -> CommandResult<PrLifecycle> {
        self.request(|reply| Command::ApprovePlan { id, update, reply })
            .await
    }

    pub async fn resume_lifecycle(&self, id: LifecycleId) -> CommandResult<PrLifecycle> {
        self.request(|reply| Command::ResumeLifecycle { id, reply })
            .await
    }

    pub async fn delete_lifecycle(&self, id: LifecycleId) -> CommandResult<()> {
        self.request(|reply| Command::DeleteLifecycle { id, reply })
            .await
    }

    pub async fn submit_event(&self, event: ExternalEvent) -> CommandResult<EventReceipt> {
        self.request(|reply| Command::SubmitEvent { event, reply })
            .await
    }

    pub async fn resume_quota(&self) -> CommandResult<QuotaState> {
        self.request(|reply| Command::ResumeQuota { reply }).await
    }

    pub async fn snapshot(&self) -> CommandResult<StateSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dropped_coordinator_is_unavailable() {
        let (handle, rx) = command_channel();
        drop(rx);
        assert_eq!(
            handle.kill_all().await.unwrap_err(),
            CommandError::Unavailable
        );
    }

    #[tokio::test]
    async fn reply_is_returned_to_caller() {
        let (handle, rx) = command_channel();
        tokio::spawn(async move {
            while let Ok(cmd) = rx.recv_async().await {
                if let Command::DeleteTask { id, reply } = cmd {
                    let _ = reply.send(Err(CommandError::Precondition(format!(
                        "task {id} is running"
                    ))));
                }
            }
        });
        let err = handle.delete_task(7).await.unwrap_err();
        assert_eq!(err, CommandError::Precondition("task 7 is running".into()));
    }

    #[test]
    fn core_errors_map_to_command_errors() {
        let e: CommandError = CoreError::not_found("task", 3).into();
        assert_eq!(
            e,
            CommandError::NotFound {
                entity: "task".into(),
                id: "3".into()
            }
        );
        let e: CommandError = CoreError::conflict("task", 3, "version 2 != 1").into();
        assert!(e.is_retryable());
    }
}
