use chrono::{DateTime, Utc};
use cn_core::types::{
    Agent, LifecycleId, PrLifecycle, QuotaState, Task, TaskId, Workspace,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A change to coordinator-owned state, published on the live feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum StateChange {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted { id: TaskId },
    AgentStatus(Agent),
    AgentOutput {
        agent_id: Uuid,
        task_id: TaskId,
        line: String,
    },
    WorkspaceChanged(Workspace),
    LifecycleChanged(PrLifecycle),
    LifecycleDeleted { id: LifecycleId },
    QuotaChanged(QuotaState),
}

impl StateChange {
    pub fn kind(&self) -> &'static str {
        match self {
            StateChange::TaskCreated(_) => "task_created",
            StateChange::TaskUpdated(_) => "task_updated",
            StateChange::TaskDeleted { .. } => "task_deleted",
            StateChange::AgentStatus(_) => "agent_status",
            StateChange::AgentOutput { .. } => "agent_output",
            StateChange::WorkspaceChanged(_) => "workspace_changed",
            StateChange::LifecycleChanged(_) => "lifecycle_changed",
            StateChange::LifecycleDeleted { .. } => "lifecycle_deleted",
            StateChange::QuotaChanged(_) => "quota_changed",
        }
    }
}

/// Envelope delivered to subscribers. `seq` increases by one per publish so
/// observers can spot gaps after reconnecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub change: StateChange,
}
