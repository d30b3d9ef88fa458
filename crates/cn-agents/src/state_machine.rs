use cn_core::types::AgentStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// AgentEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEvent {
    Launched,
    /// Rate-limited; waiting out the backoff.
    Pause,
    Resume,
    Complete,
    Fail,
    Kill,
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentEvent::Launched => "launched",
            AgentEvent::Pause => "pause",
            AgentEvent::Resume => "resume",
            AgentEvent::Complete => "complete",
            AgentEvent::Fail => "fail",
            AgentEvent::Kill => "kill",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: AgentStatus,
        event: AgentEvent,
    },
}

// ---------------------------------------------------------------------------
// AgentStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AgentStateMachine {
    current: AgentStatus,
    history: Vec<(AgentStatus, AgentEvent, AgentStatus)>,
}

impl AgentStateMachine {
    /// Create a new state machine starting in `Starting`.
    pub fn new() -> Self {
        Self {
            current: AgentStatus::Starting,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> AgentStatus {
        self.current
    }

    pub fn history(&self) -> &[(AgentStatus, AgentEvent, AgentStatus)] {
        &self.history
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Starting + Launched -> Running
    /// - Starting + Fail     -> Failed
    /// - Starting + Kill     -> Killed
    /// - Running  + Pause    -> Paused
    /// - Running  + Complete -> Completed
    /// - Running  + Fail     -> Failed
    /// - Running  + Kill     -> Killed
    /// - Paused   + Resume   -> Starting
    /// - Paused   + Fail     -> Failed
    /// - Paused   + Kill     -> Killed
    pub fn transition(&mut self, event: AgentEvent) -> Result<AgentStatus, StateMachineError> {
        let next = match (self.current, event) {
            (AgentStatus::Starting, AgentEvent::Launched) => AgentStatus::Running,
            (AgentStatus::Starting, AgentEvent::Fail) => AgentStatus::Failed,
            (AgentStatus::Starting, AgentEvent::Kill) => AgentStatus::Killed,
            (AgentStatus::Running, AgentEvent::Pause) => AgentStatus::Paused,
            (AgentStatus::Running, AgentEvent::Complete) => AgentStatus::Completed,
            (AgentStatus::Running, AgentEvent::Fail) => AgentStatus::Failed,
            (AgentStatus::Running, AgentEvent::Kill) => AgentStatus::Killed,
            (AgentStatus::Paused, AgentEvent::Resume) => AgentStatus::Starting,
            (AgentStatus::Paused, AgentEvent::Fail) => AgentStatus::Failed,
            (AgentStatus::Paused, AgentEvent::Kill) => AgentStatus::Killed,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "agent state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: AgentEvent) -> bool {
        matches!(
            (self.current, event),
            (AgentStatus::Starting, AgentEvent::Launched)
                | (AgentStatus::Starting, AgentEvent::Fail)
                | (AgentStatus::Starting, AgentEvent::Kill)
                | (AgentStatus::Running, AgentEvent::Pause)
                | (AgentStatus::Running, AgentEvent::Complete)
                | (AgentStatus::Running, AgentEvent::Fail)
                | (AgentStatus::Running, AgentEvent::Kill)
                | (AgentStatus::Paused, AgentEvent::Resume)
                | (AgentStatus::Paused, AgentEvent::Fail)
                | (AgentStatus::Paused, AgentEvent::Kill)
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
