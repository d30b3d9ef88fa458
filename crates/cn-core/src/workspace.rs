use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Snapshot, TaskId, Workspace, WorkspaceStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("workspace {0} not found")]
    NotFound(String),
    #[error("workspace {name} is already leased by agent {holder}")]
    AlreadyLeased { name: String, holder: Uuid },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Known working copies and their leases.
///
/// A lease ties one workspace to one live agent. `acquire` and `release` are
/// the only ways the assigned/free status changes, so every acquire is paired
/// with exactly one release.
#[derive(Debug, Default, Clone)]
pub struct WorkspaceRegistry {
    workspaces: BTreeMap<String, Workspace>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every directory under `root` whose name starts with `prefix`.
    ///
    /// Already known workspaces keep their current lease. Returns the names
    /// that were newly added.
    pub fn discover(&mut self, root: &Path, prefix: &str) -> std::io::Result<Vec<String>> {
        let mut added = Vec::new();
        if !root.is_dir() {
            warn!(root = %root.display(), "workspace root does not exist");
            return Ok(added);
        }
        let mut entries: Vec<_> = std::fs::read_dir(root)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();

        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            if self.register(Workspace::new(name, &path)) {
                added.push(name.to_string());
            }
        }
        info!(
            count = self.workspaces.len(),
            added = added.len(),
            "workspaces discovered"
        );
        Ok(added)
    }

    /// Add a workspace. Returns `false` if the name was already known.
    pub fn register(&mut self, ws: Workspace) -> bool {
        if self.workspaces.contains_key(&ws.name) {
            return false;
        }
        self.workspaces.insert(ws.name.clone(), ws);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.get(name)
    }

    pub fn list(&self) -> Vec<Workspace> {
        self.workspaces.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    /// First free workspace in name order.
    pub fn first_free(&self) -> Option<&Workspace> {
        self.workspaces.values().find(|w| w.is_free())
    }

    pub fn free_count(&self) -> usize {
        self.workspaces.values().filter(|w| w.is_free()).count()
    }

    /// Take the exclusive lease on `name` for `agent_id`.
    ///
    /// Fails fast when the workspace is already leased; it never waits.
    pub fn acquire(&mut self, name: &str, task_id: TaskId, agent_id: Uuid) -> Result<&Workspace> {
        let ws = self
            .workspaces
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        if let (WorkspaceStatus::Assigned, Some(holder)) = (ws.status, ws.agent_id) {
            return Err(RegistryError::AlreadyLeased {
                name: name.to_string(),
                holder,
            });
        }
        ws.status = WorkspaceStatus::Assigned;
        ws.task_id = Some(task_id);
        ws.agent_id = Some(agent_id);
        info!(workspace = name, task_id, agent_id = %agent_id, "workspace leased");
        Ok(ws)
    }

    /// Drop the lease on `name`. Releasing a free workspace is a no-op;
    /// returns whether a lease was actually held.
    pub fn release(&mut self, name: &str) -> Result<bool> {
        let ws = self
            .workspaces
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let was_held = ws.status == WorkspaceStatus::Assigned;
        ws.status = WorkspaceStatus::Free;
        ws.task_id = None;
        ws.agent_id = None;
        if was_held {
            info!(workspace = name, "workspace released");
        }
        Ok(was_held)
    }

    /// Release every lease. Used at startup, when no agent can be alive.
    pub fn release_all(&mut self) -> usize {
        let mut released = 0;
        for ws in self.workspaces.values_mut() {
            if ws.status == WorkspaceStatus::Assigned {
                released += 1;
            }
            ws.status = WorkspaceStatus::Free;
            ws.task_id = None;
            ws.agent_id = None;
        }
        released
    }

    pub fn lease_holder(&self, name: &str) -> Option<Uuid> {
        self.workspaces.get(name).and_then(|w| w.agent_id)
    }

    pub fn set_snapshot(&mut self, name: &str, snapshot: Option<Snapshot>) -> Result<()> {
        let ws = self
            .workspaces
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        ws.snapshot = snapshot;
        Ok(())
    }

    pub fn set_git_state(&mut self, name: &str, branch: String, is_dirty: bool) -> Result<()> {
        let ws = self
            .workspaces
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        ws.branch = branch;
        ws.is_dirty = is_dirty;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
