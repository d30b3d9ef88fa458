use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use cn_core::error::{CoreError, FailureKind, Result};
use cn_core::types::{BlockReason, NewTask, Task, TaskFailure, TaskId, TaskStatus};
use tracing::{debug, info, warn};

/// What `cancel` left for the caller to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelStep {
    /// The task was not running and is now `cancelled`.
    Cancelled,
    /// The task is running; its agent must be killed before it can reach
    /// `cancelled` through [`TaskScheduler::finish_cancel`].
    KillAgent,
}

/// Task backlog and its state machine.
///
/// Owned by the coordinator; every method is a synchronous in-memory
/// transition that re-checks the current status before applying. Callers
/// persist the tasks whose ids are returned.
///
/// Admission order among ready tasks:
/// 1. Higher priority first.
/// 2. Older `created_at` first.
/// 3. Lower id first.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    tasks: BTreeMap<TaskId, Task>,
    default_max_retries: u32,
}

impl TaskScheduler {
    pub fn new(default_max_retries: u32) -> Self {
        Self {
            tasks: BTreeMap::new(),
            default_max_retries,
        }
    }

    /// Load persisted tasks. Tasks that were `running` when the daemon
    /// stopped have no agent anymore and go back to `ready`; their ids are
    /// returned.
    pub fn load(&mut self, tasks: Vec<Task>) -> Vec<TaskId> {
        let mut recovered = Vec::new();
        for mut task in tasks {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Ready;
                task.workspace = None;
                task.started_at = None;
                task.cancel_requested = false;
                recovered.push(task.id);
            }
            self.tasks.insert(task.id, task);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "running tasks returned to ready after restart");
        }
        recovered
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn list(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Overwrite the in-memory copy, e.g. with the version bumped by the store.
    pub fn replace(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    /// Drop a freshly created task that could not be persisted.
    pub fn forget(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn count_in(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create a task under `id`. It enters `pending` and moves on at once to
    /// `blocked` when it declares dependencies, else to `ready`.
    pub fn create(&mut self, id: TaskId, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(CoreError::precondition("task title must not be empty"));
        }
        if self.tasks.contains_key(&id) {
            return Err(CoreError::conflict("task", id, "id already in use"));
        }
        let deps: BTreeSet<TaskId> = new.depends_on.iter().copied().collect();
        if deps.contains(&id) {
            return Err(CoreError::precondition(format!(
                "task {id} cannot depend on itself"
            )));
        }
        if let Some(missing) = deps.iter().find(|d| !self.tasks.contains_key(d)) {
            return Err(CoreError::precondition(format!(
                "unknown dependency: task {missing}"
            )));
        }
        if let Some(dep) = deps.iter().find(|d| self.reaches(**d, id)) {
            return Err(CoreError::precondition(format!(
                "dependency on task {dep} would form a cycle"
            )));
        }

        let mut task = Task::new(id, new.title, new.priority);
        task.description = new.description;
        task.kind = new.kind;
        task.branch = new.branch;
        task.lifecycle_id = new.lifecycle_id;
        task.human_initiated = new.human_initiated;
        task.max_retries = new.max_retries.unwrap_or(self.default_max_retries);
        task.depends_on = deps;

        if task.depends_on.is_empty() {
            set_status(&mut task, TaskStatus::Ready)?;
        } else {
            set_status(&mut task, TaskStatus::Blocked)?;
            task.block_reason = Some(BlockReason::Dependency);
        }
        info!(
            task_id = id,
            title = %task.title,
            priority = %task.priority,
            status = %task.status,
            "task created"
        );
        self.tasks.insert(id, task.clone());
        Ok(task)
    }

    /// Whether `from` can reach `to` by following dependency edges.
    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(t) = self.tasks.get(&id) {
                stack.extend(t.depends_on.iter().copied());
            }
        }
        false
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Re-evaluate every blocked task until nothing changes.
    ///
    /// - All dependencies `done` ⇒ `ready`.
    /// - Any dependency `failed`, `cancelled` or deleted ⇒ `failed`.
    /// - Part of a dependency cycle ⇒ `failed`.
    ///
    /// Returns the ids of tasks that changed.
    pub fn tick(&mut self) -> Vec<TaskId> {
        let mut changed = BTreeSet::new();

        for id in self.cycle_members() {
            if let Some(task) = self.tasks.get_mut(&id) {
                if set_failed(task, FailureKind::Permanent, "dependency cycle".into()) {
                    warn!(task_id = id, "task is part of a dependency cycle");
                    changed.insert(id);
                }
            }
        }

        loop {
            let mut progressed = false;
            let blocked: Vec<TaskId> = self
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Blocked)
                .map(|t| t.id)
                .collect();

            for id in blocked {
                let Some(verdict) = self.dependency_verdict(id) else {
                    continue;
                };
                let Some(task) = self.tasks.get_mut(&id) else {
                    continue;
                };
                let moved = match verdict {
                    DepVerdict::Satisfied => {
                        task.block_reason = None;
                        set_status(task, TaskStatus::Ready).is_ok()
                    }
                    DepVerdict::Broken(reason) => {
                        set_failed(task, FailureKind::Permanent, reason)
                    }
                };
                if moved {
                    debug!(task_id = id, status = %task.status, "dependency resolved");
                    changed.insert(id);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
        changed.into_iter().collect()
    }

    fn dependency_verdict(&self, id: TaskId) -> Option<DepVerdict> {
        let task = self.tasks.get(&id)?;
        let mut all_done = true;
        for dep in &task.depends_on {
            match self.tasks.get(dep).map(|d| d.status) {
                None => {
                    return Some(DepVerdict::Broken(format!(
                        "dependency task {dep} no longer exists"
                    )))
                }
                Some(status @ (TaskStatus::Failed | TaskStatus::Cancelled)) => {
                    return Some(DepVerdict::Broken(format!(
                        "dependency task {dep} {status}"
                    )))
                }
                Some(TaskStatus::Done) => {}
                Some(_) => all_done = false,
            }
        }
        all_done.then_some(DepVerdict::Satisfied)
    }

    /// Blocked tasks that can reach themselves through dependency edges.
    fn cycle_members(&self) -> Vec<TaskId> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Blocked)
            .filter(|t| t.depends_on.iter().any(|d| self.reaches(*d, t.id)))
            .map(|t| t.id)
            .collect()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Ready tasks eligible for admission at `now`, best first.
    pub fn admission_order(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut ready: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Ready && !t.cancel_requested)
            .filter(|t| t.retry_after.is_none_or(|at| at <= now))
            .collect();
        ready.sort_by_key(|t| (Reverse(t.priority), t.created_at, t.id));
        ready.into_iter().map(|t| t.id).collect()
    }

    /// Record why a ready task was not admitted. Returns whether it changed.
    pub fn set_block_reason(&mut self, id: TaskId, reason: Option<BlockReason>) -> bool {
        match self.tasks.get_mut(&id) {
            Some(task) if task.block_reason != reason => {
                task.block_reason = reason;
                true
            }
            _ => false,
        }
    }

    pub fn mark_running(&mut self, id: TaskId, workspace: &str) -> Result<()> {
        let task = self
            .tasks
            .get(&id)
            .ok_or_else(|| CoreError::not_found("task", id))?;
        if task
            .depends_on
            .iter()
            .any(|d| !matches!(self.tasks.get(d).map(|t| t.status), Some(TaskStatus::Done)))
        {
            return Err(CoreError::precondition(format!(
                "task {id} has unmet dependencies"
            )));
        }
        let task = self.task_mut(id)?;
        set_status(task, TaskStatus::Running)?;
        task.workspace = Some(workspace.to_string());
        task.block_reason = None;
        task.retry_after = None;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// A running agent is waiting out a rate limit. The wait spends one unit
    /// of the retry budget it shares with flakes.
    pub fn note_quota_wait(&mut self, id: TaskId, retry_after: DateTime<Utc>) -> Result<()> {
        let task = self.task_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(CoreError::precondition(format!(
                "task {id} is {}, not running",
                task.status
            )));
        }
        task.retry_count += 1;
        task.retry_after = Some(retry_after);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    pub fn complete(&mut self, id: TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        set_status(task, TaskStatus::Done)?;
        task.completed_at = Some(Utc::now());
        task.retry_after = None;
        info!(task_id = id, "task done");
        Ok(())
    }

    pub fn fail(&mut self, id: TaskId, kind: FailureKind, reason: impl Into<String>) -> Result<()> {
        let task = self.task_mut(id)?;
        if !task.status.can_transition_to(TaskStatus::Failed) {
            return Err(invalid(task, TaskStatus::Failed));
        }
        set_failed(task, kind, reason.into());
        Ok(())
    }

    /// Return a transient failure to `ready` while budget remains; otherwise,
    /// or for any other kind, fail the task. Returns whether it was retried.
    pub fn retry_or_fail(
        &mut self,
        id: TaskId,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Result<bool> {
        let reason = reason.into();
        let task = self.task_mut(id)?;
        if kind.is_retryable() && task.retry_count < task.max_retries {
            set_status(task, TaskStatus::Ready)?;
            task.retry_count += 1;
            task.workspace = None;
            task.started_at = None;
            info!(
                task_id = id,
                attempt = task.retry_count,
                max_retries = task.max_retries,
                reason = %reason,
                "transient failure, task will be retried"
            );
            return Ok(true);
        }
        let reason = if kind.is_retryable() {
            format!("{reason} (retries exhausted after {})", task.retry_count)
        } else {
            reason
        };
        self.fail(id, kind, reason)?;
        Ok(false)
    }

    // -----------------------------------------------------------------------
    // Cancel / delete
    // -----------------------------------------------------------------------

    pub fn cancel(&mut self, id: TaskId) -> Result<CancelStep> {
        let task = self.task_mut(id)?;
        if !task.status.is_cancellable() {
            return Err(CoreError::precondition(format!(
                "task {id} is {} and cannot be cancelled",
                task.status
            )));
        }
        if task.status == TaskStatus::Running {
            task.cancel_requested = true;
            info!(task_id = id, "cancel requested for running task");
            return Ok(CancelStep::KillAgent);
        }
        set_status(task, TaskStatus::Cancelled)?;
        task.completed_at = Some(Utc::now());
        info!(task_id = id, "task cancelled");
        Ok(CancelStep::Cancelled)
    }

    /// Complete the cancellation of a running task once its agent is gone.
    pub fn finish_cancel(&mut self, id: TaskId) -> Result<()> {
        let task = self.task_mut(id)?;
        set_status(task, TaskStatus::Cancelled)?;
        task.completed_at = Some(Utc::now());
        task.cancel_requested = false;
        info!(task_id = id, "task cancelled");
        Ok(())
    }

    /// Remove a terminal task.
    ///
    /// A deleted `done` task is also dropped from the dependency lists of
    /// other tasks, since it is already satisfied. Returns the removed task
    /// and the ids of tasks whose dependencies were edited.
    pub fn delete(&mut self, id: TaskId) -> Result<(Task, Vec<TaskId>)> {
        let task = self
            .tasks
            .get(&id)
            .ok_or_else(|| CoreError::not_found("task", id))?;
        if !task.status.is_terminal() {
            return Err(CoreError::precondition(format!(
                "task {id} is {} and not terminal; cancel it first",
                task.status
            )));
        }
        let was_done = task.status == TaskStatus::Done;
        let removed = self
            .tasks
            .remove(&id)
            .ok_or_else(|| CoreError::not_found("task", id))?;

        let mut edited = Vec::new();
        if was_done {
            for t in self.tasks.values_mut() {
                if t.depends_on.remove(&id) {
                    edited.push(t.id);
                }
            }
        }
        info!(task_id = id, "task deleted");
        Ok((removed, edited))
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("task", id))
    }
}

enum DepVerdict {
    Satisfied,
    Broken(String),
}

fn invalid(task: &Task, to: TaskStatus) -> CoreError {
    CoreError::precondition(format!(
        "task {} cannot go from {} to {to}",
        task.id, task.status
    ))
}

fn set_status(task: &mut Task, to: TaskStatus) -> Result<()> {
    if !task.status.can_transition_to(to) {
        return Err(invalid(task, to));
    }
    debug!(task_id = task.id, from = %task.status, to = %to, "task transition");
    task.status = to;
    Ok(())
}

/// Move to `failed` when allowed. Returns whether the task changed.
fn set_failed(task: &mut Task, kind: FailureKind, reason: String) -> bool {
    if set_status(task, TaskStatus::Failed).is_err() {
        return false;
    }
    warn!(task_id = task.id, kind = %kind, reason = %reason, "task failed");
    task.failure = Some(TaskFailure { kind, reason });
    task.completed_at = Some(Utc::now());
    task.block_reason = None;
    task.retry_after = None;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use cn_core::types::Priority;

    #[test]
    fn self_dependency_is_rejected() {
        let mut s = TaskScheduler::new(2);
        let err = s
            .create(1, NewTask::new("loop").depends_on([1]))
            .unwrap_err();
        assert!(err.to_string().contains("itself"));
        assert!(s.is_empty());
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut s = TaskScheduler::new(2);
        let err = s.create(1, NewTask::new("a").depends_on([9])).unwrap_err();
        assert!(matches!(err, CoreError::Precondition(_)));
    }

    #[test]
    fn loaded_cycle_fails_on_tick() {
        let mut s = TaskScheduler::new(2);
        let mut a = Task::new(1, "a", Priority::Normal);
        let mut b = Task::new(2, "b", Priority::Normal);
        a.status = TaskStatus::Blocked;
        b.status = TaskStatus::Blocked;
        a.depends_on.insert(2);
        b.depends_on.insert(1);
        s.load(vec![a, b]);

        let changed = s.tick();
        assert_eq!(changed, vec![1, 2]);
        for id in [1, 2] {
            let t = s.get(id).unwrap();
            assert_eq!(t.status, TaskStatus::Failed);
            assert_eq!(t.failure.as_ref().unwrap().reason, "dependency cycle");
        }
    }

    #[test]
    fn retry_budget_is_shared_with_quota_waits() {
        let mut s = TaskScheduler::new(2);
        s.create(1, NewTask::new("a")).unwrap();
        s.mark_running(1, "ws-1").unwrap();
        s.note_quota_wait(1, Utc::now()).unwrap();
        s.note_quota_wait(1, Utc::now()).unwrap();

        let retried = s
            .retry_or_fail(1, FailureKind::Transient, "flake (exit code 1)")
            .unwrap();
        assert!(!retried);
        let t = s.get(1).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert!(t.failure.as_ref().unwrap().reason.contains("retries exhausted"));
    }
}
