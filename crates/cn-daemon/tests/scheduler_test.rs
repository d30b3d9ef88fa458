use chrono::{Duration, Utc};
use cn_core::error::{CoreError, FailureKind};
use cn_core::types::{BlockReason, NewTask, Priority, TaskStatus};
use cn_daemon::scheduler::{CancelStep, TaskScheduler};

fn scheduler() -> TaskScheduler {
    TaskScheduler::new(2)
}

// ===========================================================================
// Admission order
// ===========================================================================

#[test]
fn admission_is_priority_then_fifo() {
    let mut s = scheduler();
    s.create(1, NewTask::new("low").with_priority(Priority::Low)).unwrap();
    s.create(2, NewTask::new("normal a")).unwrap();
    s.create(3, NewTask::new("critical").with_priority(Priority::Critical)).unwrap();
    s.create(4, NewTask::new("normal b")).unwrap();
    s.create(5, NewTask::new("high").with_priority(Priority::High)).unwrap();

    assert_eq!(s.admission_order(Utc::now()), vec![3, 5, 2, 4, 1]);
}

#[test]
fn retry_after_holds_task_back() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.mark_running(1, "ws-1").unwrap();
    let later = Utc::now() + Duration::minutes(5);
    s.note_quota_wait(1, later).unwrap();
    assert!(s.retry_or_fail(1, FailureKind::Transient, "rate limited").unwrap());

    assert!(s.admission_order(Utc::now()).is_empty());
    assert_eq!(s.admission_order(later), vec![1]);
}

#[test]
fn block_reason_reports_change_once() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    assert!(s.set_block_reason(1, Some(BlockReason::NoWorkspace)));
    assert!(!s.set_block_reason(1, Some(BlockReason::NoWorkspace)));
    assert_eq!(s.get(1).unwrap().block_reason, Some(BlockReason::NoWorkspace));

    s.mark_running(1, "ws-1").unwrap();
    assert_eq!(s.get(1).unwrap().block_reason, None);
}

// ===========================================================================
// Dependencies
// ===========================================================================

#[test]
fn dependent_waits_until_all_dependencies_done() {
    let mut s = scheduler();
    s.create(1, NewTask::new("schema")).unwrap();
    s.create(2, NewTask::new("api")).unwrap();
    let t = s.create(3, NewTask::new("ui").depends_on([1, 2])).unwrap();
    assert_eq!(t.status, TaskStatus::Blocked);
    assert_eq!(t.block_reason, Some(BlockReason::Dependency));

    s.mark_running(1, "ws-1").unwrap();
    s.complete(1).unwrap();
    assert!(s.tick().is_empty());
    assert_eq!(s.get(3).unwrap().status, TaskStatus::Blocked);

    s.mark_running(2, "ws-2").unwrap();
    s.complete(2).unwrap();
    assert_eq!(s.tick(), vec![3]);
    let t = s.get(3).unwrap();
    assert_eq!(t.status, TaskStatus::Ready);
    assert_eq!(t.block_reason, None);
}

#[test]
fn failure_propagates_down_the_chain() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.create(2, NewTask::new("b").depends_on([1])).unwrap();
    s.create(3, NewTask::new("c").depends_on([2])).unwrap();

    s.mark_running(1, "ws-1").unwrap();
    s.fail(1, FailureKind::Permanent, "compile error").unwrap();

    assert_eq!(s.tick(), vec![2, 3]);
    for id in [2, 3] {
        assert_eq!(s.get(id).unwrap().status, TaskStatus::Failed);
    }
    assert!(s.get(3).unwrap().failure.as_ref().unwrap().reason.contains("task 2"));
}

#[test]
fn running_with_unmet_dependency_is_refused() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.create(2, NewTask::new("b").depends_on([1])).unwrap();
    let err = s.mark_running(2, "ws-1").unwrap_err();
    assert!(matches!(err, CoreError::Precondition(_)));
}

// ===========================================================================
// Retries
// ===========================================================================

#[test]
fn transient_failure_retries_then_fails() {
    let mut s = scheduler();
    s.create(1, NewTask::new("flaky")).unwrap();
    for attempt in 1..=2 {
        s.mark_running(1, "ws-1").unwrap();
        assert!(s.retry_or_fail(1, FailureKind::Transient, "exit code 1").unwrap());
        let t = s.get(1).unwrap();
        assert_eq!(t.status, TaskStatus::Ready);
        assert_eq!(t.retry_count, attempt);
        assert_eq!(t.workspace, None);
    }
    s.mark_running(1, "ws-1").unwrap();
    assert!(!s.retry_or_fail(1, FailureKind::Transient, "exit code 1").unwrap());
    assert_eq!(s.get(1).unwrap().status, TaskStatus::Failed);
}

#[test]
fn guardrail_failure_is_never_retried() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.mark_running(1, "ws-1").unwrap();
    assert!(!s
        .retry_or_fail(1, FailureKind::Guardrail, "guardrail blocked_command: rm -rf /")
        .unwrap());
    let failure = s.get(1).unwrap().failure.clone().unwrap();
    assert_eq!(failure.kind, FailureKind::Guardrail);
    assert_eq!(s.get(1).unwrap().retry_count, 0);
}

// ===========================================================================
// Cancel / delete
// ===========================================================================

#[test]
fn cancel_ready_is_immediate_but_running_needs_kill() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.create(2, NewTask::new("b")).unwrap();
    assert_eq!(s.cancel(1).unwrap(), CancelStep::Cancelled);
    assert_eq!(s.get(1).unwrap().status, TaskStatus::Cancelled);

    s.mark_running(2, "ws-1").unwrap();
    assert_eq!(s.cancel(2).unwrap(), CancelStep::KillAgent);
    let t = s.get(2).unwrap();
    assert_eq!(t.status, TaskStatus::Running);
    assert!(t.cancel_requested);

    s.finish_cancel(2).unwrap();
    let t = s.get(2).unwrap();
    assert_eq!(t.status, TaskStatus::Cancelled);
    assert!(!t.cancel_requested);
}

#[test]
fn terminal_task_cannot_be_cancelled() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.mark_running(1, "ws-1").unwrap();
    s.complete(1).unwrap();
    assert!(matches!(s.cancel(1), Err(CoreError::Precondition(_))));
}

#[test]
fn deleting_non_terminal_task_is_refused() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    let err = s.delete(1).unwrap_err();
    assert!(matches!(err, CoreError::Precondition(_)));
    assert_eq!(s.len(), 1);
}

#[test]
fn deleting_done_dependency_unblocks_nothing_breaks() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.create(2, NewTask::new("b")).unwrap();
    s.create(3, NewTask::new("c").depends_on([1, 2])).unwrap();
    s.mark_running(1, "ws-1").unwrap();
    s.complete(1).unwrap();

    let (removed, edited) = s.delete(1).unwrap();
    assert_eq!(removed.id, 1);
    assert_eq!(edited, vec![3]);
    assert_eq!(s.get(3).unwrap().depends_on.iter().copied().collect::<Vec<_>>(), vec![2]);
    assert!(s.tick().is_empty());
    assert_eq!(s.get(3).unwrap().status, TaskStatus::Blocked);
}

#[test]
fn deleting_failed_dependency_fails_dependent() {
    let mut s = scheduler();
    s.create(1, NewTask::new("a")).unwrap();
    s.create(2, NewTask::new("b").depends_on([1])).unwrap();
    s.cancel(1).unwrap();
    // Not yet ticked: the dependent is still blocked when its dependency goes.
    let (_, edited) = s.delete(1).unwrap();
    assert!(edited.is_empty());

    assert_eq!(s.tick(), vec![2]);
    let t = s.get(2).unwrap();
    assert_eq!(t.status, TaskStatus::Failed);
    assert!(t.failure.as_ref().unwrap().reason.contains("no longer exists"));
}

// ===========================================================================
// Restart
// ===========================================================================

#[test]
fn load_returns_running_tasks_to_ready() {
    let mut before = scheduler();
    before.create(1, NewTask::new("a")).unwrap();
    before.create(2, NewTask::new("b")).unwrap();
    before.mark_running(1, "ws-1").unwrap();

    let mut after = scheduler();
    let requeued = after.load(before.list());
    assert_eq!(requeued, vec![1]);
    let t = after.get(1).unwrap();
    assert_eq!(t.status, TaskStatus::Ready);
    assert_eq!(t.workspace, None);
    assert_eq!(after.count_in(TaskStatus::Ready), 2);
}
