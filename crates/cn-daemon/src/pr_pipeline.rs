//! PR lifecycle automation.
//!
//! `planning → coding → prechecks → pr_created → ci_monitoring ⇄ ci_fixing →
//! greptile_review ⇄ addressing_comments → {ready_for_review | needs_human} →
//! merged`
//!
//! [`PrPipeline`] is a pure state machine over [`PrLifecycle`]: it applies an
//! input (approval, external event, follow-up task outcome, PR creation
//! result) and returns the [`Effect`]s the coordinator must carry out. The
//! review iteration counter belongs to the whole lifecycle and is bumped once
//! when a review cycle opens.

use cn_core::config::PrPipelineConfig;
use cn_core::error::{CoreError, Result};
use cn_core::types::{
    EventKind, ExternalEvent, LifecycleId, NewTask, PrLifecycle, PrStage, Priority, Task,
    TaskKind, TaskStatus,
};
use cn_integrations::types::CreatePr;
use tracing::{debug, info, warn};

/// At most this many CI fix tasks are open for one lifecycle at a time.
const MAX_OPEN_CI_FIXES: usize = 3;

/// Side effects requested by a pipeline transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Inject a follow-up task and track it in `open_tasks`.
    CreateTask(NewTask),
    /// Inject a CI fix task once the failing check's log has been fetched.
    FixCi {
        check_name: String,
        branch: String,
        task: NewTask,
    },
    CreatePr(CreatePr),
    Comment { pr_number: u64, body: String },
}

#[derive(Debug, Clone)]
pub struct PrPipeline {
    settings: PrPipelineConfig,
}

impl PrPipeline {
    pub fn new(settings: PrPipelineConfig) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PrPipelineConfig {
        &self.settings
    }

    /// A new lifecycle in `planning`, or in `ci_monitoring` when attached to
    /// an existing PR.
    pub fn new_lifecycle(
        &self,
        id: LifecycleId,
        title: impl Into<String>,
        branch: impl Into<String>,
        plan: impl Into<String>,
        pr_number: Option<u64>,
    ) -> PrLifecycle {
        let mut prl = PrLifecycle::new(
            id,
            title,
            branch,
            self.settings.max_review_iterations,
            self.settings.max_ci_fix_attempts,
        );
        prl.plan = plan.into();
        if pr_number.is_some() {
            prl.pr_number = pr_number;
            prl.stage = PrStage::CiMonitoring;
        }
        info!(
            prl_id = id,
            title = %prl.title,
            branch = %prl.branch,
            stage = %prl.stage,
            "lifecycle started"
        );
        prl
    }

    // -----------------------------------------------------------------------
    // Human inputs
    // -----------------------------------------------------------------------

    /// Approve (and optionally edit) the plan: `planning → coding`.
    pub fn approve(
        &self,
        prl: &mut PrLifecycle,
        title: Option<String>,
        plan: Option<String>,
    ) -> Result<Vec<Effect>> {
        if prl.stage != PrStage::Planning {
            return Err(CoreError::precondition(format!(
                "lifecycle {} is in {}, not planning",
                prl.id, prl.stage
            )));
        }
        if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
            prl.title = title;
        }
        if let Some(plan) = plan {
            prl.plan = plan;
        }
        prl.reason = None;
        prl.open_tasks.clear();
        transition(prl, PrStage::Coding);

        let description = if prl.plan.trim().is_empty() {
            prl.title.clone()
        } else {
            prl.plan.clone()
        };
        Ok(vec![Effect::CreateTask(self.follow_up(
            prl,
            prl.title.clone(),
            description,
            TaskKind::Feature,
            Priority::Normal,
        ))])
    }

    /// Human re-approval after escalation: `needs_human → planning`, with the
    /// cycle counters reset.
    pub fn resume(&self, prl: &mut PrLifecycle) -> Result<()> {
        if prl.stage != PrStage::NeedsHuman {
            return Err(CoreError::precondition(format!(
                "lifecycle {} is in {}; only needs_human can be resumed",
                prl.id, prl.stage
            )));
        }
        prl.stage = PrStage::Planning;
        prl.iteration = 0;
        prl.ci_fix_count = 0;
        prl.greptile_comments_total = 0;
        prl.greptile_comments_resolved = 0;
        prl.ci_green = false;
        prl.review_clean = false;
        prl.open_tasks.clear();
        prl.reason = None;
        info!(prl_id = prl.id, "lifecycle resumed into planning");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Follow-up task outcomes
    // -----------------------------------------------------------------------

    /// Record that a follow-up task was created for this lifecycle.
    pub fn track_task(&self, prl: &mut PrLifecycle, task_id: u64) {
        prl.open_tasks.insert(task_id);
    }

    /// A task linked to this lifecycle reached a terminal status.
    pub fn on_task_finished(&self, prl: &mut PrLifecycle, task: &Task) -> Vec<Effect> {
        if !prl.open_tasks.remove(&task.id) {
            debug!(prl_id = prl.id, task_id = task.id, "finished task is not tracked");
            return Vec::new();
        }

        match task.status {
            TaskStatus::Done => {}
            TaskStatus::Failed | TaskStatus::Cancelled => {
                let why = task
                    .failure
                    .as_ref()
                    .map(|f| f.reason.clone())
                    .unwrap_or_else(|| task.status.to_string());
                self.reset_to_planning(prl, format!("task {} ({}): {why}", task.id, task.title));
                return Vec::new();
            }
            _ => return Vec::new(),
        }

        if task.kind == TaskKind::AddressComments {
            prl.greptile_comments_resolved =
                (prl.greptile_comments_resolved + 1).min(prl.greptile_comments_total);
        }
        if !prl.open_tasks.is_empty() {
            return Vec::new();
        }

        match prl.stage {
            PrStage::Coding => {
                transition(prl, PrStage::Prechecks);
                let description = format!(
                    "Run {} in the workspace on branch {}. Fix any failures and commit the fixes.",
                    self.settings.precheck_command, prl.branch
                );
                vec![Effect::CreateTask(self.follow_up(
                    prl,
                    format!("[PR {}] Run prechecks", prl.title),
                    description,
                    TaskKind::Precheck,
                    Priority::High,
                ))]
            }
            PrStage::Prechecks => match prl.pr_number {
                Some(_) => {
                    transition(prl, PrStage::CiMonitoring);
                    Vec::new()
                }
                None => vec![Effect::CreatePr(CreatePr {
                    title: prl.title.clone(),
                    body: pr_body(prl),
                    head: prl.branch.clone(),
                    base: self.settings.base_branch.clone(),
                })],
            },
            PrStage::CiFixing => {
                prl.ci_green = false;
                transition(prl, PrStage::CiMonitoring);
                Vec::new()
            }
            PrStage::AddressingComments => {
                prl.ci_green = false;
                prl.review_clean = false;
                transition(prl, PrStage::GreptileReview);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// Outcome of the PR creation requested from `prechecks`.
    pub fn on_pr_created(
        &self,
        prl: &mut PrLifecycle,
        result: std::result::Result<u64, String>,
    ) -> Vec<Effect> {
        if prl.stage != PrStage::Prechecks {
            warn!(prl_id = prl.id, stage = %prl.stage, "PR creation result arrived late");
            return Vec::new();
        }
        match result {
            Ok(number) => {
                prl.pr_number = Some(number);
                transition(prl, PrStage::PrCreated);
                transition(prl, PrStage::CiMonitoring);
            }
            Err(e) => {
                self.escalate(prl, format!("creating the pull request failed: {e}"));
            }
        }
        Vec::new()
    }

    // -----------------------------------------------------------------------
    // External events
    // -----------------------------------------------------------------------

    pub fn on_event(&self, prl: &mut PrLifecycle, event: &ExternalEvent) -> Vec<Effect> {
        match event.kind {
            EventKind::CiStatus => self.on_ci_status(prl, event),
            EventKind::ReviewComment => self.on_review_comment(prl, event),
            EventKind::PrEvent => self.on_pr_event(prl, event),
        }
    }

    fn on_ci_status(&self, prl: &mut PrLifecycle, event: &ExternalEvent) -> Vec<Effect> {
        let check = event.payload.text("check_name").unwrap_or("*").to_string();
        match event.payload.text("conclusion").unwrap_or_default() {
            "failure" => self.on_ci_failure(prl, check),
            "success" if check == "*" => self.on_ci_green(prl),
            _ => Vec::new(),
        }
    }

    fn on_ci_failure(&self, prl: &mut PrLifecycle, check: String) -> Vec<Effect> {
        match prl.stage {
            PrStage::CiMonitoring | PrStage::GreptileReview => {
                if prl.ci_fix_count >= prl.max_ci_fix_attempts {
                    self.escalate(
                        prl,
                        format!(
                            "CI check {check} still failing after {} fix attempts",
                            prl.ci_fix_count
                        ),
                    );
                    return Vec::new();
                }
                prl.ci_fix_count += 1;
                prl.ci_green = false;
                transition(prl, PrStage::CiFixing);
                vec![self.fix_ci(prl, check)]
            }
            PrStage::CiFixing if prl.open_tasks.len() < MAX_OPEN_CI_FIXES => {
                vec![self.fix_ci(prl, check)]
            }
            _ => {
                debug!(prl_id = prl.id, stage = %prl.stage, check = %check, "CI failure ignored");
                Vec::new()
            }
        }
    }

    fn on_ci_green(&self, prl: &mut PrLifecycle) -> Vec<Effect> {
        match prl.stage {
            PrStage::CiMonitoring => {
                prl.ci_green = true;
                transition(prl, PrStage::GreptileReview);
                let mut effects = Vec::new();
                if let Some(pr_number) = prl.pr_number {
                    effects.push(Effect::Comment {
                        pr_number,
                        body: "All CI checks passed. Requesting Greptile review.".into(),
                    });
                }
                if !prl.deferred_comments.is_empty() {
                    let bodies = std::mem::take(&mut prl.deferred_comments);
                    effects.extend(self.open_review_cycle(prl, bodies));
                }
                effects
            }
            PrStage::GreptileReview => {
                prl.ci_green = true;
                if prl.review_clean {
                    return self.mark_ready(prl);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_review_comment(&self, prl: &mut PrLifecycle, event: &ExternalEvent) -> Vec<Effect> {
        if event.source() != Some("greptile") {
            return Vec::new();
        }
        let body = event.payload.text("body").unwrap_or_default().trim().to_string();
        if body.is_empty() {
            return Vec::new();
        }
        match prl.stage {
            PrStage::GreptileReview => self.open_review_cycle(prl, vec![body]),
            PrStage::AddressingComments => {
                prl.greptile_comments_total += 1;
                let n = prl.greptile_comments_total;
                vec![self.address_comment(prl, n, &body)]
            }
            PrStage::PrCreated | PrStage::CiMonitoring | PrStage::CiFixing => {
                debug!(prl_id = prl.id, stage = %prl.stage, "review comment deferred until CI is green");
                prl.deferred_comments.push(body);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn on_pr_event(&self, prl: &mut PrLifecycle, event: &ExternalEvent) -> Vec<Effect> {
        match event.payload.text("action").unwrap_or_default() {
            "merged" => {
                if matches!(prl.stage, PrStage::ReadyForReview | PrStage::NeedsHuman) {
                    prl.open_tasks.clear();
                    transition(prl, PrStage::Merged);
                } else {
                    warn!(prl_id = prl.id, stage = %prl.stage, "merge reported outside review; ignored");
                }
                Vec::new()
            }
            "closed" => {
                if !prl.stage.is_terminal() && prl.stage != PrStage::NeedsHuman {
                    self.escalate(prl, "pull request was closed without merging".into());
                }
                Vec::new()
            }
            "review_clean" => {
                prl.review_clean = true;
                if prl.stage == PrStage::GreptileReview && prl.ci_green {
                    return self.mark_ready(prl);
                }
                Vec::new()
            }
            other => {
                debug!(prl_id = prl.id, action = other, "pr event ignored");
                Vec::new()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Open a review cycle for `bodies`, or escalate once the iteration
    /// limit is reached.
    fn open_review_cycle(&self, prl: &mut PrLifecycle, bodies: Vec<String>) -> Vec<Effect> {
        if prl.iteration >= prl.max_iterations {
            self.escalate(
                prl,
                format!(
                    "review comments still open after {} iterations",
                    prl.iteration
                ),
            );
            return Vec::new();
        }
        prl.iteration += 1;
        prl.greptile_comments_total = 0;
        prl.greptile_comments_resolved = 0;
        prl.review_clean = false;
        transition(prl, PrStage::AddressingComments);
        info!(prl_id = prl.id, iteration = prl.iteration, comments = bodies.len(), "review cycle opened");

        bodies
            .iter()
            .map(|body| {
                prl.greptile_comments_total += 1;
                let n = prl.greptile_comments_total;
                self.address_comment(prl, n, body)
            })
            .collect()
    }

    fn address_comment(&self, prl: &PrLifecycle, n: u32, body: &str) -> Effect {
        let pr = prl
            .pr_number
            .map(|n| format!(" on PR #{n}"))
            .unwrap_or_default();
        Effect::CreateTask(self.follow_up(
            prl,
            format!("[PR {}] Address Greptile #{n}", prl.title),
            format!(
                "Greptile comment{pr}:\n\n{body}\n\nFix the issue and commit on branch {}.",
                prl.branch
            ),
            TaskKind::AddressComments,
            Priority::Normal,
        ))
    }

    fn fix_ci(&self, prl: &PrLifecycle, check: String) -> Effect {
        let task = self.follow_up(
            prl,
            format!("[PR {}] Fix CI: {check}", prl.title),
            format!("CI check '{check}' failed on branch {}.", prl.branch),
            TaskKind::CiFix,
            Priority::High,
        );
        Effect::FixCi {
            check_name: check,
            branch: prl.branch.clone(),
            task,
        }
    }

    fn mark_ready(&self, prl: &mut PrLifecycle) -> Vec<Effect> {
        transition(prl, PrStage::ReadyForReview);
        prl.pr_number
            .map(|pr_number| Effect::Comment {
                pr_number,
                body: "Ready for human review. All CI checks pass and Greptile comments have been addressed.".into(),
            })
            .into_iter()
            .collect()
    }

    fn follow_up(
        &self,
        prl: &PrLifecycle,
        title: String,
        description: String,
        kind: TaskKind,
        priority: Priority,
    ) -> NewTask {
        let mut task = NewTask::new(title)
            .with_description(description)
            .with_priority(priority)
            .with_branch(prl.branch.clone());
        task.kind = kind;
        task.lifecycle_id = Some(prl.id);
        task
    }

    fn escalate(&self, prl: &mut PrLifecycle, reason: String) {
        warn!(prl_id = prl.id, stage = %prl.stage, reason = %reason, "lifecycle needs a human");
        prl.open_tasks.clear();
        prl.reason = Some(reason);
        transition(prl, PrStage::NeedsHuman);
    }

    /// A real failure pauses automation without discarding the branch or PR.
    fn reset_to_planning(&self, prl: &mut PrLifecycle, reason: String) {
        if prl.stage == PrStage::Planning || prl.stage.is_terminal() {
            return;
        }
        warn!(prl_id = prl.id, stage = %prl.stage, reason = %reason, "lifecycle reset to planning");
        prl.open_tasks.clear();
        prl.reason = Some(reason);
        transition(prl, PrStage::Planning);
    }
}

fn pr_body(prl: &PrLifecycle) -> String {
    if prl.plan.trim().is_empty() {
        format!("## {}\n\n_Created by Conductor_\n", prl.title)
    } else {
        format!("## {}\n\n{}\n\n_Created by Conductor_\n", prl.title, prl.plan)
    }
}

fn transition(prl: &mut PrLifecycle, to: PrStage) -> bool {
    if !prl.stage.can_transition_to(to) {
        warn!(prl_id = prl.id, from = %prl.stage, to = %to, "invalid stage transition");
        return false;
    }
    info!(prl_id = prl.id, from = %prl.stage, to = %to, "stage transition");
    prl.stage = to;
    true
}
