//! Turns PR state observed through [`ScmClient`] into [`ExternalEvent`]s.
//!
//! Every event carries an id derived from what it describes (PR, check,
//! conclusion, completion time, review id), so polling the same state twice
//! yields the same ids and the coordinator's durable duplicate suppression
//! drops the repeats. The poller keeps no memory of its own, so an event whose
//! submission failed is offered again on the next poll. A re-run check
//! completes at a new time and therefore produces a new event.

use std::sync::Arc;

use cn_core::types::{EventKind, ExternalEvent, Payload};
use tracing::warn;

use crate::github::client::ScmClient;
use crate::types::{CheckBucket, CheckRun, PrActivity, PrState};

pub struct GitHubPoller {
    scm: Arc<dyn ScmClient>,
    /// Lower-cased substring identifying the automated reviewer's login.
    reviewer_login: String,
}

impl GitHubPoller {
    pub fn new(scm: Arc<dyn ScmClient>, reviewer_login: impl Into<String>) -> Self {
        Self {
            scm,
            reviewer_login: reviewer_login.into().to_lowercase(),
        }
    }

    /// Poll every PR in `prs` once. Errors for one PR are logged and skipped.
    pub async fn poll(&self, prs: &[u64]) -> Vec<ExternalEvent> {
        let mut events = Vec::new();
        for &pr in prs {
            match self.scm.pr_checks(pr).await {
                Ok(checks) => events.extend(check_events(pr, &checks)),
                Err(e) => warn!(pr_number = pr, error = %e, "failed to fetch checks"),
            }
            match self.scm.pr_activity(pr).await {
                Ok(activity) => events.extend(self.activity_events(pr, &activity)),
                Err(e) => warn!(pr_number = pr, error = %e, "failed to fetch reviews"),
            }
        }
        events
    }

    pub fn is_reviewer(&self, login: &str) -> bool {
        !self.reviewer_login.is_empty() && login.to_lowercase().contains(&self.reviewer_login)
    }

    fn source_of(&self, login: &str) -> &'static str {
        if self.is_reviewer(login) {
            "greptile"
        } else {
            "human"
        }
    }

    fn activity_events(&self, pr: u64, activity: &PrActivity) -> Vec<ExternalEvent> {
        let mut events = Vec::new();

        for review in &activity.reviews {
            let from_reviewer = self.is_reviewer(&review.author.login);
            if from_reviewer && review.state == "APPROVED" {
                events.push(ExternalEvent::new(
                    format!("pr:{pr}:review_clean:{}", review.id),
                    EventKind::PrEvent,
                    Payload::new()
                        .with("pr_number", pr)
                        .with("action", "review_clean")
                        .with("author", review.author.login.as_str()),
                ));
            }
            if review.body.trim().is_empty() {
                continue;
            }
            events.push(ExternalEvent::new(
                format!("review:{pr}:{}", review.id),
                EventKind::ReviewComment,
                Payload::new()
                    .with("pr_number", pr)
                    .with("comment_id", review.id.as_str())
                    .with("author", review.author.login.as_str())
                    .with("body", review.body.as_str())
                    .with("state", review.state.as_str())
                    .with("source", self.source_of(&review.author.login)),
            ));
        }

        for comment in &activity.comments {
            if comment.body.trim().is_empty() {
                continue;
            }
            events.push(ExternalEvent::new(
                format!("comment:{pr}:{}", comment.id),
                EventKind::ReviewComment,
                Payload::new()
                    .with("pr_number", pr)
                    .with("comment_id", comment.id.as_str())
                    .with("author", comment.author.login.as_str())
                    .with("body", comment.body.as_str())
                    .with("source", self.source_of(&comment.author.login)),
            ));
        }

        let action = match activity.state {
            PrState::Merged => Some("merged"),
            PrState::Closed => Some("closed"),
            PrState::Open => None,
        };
        if let Some(action) = action {
            events.push(ExternalEvent::new(
                format!("pr:{pr}:{action}"),
                EventKind::PrEvent,
                Payload::new().with("pr_number", pr).with("action", action),
            ));
        }
        events
    }
}

/// One event per completed check, plus an all-green summary with
/// `check_name = "*"` once every check has passed.
pub fn check_events(pr: u64, checks: &[CheckRun]) -> Vec<ExternalEvent> {
    let mut events = Vec::new();
    for check in checks {
        if matches!(check.bucket, CheckBucket::Pending | CheckBucket::Unknown) {
            continue;
        }
        let conclusion = check.bucket.conclusion();
        let completed = check.completed_at.as_deref().unwrap_or_default();
        events.push(ExternalEvent::new(
            format!("ci:{pr}:{}:{conclusion}:{completed}", check.name),
            EventKind::CiStatus,
            Payload::new()
                .with("pr_number", pr)
                .with("check_name", check.name.as_str())
                .with("conclusion", conclusion)
                .with("state", check.state.as_str()),
        ));
    }

    let all_green = !checks.is_empty() && checks.iter().all(|c| c.bucket.conclusion() == "success");
    if all_green {
        let latest = checks
            .iter()
            .filter_map(|c| c.completed_at.as_deref())
            .max()
            .unwrap_or_default();
        events.push(ExternalEvent::new(
            format!("ci:{pr}:*:success:{latest}"),
            EventKind::CiStatus,
            Payload::new()
                .with("pr_number", pr)
                .with("check_name", "*")
                .with("conclusion", "success"),
        ));
    }
    events
}
