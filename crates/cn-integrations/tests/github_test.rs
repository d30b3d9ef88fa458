use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cn_core::types::EventKind;
use cn_integrations::github::client::{GhCli, GhOutput, GhRunner, ScmClient, ScmError};
use cn_integrations::github::poller::GitHubPoller;
use cn_integrations::types::{CreatePr, PrState};

// ===========================================================================
// Test helpers
// ===========================================================================

/// Answers `gh` invocations by the first two arguments, in order.
#[derive(Default)]
struct ScriptedGh {
    answers: Mutex<Vec<(String, VecDeque<GhOutput>)>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedGh {
    fn answer(self, prefix: &str, code: i32, stdout: &str) -> Self {
        let out = GhOutput {
            code,
            stdout: stdout.to_string(),
            stderr: if code == 0 { String::new() } else { "boom".into() },
        };
        {
            let mut answers = self.answers.lock().unwrap();
            match answers.iter_mut().find(|(p, _)| p == prefix) {
                Some((_, queue)) => queue.push_back(out),
                None => answers.push((prefix.to_string(), VecDeque::from([out]))),
            }
        }
        self
    }
}

#[async_trait]
impl GhRunner for ScriptedGh {
    async fn run_gh(&self, args: &[String], _cwd: Option<&Path>) -> std::io::Result<GhOutput> {
        self.calls.lock().unwrap().push(args.to_vec());
        let key = args.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
        let mut answers = self.answers.lock().unwrap();
        let Some((_, queue)) = answers.iter_mut().find(|(p, _)| *p == key) else {
            return Ok(GhOutput {
                code: 1,
                stdout: String::new(),
                stderr: format!("unscripted: {key}"),
            });
        };
        // The last answer repeats.
        let out = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        };
        Ok(out)
    }
}

fn cli(gh: ScriptedGh) -> (Arc<GhCli>, Arc<ScriptedGh>) {
    let gh = Arc::new(gh);
    let runner: Box<dyn GhRunner> = Box::new(SharedGh(gh.clone()));
    (
        Arc::new(GhCli::with_runner(runner, Some("acme/app".into()))),
        gh,
    )
}

struct SharedGh(Arc<ScriptedGh>);

#[async_trait]
impl GhRunner for SharedGh {
    async fn run_gh(&self, args: &[String], cwd: Option<&Path>) -> std::io::Result<GhOutput> {
        self.0.run_gh(args, cwd).await
    }
}

const OPEN_NO_REVIEWS: &str = r#"{"state":"OPEN","reviews":[],"comments":[]}"#;

// ===========================================================================
// GhCli
// ===========================================================================

#[tokio::test]
async fn failing_checks_exit_code_still_parses() {
    let (cli, gh) = cli(ScriptedGh::default().answer(
        "pr checks",
        1,
        r#"[{"name":"test","state":"FAILURE","bucket":"fail","completedAt":"2026-03-01T10:00:00Z"}]"#,
    ));
    let checks = cli.pr_checks(42).await.unwrap();
    assert_eq!(checks.len(), 1);
    assert_eq!(checks[0].bucket.conclusion(), "failure");

    let calls = gh.calls.lock().unwrap();
    assert_eq!(
        calls[0],
        vec![
            "pr", "checks", "42", "--json", "name,state,bucket,completedAt", "--repo", "acme/app"
        ]
    );
}

#[tokio::test]
async fn command_failure_carries_stderr() {
    let (cli, _gh) = cli(ScriptedGh::default().answer("pr view", 4, ""));
    match cli.pr_activity(9).await {
        Err(ScmError::Command { code, stderr, .. }) => {
            assert_eq!(code, 4);
            assert_eq!(stderr, "boom");
        }
        other => panic!("expected command error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_pr_returns_number_from_url() {
    let (cli, gh) = cli(ScriptedGh::default().answer(
        "pr create",
        0,
        "https://github.com/acme/app/pull/310\n",
    ));
    let number = cli
        .create_pr(
            &CreatePr {
                title: "Speed up search".into(),
                body: "## Speed up search".into(),
                head: "feat/search".into(),
                base: "main".into(),
            },
            None,
        )
        .await
        .unwrap();
    assert_eq!(number, 310);
    let calls = gh.calls.lock().unwrap();
    assert!(calls[0].windows(2).any(|w| w == ["--head", "feat/search"]));
}

#[tokio::test]
async fn failed_check_log_picks_matching_run() {
    let (cli, gh) = cli(
        ScriptedGh::default()
            .answer(
                "run list",
                0,
                r#"[{"databaseId":11,"name":"lint","conclusion":"success","headBranch":"feat/x"},
                    {"databaseId":12,"name":"unit tests","conclusion":"failure","headBranch":"feat/x"}]"#,
            )
            .answer("run view", 0, "assertion failed: left == right"),
    );
    let log = cli.failed_check_log("feat/x", "unit").await.unwrap();
    assert_eq!(log.as_deref(), Some("assertion failed: left == right"));
    let calls = gh.calls.lock().unwrap();
    assert_eq!(calls[1][2], "12");
}

#[tokio::test]
async fn open_prs_are_listed() {
    let (cli, _gh) = cli(ScriptedGh::default().answer(
        "pr list",
        0,
        r#"[{"number":5,"title":"A","headRefName":"feat/a","state":"OPEN"}]"#,
    ));
    let prs = cli.list_open_prs().await.unwrap();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].state, PrState::Open);
}

// ===========================================================================
// GitHubPoller
// ===========================================================================

#[tokio::test]
async fn green_checks_emit_stable_summary() {
    let (cli, _gh) = cli(
        ScriptedGh::default()
            .answer(
                "pr checks",
                0,
                r#"[{"name":"build","state":"SUCCESS","bucket":"pass","completedAt":"2026-03-01T10:00:00Z"},
                    {"name":"lint","state":"SUCCESS","bucket":"pass","completedAt":"2026-03-01T10:02:00Z"}]"#,
            )
            .answer("pr view", 0, OPEN_NO_REVIEWS),
    );
    let poller = GitHubPoller::new(cli, "greptile");

    let events = poller.poll(&[42]).await;
    let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "ci:42:build:success:2026-03-01T10:00:00Z",
            "ci:42:lint:success:2026-03-01T10:02:00Z",
            "ci:42:*:success:2026-03-01T10:02:00Z",
        ]
    );
    assert!(events.iter().all(|e| e.kind == EventKind::CiStatus));
    assert_eq!(events[2].payload.text("check_name"), Some("*"));

    // Same state on the next poll is offered again under the same ids, so a
    // submission that failed last time gets another chance.
    let again: Vec<_> = poller.poll(&[42]).await.into_iter().map(|e| e.id).collect();
    assert_eq!(again, ids);
}

#[tokio::test]
async fn pending_checks_hold_back_summary() {
    let (cli, _gh) = cli(
        ScriptedGh::default()
            .answer(
                "pr checks",
                8,
                r#"[{"name":"build","state":"SUCCESS","bucket":"pass","completedAt":"2026-03-01T10:00:00Z"},
                    {"name":"e2e","state":"IN_PROGRESS","bucket":"pending"}]"#,
            )
            .answer("pr view", 0, OPEN_NO_REVIEWS),
    );
    let poller = GitHubPoller::new(cli, "greptile");
    let events = poller.poll(&[42]).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload.text("check_name"), Some("build"));
}

#[tokio::test]
async fn reviewer_comments_are_tagged_by_source() {
    let (cli, _gh) = cli(
        ScriptedGh::default()
            .answer("pr checks", 0, "[]")
            .answer(
                "pr view",
                0,
                r#"{"state":"OPEN",
                    "reviews":[
                        {"id":"PRR_1","author":{"login":"greptile-apps[bot]"},"body":"Possible null deref in parse()","state":"COMMENTED"},
                        {"id":"PRR_2","author":{"login":"greptile-apps[bot]"},"body":"","state":"APPROVED"},
                        {"id":"PRR_3","author":{"login":"octocat"},"body":"","state":"COMMENTED"}
                    ],
                    "comments":[{"id":"IC_9","author":{"login":"octocat"},"body":"lgtm once CI passes"}]}"#,
            ),
    );
    let poller = GitHubPoller::new(cli, "Greptile");
    let events = poller.poll(&[7]).await;

    let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["review:7:PRR_1", "pr:7:review_clean:PRR_2", "comment:7:IC_9"]
    );
    assert_eq!(events[0].source(), Some("greptile"));
    assert_eq!(events[0].pr_number(), Some(7));
    assert_eq!(events[1].kind, EventKind::PrEvent);
    assert_eq!(events[1].payload.text("action"), Some("review_clean"));
    assert_eq!(events[2].source(), Some("human"));
}

#[tokio::test]
async fn merged_pr_emits_pr_event() {
    let (cli, _gh) = cli(
        ScriptedGh::default()
            .answer("pr checks", 0, "[]")
            .answer("pr view", 0, r#"{"state":"MERGED","reviews":[],"comments":[]}"#),
    );
    let poller = GitHubPoller::new(cli, "greptile");
    let events = poller.poll(&[3]).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, "pr:3:merged");
    assert_eq!(events[0].payload.text("action"), Some("merged"));
}

#[tokio::test]
async fn one_broken_pr_does_not_stop_the_poll() {
    let (cli, _gh) = cli(
        ScriptedGh::default()
            .answer("pr checks", 0, "not json")
            .answer("pr view", 0, r#"{"state":"CLOSED","reviews":[],"comments":[]}"#),
    );
    let poller = GitHubPoller::new(cli, "greptile");
    let events = poller.poll(&[1, 2]).await;
    let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["pr:1:closed", "pr:2:closed"]);
}
