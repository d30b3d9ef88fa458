use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use crate::types::{CheckRun, CreatePr, PrActivity, PrSummary, WorkflowRun};

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("failed to run gh: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("gh {args} exited with {code}: {stderr}")]
    Command {
        args: String,
        code: i32,
        stderr: String,
    },

    #[error("unexpected gh output for {context}: {detail}")]
    Parse { context: String, detail: String },
}

pub type Result<T> = std::result::Result<T, ScmError>;

// ---------------------------------------------------------------------------
// Process seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GhOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one `gh` invocation. Swapped out in tests.
#[async_trait]
pub trait GhRunner: Send + Sync {
    async fn run_gh(&self, args: &[String], cwd: Option<&Path>) -> std::io::Result<GhOutput>;
}

/// Spawns the real `gh` binary.
#[derive(Debug, Clone)]
pub struct TokioGhRunner {
    program: String,
}

impl Default for TokioGhRunner {
    fn default() -> Self {
        Self {
            program: "gh".into(),
        }
    }
}

impl TokioGhRunner {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl GhRunner for TokioGhRunner {
    async fn run_gh(&self, args: &[String], cwd: Option<&Path>) -> std::io::Result<GhOutput> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let out = cmd.output().await?;
        Ok(GhOutput {
            code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// ScmClient
// ---------------------------------------------------------------------------

/// Operations the PR pipeline and the poller need from source control.
#[async_trait]
pub trait ScmClient: Send + Sync {
    async fn list_open_prs(&self) -> Result<Vec<PrSummary>>;

    async fn pr_checks(&self, pr_number: u64) -> Result<Vec<CheckRun>>;

    async fn pr_activity(&self, pr_number: u64) -> Result<PrActivity>;

    /// Log of the most recent failed run whose name contains `check_name`.
    async fn failed_check_log(&self, branch: &str, check_name: &str) -> Result<Option<String>>;

    /// Open a PR and return its number.
    async fn create_pr(&self, request: &CreatePr, cwd: Option<&Path>) -> Result<u64>;

    async fn comment_on_pr(&self, pr_number: u64, body: &str) -> Result<()>;
}

/// [`ScmClient`] backed by the `gh` CLI.
pub struct GhCli {
    runner: Box<dyn GhRunner>,
    repo: Option<String>,
}

impl GhCli {
    /// `repo` is `owner/name`; when `None`, `gh` infers it from the working directory.
    pub fn new(repo: Option<String>) -> Self {
        Self::with_runner(Box::new(TokioGhRunner::default()), repo)
    }

    pub fn with_runner(runner: Box<dyn GhRunner>, repo: Option<String>) -> Self {
        Self { runner, repo }
    }

    pub fn repo(&self) -> Option<&str> {
        self.repo.as_deref()
    }

    fn args(&self, base: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = base.iter().map(|s| s.to_string()).collect();
        if let Some(repo) = &self.repo {
            args.push("--repo".into());
            args.push(repo.clone());
        }
        args
    }

    async fn run(&self, args: Vec<String>, cwd: Option<&Path>, ok_codes: &[i32]) -> Result<String> {
        debug!(args = %args.join(" "), "gh");
        let out = self.runner.run_gh(&args, cwd).await?;
        if out.code == 0 || ok_codes.contains(&out.code) {
            return Ok(out.stdout);
        }
        Err(ScmError::Command {
            args: args.join(" "),
            code: out.code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

fn parse_json<T: DeserializeOwned>(context: &str, raw: &str) -> Result<T> {
    let raw = raw.trim();
    let raw = if raw.is_empty() { "null" } else { raw };
    serde_json::from_str(raw).map_err(|e| ScmError::Parse {
        context: context.to_string(),
        detail: e.to_string(),
    })
}

/// `gh pr create` prints the PR URL; the number is its last path segment.
pub fn parse_pr_url(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.contains("/pull/"))
        .and_then(|url| url.rsplit('/').next())
        .and_then(|n| n.parse().ok())
}

#[async_trait]
impl ScmClient for GhCli {
    async fn list_open_prs(&self) -> Result<Vec<PrSummary>> {
        let args = self.args(&[
            "pr",
            "list",
            "--state",
            "open",
            "--json",
            "number,title,headRefName,state",
        ]);
        let raw = self.run(args, None, &[]).await?;
        let prs: Option<Vec<PrSummary>> = parse_json("pr list", &raw)?;
        Ok(prs.unwrap_or_default())
    }

    async fn pr_checks(&self, pr_number: u64) -> Result<Vec<CheckRun>> {
        let n = pr_number.to_string();
        let args = self.args(&[
            "pr",
            "checks",
            &n,
            "--json",
            "name,state,bucket,completedAt",
        ]);
        // gh exits 1 when a check failed and 8 while checks are pending; the
        // JSON on stdout is still complete.
        let raw = self.run(args, None, &[1, 8]).await?;
        let checks: Option<Vec<CheckRun>> = parse_json("pr checks", &raw)?;
        Ok(checks.unwrap_or_default())
    }

    async fn pr_activity(&self, pr_number: u64) -> Result<PrActivity> {
        let n = pr_number.to_string();
        let args = self.args(&["pr", "view", &n, "--json", "state,reviews,comments"]);
        let raw = self.run(args, None, &[]).await?;
        parse_json("pr view", &raw)
    }

    async fn failed_check_log(&self, branch: &str, check_name: &str) -> Result<Option<String>> {
        let args = self.args(&[
            "run",
            "list",
            "--branch",
            branch,
            "--json",
            "databaseId,name,conclusion,headBranch",
            "--limit",
            "10",
        ]);
        let raw = self.run(args, None, &[]).await?;
        let runs: Option<Vec<WorkflowRun>> = parse_json("run list", &raw)?;
        let Some(run) = runs
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.conclusion == "failure" && r.name.contains(check_name))
        else {
            return Ok(None);
        };

        let id = run.database_id.to_string();
        let args = self.args(&["run", "view", &id, "--log-failed"]);
        let log = self.run(args, None, &[]).await?;
        Ok(Some(log))
    }

    async fn create_pr(&self, request: &CreatePr, cwd: Option<&Path>) -> Result<u64> {
        let args = self.args(&[
            "pr",
            "create",
            "--title",
            &request.title,
            "--body",
            &request.body,
            "--head",
            &request.head,
            "--base",
            &request.base,
        ]);
        let raw = self.run(args, cwd, &[]).await?;
        let number = parse_pr_url(&raw).ok_or_else(|| ScmError::Parse {
            context: "pr create".into(),
            detail: format!("no PR URL in output: {}", raw.trim()),
        })?;
        info!(pr_number = number, branch = %request.head, "pull request created");
        Ok(number)
    }

    async fn comment_on_pr(&self, pr_number: u64, body: &str) -> Result<()> {
        let n = pr_number.to_string();
        let args = self.args(&["pr", "comment", &n, "--body", body]);
        self.run(args, None, &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_number_from_create_output() {
        let out = "Creating pull request for feat/x into main in acme/app\n\nhttps://github.com/acme/app/pull/118\n";
        assert_eq!(parse_pr_url(out), Some(118));
        assert_eq!(parse_pr_url("warning: nothing here"), None);
    }

    #[test]
    fn empty_output_parses_as_none() {
        let parsed: Option<Vec<CheckRun>> = parse_json("pr checks", "  \n").unwrap();
        assert!(parsed.is_none());
        assert!(parse_json::<PrActivity>("pr view", "{").is_err());
    }
}
