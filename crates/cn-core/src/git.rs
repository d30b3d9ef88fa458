use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::types::Snapshot;

/// Ref that keeps the latest snapshot's stash commit alive.
pub const SNAPSHOT_REF: &str = "refs/conductor/snapshot";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(String),
    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },
}

pub type Result<T> = std::result::Result<T, GitError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    /// Run a git command in the given directory.
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// DiffStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
}

impl DiffStats {
    pub fn lines_changed(&self) -> u64 {
        self.lines_added + self.lines_removed
    }
}

/// Parse `git diff --numstat` output. Binary files count as changed files
/// with no line delta.
pub fn parse_numstat(text: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut cols = line.split('\t');
        let added = cols.next().and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
        let removed = cols.next().and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
        stats.files_changed += 1;
        stats.lines_added += added;
        stats.lines_removed += removed;
    }
    stats
}

// ---------------------------------------------------------------------------
// WorkspaceGit
// ---------------------------------------------------------------------------

/// Snapshot, restore and inspection of a working copy through a [`GitRunner`].
///
/// All methods block; async callers go through `spawn_blocking`.
pub struct WorkspaceGit {
    git: Box<dyn GitRunner>,
}

impl Default for WorkspaceGit {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceGit {
    pub fn new() -> Self {
        Self {
            git: Box::new(RealGitRunner),
        }
    }

    pub fn with_git_runner(git: Box<dyn GitRunner>) -> Self {
        Self { git }
    }

    fn run(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let out = self.git.run_git(dir, args).map_err(GitError::Spawn)?;
        if out.success {
            Ok(out)
        } else {
            Err(GitError::Command {
                args: args.join(" "),
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Record HEAD and capture uncommitted work (including untracked files)
    /// as a stash commit. The work is put straight back, so the agent starts
    /// from the tree the user left. The stash commit is kept reachable through
    /// [`SNAPSHOT_REF`] rather than the stash list, which stays as it was.
    pub fn snapshot(&self, dir: &Path) -> Result<Snapshot> {
        let head = self.run(dir, &["rev-parse", "HEAD"])?.stdout.trim().to_string();
        let pushed = self.run(
            dir,
            &["stash", "push", "--include-untracked", "-m", "conductor-snapshot"],
        )?;
        let stash = if pushed.stdout.contains("No local changes to save") {
            None
        } else {
            let sha = self
                .run(dir, &["rev-parse", "stash@{0}"])?
                .stdout
                .trim()
                .to_string();
            self.run(dir, &["stash", "apply", &sha])?;
            self.run(dir, &["update-ref", SNAPSHOT_REF, &sha])?;
            self.run(dir, &["stash", "drop", "stash@{0}"])?;
            Some(sha)
        };
        info!(
            dir = %dir.display(),
            head = %short(&head),
            has_stash = stash.is_some(),
            "workspace snapshot created"
        );
        Ok(Snapshot {
            head,
            stash,
            taken_at: Utc::now(),
        })
    }

    /// Discard everything done since `snapshot` was taken, committed or not.
    pub fn restore(&self, dir: &Path, snapshot: &Snapshot) -> Result<()> {
        self.run(dir, &["reset", "--hard", &snapshot.head])?;
        self.run(dir, &["clean", "-fd"])?;
        if let Some(stash) = &snapshot.stash {
            self.run(dir, &["stash", "apply", stash])?;
        }
        info!(dir = %dir.display(), head = %short(&snapshot.head), "workspace restored");
        Ok(())
    }

    /// Check out `branch`, creating it when it does not exist yet.
    pub fn checkout(&self, dir: &Path, branch: &str) -> Result<()> {
        if let Err(e) = self.run(dir, &["fetch", "origin"]) {
            debug!(error = %e, "fetch before checkout failed, continuing");
        }
        if self.run(dir, &["checkout", branch]).is_err() {
            self.run(dir, &["checkout", "-b", branch])?;
        }
        Ok(())
    }

    /// Changes relative to `base`, including uncommitted work.
    pub fn diff_stats(&self, dir: &Path, base: &str) -> Result<DiffStats> {
        let out = self.run(dir, &["diff", "--numstat", base])?;
        Ok(parse_numstat(&out.stdout))
    }

    pub fn is_dirty(&self, dir: &Path) -> Result<bool> {
        let out = self.run(dir, &["status", "--porcelain"])?;
        Ok(!out.stdout.trim().is_empty())
    }

    pub fn current_branch(&self, dir: &Path) -> Result<String> {
        let out = self.run(dir, &["branch", "--show-current"])?;
        Ok(out.stdout.trim().to_string())
    }
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
