use std::fmt;
use std::path::{Component, Path, PathBuf};

use cn_core::config::{expand_home, GuardrailsConfig};
use cn_core::git::DiffStats;
use cn_core::types::TaskId;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::error;
use wildmatch::WildMatch;

/// Offending input is cut to this many characters before it is recorded.
const MAX_DETAIL_CHARS: usize = 200;

/// Substrings that mark a stream-json tool call as a shell invocation.
const SHELL_TOOL_MARKERS: &[&str] = &["shell", "terminal", "exec", "command", "bash", "run_command"];

/// Argument keys that carry a filesystem path in agent tool calls.
const PATH_KEYS: &[&str] = &["path", "file_path", "absolute_path", "directory", "dir_path"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GuardrailError {
    #[error("invalid command pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// ---------------------------------------------------------------------------
// Violation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailRule {
    BranchProtection,
    PathSandbox,
    WorkspaceScope,
    ForcePush,
    RecursiveDeleteRoot,
    RecursiveDeleteHome,
    InsecurePermissions,
    PipeToShell,
    DiffFileLimit,
    DiffLineLimit,
}

impl fmt::Display for GuardrailRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GuardrailRule::BranchProtection => "branch_protection",
            GuardrailRule::PathSandbox => "path_sandbox",
            GuardrailRule::WorkspaceScope => "workspace_scope",
            GuardrailRule::ForcePush => "force_push",
            GuardrailRule::RecursiveDeleteRoot => "recursive_delete_root",
            GuardrailRule::RecursiveDeleteHome => "recursive_delete_home",
            GuardrailRule::InsecurePermissions => "insecure_permissions",
            GuardrailRule::PipeToShell => "pipe_to_shell",
            GuardrailRule::DiffFileLimit => "diff_file_limit",
            GuardrailRule::DiffLineLimit => "diff_line_limit",
        };
        f.write_str(label)
    }
}

/// A denied action. The `Display` form is the reason recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("guardrail {rule}: {detail}")]
pub struct GuardrailViolation {
    pub rule: GuardrailRule,
    pub detail: String,
}

impl GuardrailViolation {
    fn new(rule: GuardrailRule, detail: impl Into<String>) -> Self {
        let violation = Self {
            rule,
            detail: truncate(&detail.into(), MAX_DETAIL_CHARS),
        };
        error!(rule = %violation.rule, detail = %violation.detail, "guardrail violation");
        violation
    }
}

/// Allow (`Ok`) or deny with a reason.
pub type Verdict = Result<(), GuardrailViolation>;

/// One thing an agent is about to do, or has done.
#[derive(Debug, Clone)]
pub enum ProposedAction<'a> {
    Branch(&'a str),
    Path { path: &'a Path, workspace: &'a Path },
    OutputLine { line: &'a str, workspace: &'a Path },
    Diff(DiffStats),
}

// ===========================================================================
// GuardrailGate
// ===========================================================================

/// Stateless safety checks over proposed agent actions.
///
/// Each check is a pure function of its input and the loaded settings;
/// [`GuardrailGate::evaluate`] chains them so that every one must pass.
#[derive(Debug)]
pub struct GuardrailGate {
    protected_branches: Vec<WildMatch>,
    blocked_prefixes: Vec<PathBuf>,
    blocked_globs: Vec<WildMatch>,
    command_rules: Vec<(Regex, GuardrailRule)>,
    max_files_changed: u64,
    max_lines_changed: u64,
    protected_names: Vec<String>,
    blocked_names: Vec<String>,
}

impl GuardrailGate {
    pub fn new(settings: &GuardrailsConfig) -> Result<Self, GuardrailError> {
        let mut command_patterns: Vec<(&str, GuardrailRule)> = vec![
            (r"rm\s+-rf\s+/", GuardrailRule::RecursiveDeleteRoot),
            (r"rm\s+-rf\s+~/", GuardrailRule::RecursiveDeleteHome),
            (r"chmod\s+-R\s+777", GuardrailRule::InsecurePermissions),
            (r"curl\s+.*\|\s*(ba)?sh\b", GuardrailRule::PipeToShell),
            (r"wget\s+.*\|\s*(ba)?sh\b", GuardrailRule::PipeToShell),
        ];
        if settings.block_force_push {
            command_patterns.extend([
                (r"git\s+push\s+.*--force", GuardrailRule::ForcePush),
                (r"git\s+push\s+(.*\s)?-f\b", GuardrailRule::ForcePush),
            ]);
        }
        let command_rules = command_patterns
            .into_iter()
            .map(|(pattern, rule)| {
                Regex::new(pattern)
                    .map(|re| (re, rule))
                    .map_err(|source| GuardrailError::Pattern {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (globs, prefixes): (Vec<&String>, Vec<&String>) = settings
            .blocked_paths
            .iter()
            .partition(|p| p.contains('*') || p.contains('?'));

        Ok(Self {
            protected_branches: settings
                .protected_branches
                .iter()
                .map(|p| WildMatch::new(p))
                .collect(),
            blocked_prefixes: prefixes
                .into_iter()
                .map(|p| normalize(&expand_home(p)))
                .collect(),
            blocked_globs: globs
                .into_iter()
                .map(|p| WildMatch::new(&expand_home(p).to_string_lossy()))
                .collect(),
            command_rules,
            max_files_changed: settings.max_files_changed,
            max_lines_changed: settings.max_lines_changed,
            protected_names: settings.protected_branches.clone(),
            blocked_names: settings.blocked_paths.clone(),
        })
    }

    /// Run every check that applies to each action. The first denial wins.
    pub fn evaluate(&self, actions: &[ProposedAction<'_>]) -> Verdict {
        for action in actions {
            match action {
                ProposedAction::Branch(branch) => self.check_branch(branch)?,
                ProposedAction::Path { path, workspace } => {
                    self.check_path(path)?;
                    self.check_scope(path, workspace)?;
                }
                ProposedAction::OutputLine { line, workspace } => {
                    self.scan_line(line, workspace)?
                }
                ProposedAction::Diff(stats) => self.check_diff(stats)?,
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Branch protection
    // -----------------------------------------------------------------------

    pub fn is_protected(&self, branch: &str) -> bool {
        !branch.is_empty() && self.protected_branches.iter().any(|m| m.matches(branch))
    }

    pub fn check_branch(&self, branch: &str) -> Verdict {
        if self.is_protected(branch) {
            return Err(GuardrailViolation::new(
                GuardrailRule::BranchProtection,
                format!("branch `{branch}` is protected"),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Path sandbox
    // -----------------------------------------------------------------------

    pub fn check_path(&self, path: &Path) -> Verdict {
        let path = normalize(&expand_home(&path.to_string_lossy()));
        let hit_prefix = self.blocked_prefixes.iter().any(|b| path.starts_with(b));
        let text = path.to_string_lossy();
        let hit_glob = self.blocked_globs.iter().any(|g| g.matches(&text));
        if hit_prefix || hit_glob {
            return Err(GuardrailViolation::new(
                GuardrailRule::PathSandbox,
                format!("access to blocked path {}", path.display()),
            ));
        }
        Ok(())
    }

    /// Deny paths that resolve outside `workspace`. Relative paths are taken
    /// relative to the workspace root.
    pub fn check_scope(&self, path: &Path, workspace: &Path) -> Verdict {
        let root = normalize(workspace);
        let expanded = expand_home(&path.to_string_lossy());
        let resolved = if expanded.is_absolute() {
            normalize(&expanded)
        } else {
            normalize(&root.join(expanded))
        };
        if !resolved.starts_with(&root) {
            return Err(GuardrailViolation::new(
                GuardrailRule::WorkspaceScope,
                format!(
                    "path {} is outside workspace {}",
                    resolved.display(),
                    root.display()
                ),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Output scanning
    // -----------------------------------------------------------------------

    /// Check a shell command against the destructive-command signatures.
    pub fn check_command(&self, command: &str) -> Verdict {
        for (re, rule) in &self.command_rules {
            if re.is_match(command) {
                return Err(GuardrailViolation::new(*rule, command));
            }
        }
        Ok(())
    }

    /// Inspect one line of agent output.
    ///
    /// Stream-json tool calls are checked when the tool looks like a shell
    /// (its command) and whenever it names a path (sandbox and scope).
    /// Plain lines are only treated as commands when they start with a
    /// prompt marker (`$` or `>`).
    pub fn scan_line(&self, line: &str, workspace: &Path) -> Verdict {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(serde_json::Value::Object(event)) = serde_json::from_str(trimmed) {
                return self.scan_tool_event(&event, workspace);
            }
            return Ok(());
        }
        if let Some(cmd) = trimmed
            .strip_prefix('$')
            .or_else(|| trimmed.strip_prefix('>'))
        {
            return self.check_command(cmd.trim());
        }
        Ok(())
    }

    fn scan_tool_event(
        &self,
        event: &serde_json::Map<String, serde_json::Value>,
        workspace: &Path,
    ) -> Verdict {
        let tool = ["tool_name", "tool", "name"]
            .iter()
            .find_map(|k| event.get(*k).and_then(|v| v.as_str()))
            .unwrap_or_default()
            .to_lowercase();
        let args = ["parameters", "input", "args", "arguments"]
            .iter()
            .find_map(|k| event.get(*k));
        let Some(args) = args else {
            return Ok(());
        };

        if SHELL_TOOL_MARKERS.iter().any(|m| tool.contains(m)) {
            let text = match args.get("command").and_then(|v| v.as_str()) {
                Some(cmd) => cmd.to_string(),
                None => args.to_string(),
            };
            self.check_command(&text)?;
        }

        for key in PATH_KEYS {
            if let Some(p) = args.get(*key).and_then(|v| v.as_str()) {
                let path = workspace.join(expand_home(p));
                self.check_path(&path)?;
                self.check_scope(&path, workspace)?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Diff limits
    // -----------------------------------------------------------------------

    pub fn check_diff(&self, stats: &DiffStats) -> Verdict {
        if stats.files_changed > self.max_files_changed {
            return Err(GuardrailViolation::new(
                GuardrailRule::DiffFileLimit,
                format!(
                    "{} files changed, limit is {}",
                    stats.files_changed, self.max_files_changed
                ),
            ));
        }
        if stats.lines_changed() > self.max_lines_changed {
            return Err(GuardrailViolation::new(
                GuardrailRule::DiffLineLimit,
                format!(
                    "{} lines changed, limit is {}",
                    stats.lines_changed(),
                    self.max_lines_changed
                ),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Preamble
    // -----------------------------------------------------------------------

    /// Safety instructions prepended to every agent prompt.
    pub fn preamble(&self, workspace: &Path, task_id: TaskId) -> String {
        let mut out = String::from("Operating rules for this task:\n");
        out.push_str(&format!(
            "- Work only inside {}. Do not read or write files anywhere else.\n",
            workspace.display()
        ));
        if !self.blocked_names.is_empty() {
            out.push_str(&format!(
                "- Never open these paths: {}.\n",
                self.blocked_names.join(", ")
            ));
        }
        if !self.protected_names.is_empty() {
            out.push_str(&format!(
                "- Never commit or push to these branches: {}.\n",
                self.protected_names.join(", ")
            ));
        }
        out.push_str("- Never force push.\n");
        out.push_str(&format!(
            "- End every commit message with [conductor:task-{task_id}].\n"
        ));
        out.push_str("- Do not delete files outside the project.\n");
        out.push_str("- Do not change system configuration.\n\n");
        out
    }
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_parent_segments() {
        assert_eq!(
            normalize(Path::new("/w/repo/src/../../etc")),
            PathBuf::from("/w/etc")
        );
        assert_eq!(normalize(Path::new("/w/./a")), PathBuf::from("/w/a"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(300);
        assert_eq!(truncate(&s, 200).chars().count(), 200);
        assert_eq!(truncate("short", 200), "short");
    }
}
