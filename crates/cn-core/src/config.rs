use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `~/.conductor/config.toml`.
///
/// Credentials are never stored here. The agent binary and the `gh` CLI read
/// their own tokens from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub workspaces: WorkspacesConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub guardrails: GuardrailsConfig,
    #[serde(default)]
    pub pr_pipeline: PrPipelineConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load config from `~/.conductor/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota.validate()?;
        self.guardrails.validate()?;
        self.agents.validate()?;
        if self.pr_pipeline.max_review_iterations == 0 {
            return Err(ConfigError::Validation(
                "pr_pipeline.max_review_iterations must be at least 1".into(),
            ));
        }
        if self.daemon.tick_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "daemon.tick_interval_ms must be positive".into(),
            ));
        }
        if self.workspaces.prefix.is_empty() {
            return Err(ConfigError::Validation(
                "workspaces.prefix must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        conductor_home().join("config.toml")
    }
}

/// `~/.conductor`, or `./.conductor` when no home directory is known.
pub fn conductor_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".conductor")
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => Path::new(path).to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_path: default_database_path(),
            api_bind: default_api_bind(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_database_path() -> String {
    "~/.conductor/conductor.db".into()
}
fn default_api_bind() -> String {
    "127.0.0.1:8420".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspacesConfig {
    /// Directory scanned for working copies.
    #[serde(default = "default_workspace_root")]
    pub root: String,
    /// Only directories whose name starts with this prefix are registered.
    #[serde(default = "default_workspace_prefix")]
    pub prefix: String,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            root: default_workspace_root(),
            prefix: default_workspace_prefix(),
        }
    }
}

fn default_workspace_root() -> String {
    "~".into()
}
fn default_workspace_prefix() -> String {
    "workspace-".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Agent binary to launch.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Flag that precedes the prompt argument.
    #[serde(default = "default_prompt_flag")]
    pub prompt_flag: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Fixed wait before relaunching after a rate-limit exit.
    #[serde(default = "default_quota_backoff")]
    pub quota_backoff_secs: u64,
    /// Time between SIGTERM and SIGKILL.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// After this, a killed agent is finalized whether or not it exited.
    #[serde(default = "default_kill_deadline")]
    pub kill_deadline_secs: u64,
    #[serde(default = "default_output_tail")]
    pub output_tail_lines: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            prompt_flag: default_prompt_flag(),
            args: default_agent_args(),
            quota_backoff_secs: default_quota_backoff(),
            kill_grace_secs: default_kill_grace(),
            kill_deadline_secs: default_kill_deadline(),
            output_tail_lines: default_output_tail(),
        }
    }
}

impl AgentsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::Validation("agents.command is empty".into()));
        }
        if self.kill_deadline_secs < self.kill_grace_secs {
            return Err(ConfigError::Validation(format!(
                "agents.kill_deadline_secs ({}) must be >= kill_grace_secs ({})",
                self.kill_deadline_secs, self.kill_grace_secs
            )));
        }
        Ok(())
    }
}

fn default_agent_command() -> String {
    "gemini".into()
}
fn default_prompt_flag() -> String {
    "-p".into()
}
fn default_agent_args() -> Vec<String> {
    vec![
        "--yolo".into(),
        "--output-format".into(),
        "stream-json".into(),
    ]
}
fn default_quota_backoff() -> u64 {
    60
}
fn default_kill_grace() -> u64 {
    5
}
fn default_kill_deadline() -> u64 {
    15
}
fn default_output_tail() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_daily_agent_requests")]
    pub daily_agent_requests: u64,
    #[serde(default = "default_daily_prompts")]
    pub daily_prompts: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_pause_at_percent")]
    pub pause_at_percent: u8,
    /// Requests held back for human-initiated work.
    #[serde(default = "default_reserve_requests")]
    pub reserve_requests: u64,
    /// Daily reset happens at local midnight in this fixed UTC offset.
    #[serde(default = "default_reset_offset")]
    pub reset_utc_offset_hours: i32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_agent_requests: default_daily_agent_requests(),
            daily_prompts: default_daily_prompts(),
            max_concurrent: default_max_concurrent(),
            pause_at_percent: default_pause_at_percent(),
            reserve_requests: default_reserve_requests(),
            reset_utc_offset_hours: default_reset_offset(),
        }
    }
}

impl QuotaConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.daily_agent_requests == 0 || self.daily_prompts == 0 {
            return Err(ConfigError::Validation(
                "quota limits must be positive".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "quota.max_concurrent must be at least 1".into(),
            ));
        }
        if !(1..=100).contains(&self.pause_at_percent) {
            return Err(ConfigError::Validation(format!(
                "quota.pause_at_percent must be within 1..=100, got {}",
                self.pause_at_percent
            )));
        }
        if self.reserve_requests >= self.daily_agent_requests {
            return Err(ConfigError::Validation(format!(
                "quota.reserve_requests ({}) must be below daily_agent_requests ({})",
                self.reserve_requests, self.daily_agent_requests
            )));
        }
        if !(-12..=14).contains(&self.reset_utc_offset_hours) {
            return Err(ConfigError::Validation(format!(
                "quota.reset_utc_offset_hours out of range: {}",
                self.reset_utc_offset_hours
            )));
        }
        Ok(())
    }
}

fn default_daily_agent_requests() -> u64 {
    200
}
fn default_daily_prompts() -> u64 {
    1500
}
fn default_max_concurrent() -> u32 {
    3
}
fn default_pause_at_percent() -> u8 {
    90
}
fn default_reserve_requests() -> u64 {
    20
}
fn default_reset_offset() -> i32 {
    -8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Exact names or globs such as `release/*`.
    #[serde(default = "default_protected_branches")]
    pub protected_branches: Vec<String>,
    /// Paths or globs agents may never touch. `~` is expanded.
    #[serde(default = "default_blocked_paths")]
    pub blocked_paths: Vec<String>,
    #[serde(default = "default_max_files")]
    pub max_files_changed: u64,
    #[serde(default = "default_max_lines")]
    pub max_lines_changed: u64,
    #[serde(default = "default_task_timeout")]
    pub task_timeout_minutes: u64,
    /// Retry ceiling shared by flakes and quota waits.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub block_force_push: bool,
    #[serde(default = "default_true")]
    pub auto_rollback_on_failure: bool,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            protected_branches: default_protected_branches(),
            blocked_paths: default_blocked_paths(),
            max_files_changed: default_max_files(),
            max_lines_changed: default_max_lines(),
            task_timeout_minutes: default_task_timeout(),
            max_retries: default_max_retries(),
            block_force_push: true,
            auto_rollback_on_failure: true,
        }
    }
}

impl GuardrailsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bad) = self
            .protected_branches
            .iter()
            .chain(self.blocked_paths.iter())
            .find(|p| p.trim().is_empty())
        {
            return Err(ConfigError::Validation(format!(
                "guardrail pattern must not be blank: {bad:?}"
            )));
        }
        if self.task_timeout_minutes == 0 {
            return Err(ConfigError::Validation(
                "guardrails.task_timeout_minutes must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_protected_branches() -> Vec<String> {
    vec!["main".into(), "master".into(), "release/*".into()]
}
fn default_blocked_paths() -> Vec<String> {
    vec![
        "~/.ssh".into(),
        "~/.conductor".into(),
        "~/.env".into(),
        "~/.gitconfig".into(),
    ]
}
fn default_max_files() -> u64 {
    50
}
fn default_max_lines() -> u64 {
    2000
}
fn default_task_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    2
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrPipelineConfig {
    #[serde(default = "default_max_review_iterations")]
    pub max_review_iterations: u32,
    #[serde(default = "default_max_ci_fix")]
    pub max_ci_fix_attempts: u32,
    #[serde(default = "default_precheck_command")]
    pub precheck_command: String,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

impl Default for PrPipelineConfig {
    fn default() -> Self {
        Self {
            max_review_iterations: default_max_review_iterations(),
            max_ci_fix_attempts: default_max_ci_fix(),
            precheck_command: default_precheck_command(),
            base_branch: default_base_branch(),
        }
    }
}

fn default_max_review_iterations() -> u32 {
    3
}
fn default_max_ci_fix() -> u32 {
    3
}
fn default_precheck_command() -> String {
    "scripts/precheck.sh".into()
}
fn default_base_branch() -> String {
    "main".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    /// `owner/name`. Polling is disabled when unset.
    #[serde(default)]
    pub repo: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Authors whose login contains this are treated as the automated reviewer.
    #[serde(default = "default_reviewer_login")]
    pub reviewer_login: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            repo: None,
            poll_interval_secs: default_poll_interval(),
            reviewer_login: default_reviewer_login(),
        }
    }
}

fn default_poll_interval() -> u64 {
    60
}
fn default_reviewer_login() -> String {
    "greptile".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    #[serde(default = "default_rules_path")]
    pub path: String,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: default_rules_path(),
        }
    }
}

fn default_rules_path() -> String {
    "~/.conductor/rules.toml".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
        }
    }
}

fn default_tick_interval() -> u64 {
    1000
}
