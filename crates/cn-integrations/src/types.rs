use serde::{Deserialize, Serialize};

/// `gh` reports authors as `{"login": "..."}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrSummary {
    pub number: u64,
    pub title: String,
    pub head_ref_name: String,
    pub state: PrState,
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Coarse outcome `gh pr checks` assigns to every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckBucket {
    Pass,
    Fail,
    Pending,
    Skipping,
    Cancel,
    #[serde(other)]
    Unknown,
}

impl CheckBucket {
    /// Conclusion string carried by `ci_status` events.
    pub fn conclusion(&self) -> &'static str {
        match self {
            CheckBucket::Pass | CheckBucket::Skipping => "success",
            CheckBucket::Fail | CheckBucket::Cancel => "failure",
            CheckBucket::Pending | CheckBucket::Unknown => "pending",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRun {
    pub name: String,
    #[serde(default)]
    pub state: String,
    pub bucket: CheckBucket,
    #[serde(default)]
    pub completed_at: Option<String>,
}

// ---------------------------------------------------------------------------
// Reviews and comments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrReview {
    pub id: String,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub body: String,
    /// `APPROVED`, `CHANGES_REQUESTED`, `COMMENTED`, ...
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrComment {
    pub id: String,
    #[serde(default)]
    pub author: Author,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Review state of one PR as returned by `gh pr view --json state,reviews,comments`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrActivity {
    pub state: PrState,
    #[serde(default)]
    pub reviews: Vec<PrReview>,
    #[serde(default)]
    pub comments: Vec<PrComment>,
}

/// A failed workflow run as listed by `gh run list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub database_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub conclusion: String,
    #[serde(default)]
    pub head_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePr {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_buckets_map_to_conclusions() {
        let checks: Vec<CheckRun> = serde_json::from_str(
            r#"[
                {"name":"build","state":"SUCCESS","bucket":"pass","completedAt":"2026-01-02T03:04:05Z"},
                {"name":"lint","state":"FAILURE","bucket":"fail"},
                {"name":"docs","state":"SKIPPED","bucket":"skipping"},
                {"name":"e2e","state":"IN_PROGRESS","bucket":"pending"},
                {"name":"odd","state":"STALE","bucket":"whatever"}
            ]"#,
        )
        .unwrap();
        let conclusions: Vec<_> = checks.iter().map(|c| c.bucket.conclusion()).collect();
        assert_eq!(
            conclusions,
            vec!["success", "failure", "success", "pending", "pending"]
        );
        assert_eq!(
            checks[0].completed_at.as_deref(),
            Some("2026-01-02T03:04:05Z")
        );
    }

    #[test]
    fn pr_state_uses_gh_casing() {
        let pr: PrSummary = serde_json::from_str(
            r#"{"number":7,"title":"t","headRefName":"feat/x","state":"OPEN"}"#,
        )
        .unwrap();
        assert_eq!(pr.state, PrState::Open);
        assert_eq!(pr.head_ref_name, "feat/x");
    }
}
