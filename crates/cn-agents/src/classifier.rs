use std::fmt;

use cn_core::error::FailureKind;
use regex::{RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};

/// The closed set of outcomes a failed agent run is reduced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Transient: network blip, tool crash. Retry without asking anyone.
    Flake,
    /// Logic error or unrecoverable tool error. Needs a human.
    Real,
    /// The agent tripped a safety rule on its own side.
    Guardrail,
    /// The model provider reported a rate limit or exhausted quota.
    RateLimited,
}

impl Classification {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Classification::Flake | Classification::RateLimited => FailureKind::Transient,
            Classification::Guardrail => FailureKind::Guardrail,
            Classification::Real => FailureKind::Permanent,
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Classification::Flake => "flake",
            Classification::Real => "real failure",
            Classification::Guardrail => "guardrail",
            Classification::RateLimited => "rate limited",
        };
        f.write_str(label)
    }
}

/// What is known about a run that did not exit cleanly.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome<'a> {
    pub exit_code: Option<i32>,
    /// Most recent output lines, oldest first.
    pub tail: &'a [String],
}

/// Swappable classification policy. Must be a pure function of the outcome.
pub trait FailureClassifier: Send + Sync {
    fn classify(&self, outcome: &RunOutcome<'_>) -> Classification;
}

/// Pattern match over the output tail and exit status.
///
/// Status codes only count next to `HTTP` or `status`, so line numbers and
/// test counts in compiler or test output are not mistaken for them.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    rate_limit: RegexSet,
    flake: RegexSet,
    guardrail: RegexSet,
    /// Exit codes of processes that crashed (abort, SIGKILL, SIGSEGV).
    crash_codes: Vec<i32>,
}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    r"\brate[ _-]?limit(?:ed|s|_error|_exceeded)?\b",
    r"\btoo many requests\b",
    r"\bquota exceeded\b",
    r"\bresource[ _]exhausted\b",
    r"\bhttp(?:/\d(?:\.\d)?)?\W{0,3}429\b",
    r"\bstatus(?:[ _]code)?\W{0,3}429\b",
];

const FLAKE_PATTERNS: &[&str] = &[
    r"\beconn(?:reset|refused)\b",
    r"\betimedout\b",
    r"\bconnection (?:reset|refused)\b",
    r"\bnetwork error\b",
    r"\bsocket hang up\b",
    r"\b(?:service|temporarily) unavailable\b",
    r"\bbad gateway\b",
    r"\bgateway time-?out\b",
    r"\bdeadline exceeded\b",
    r"\bhttp(?:/\d(?:\.\d)?)?\W{0,3}50[234]\b",
    r"\bstatus(?:[ _]code)?\W{0,3}50[234]\b",
];

const GUARDRAIL_PATTERNS: &[&str] = &[
    r"permission denied by policy",
    r"blocked by sandbox",
    r"operation not permitted by sandbox",
];

/// Case-insensitive set over constant patterns. The unit tests compile every
/// set, so the empty fallback is never reached in a released build.
fn marker_set(patterns: &[&str]) -> RegexSet {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| RegexSet::empty())
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HeuristicClassifier {
    pub fn new() -> Self {
        Self {
            rate_limit: marker_set(RATE_LIMIT_PATTERNS),
            flake: marker_set(FLAKE_PATTERNS),
            guardrail: marker_set(GUARDRAIL_PATTERNS),
            crash_codes: vec![134, 137, 139],
        }
    }

    fn tail_matches(tail: &[String], markers: &RegexSet) -> bool {
        tail.iter().any(|line| markers.is_match(line))
    }
}

impl FailureClassifier for HeuristicClassifier {
    fn classify(&self, outcome: &RunOutcome<'_>) -> Classification {
        if Self::tail_matches(outcome.tail, &self.rate_limit) {
            return Classification::RateLimited;
        }
        if Self::tail_matches(outcome.tail, &self.guardrail) {
            return Classification::Guardrail;
        }
        if Self::tail_matches(outcome.tail, &self.flake) {
            return Classification::Flake;
        }
        match outcome.exit_code {
            // Ended by a signal we did not send.
            None => Classification::Flake,
            Some(code) if self.crash_codes.contains(&code) => Classification::Flake,
            Some(_) => Classification::Real,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(code: Option<i32>, lines: &[&str]) -> Classification {
        let tail: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        HeuristicClassifier::new().classify(&RunOutcome {
            exit_code: code,
            tail: &tail,
        })
    }

    #[test]
    fn rate_limit_wins_over_network_noise() {
        assert_eq!(
            classify(Some(1), &["ECONNRESET", "Error: 429 Too Many Requests"]),
            Classification::RateLimited
        );
    }

    #[test]
    fn network_errors_are_flakes() {
        assert_eq!(
            classify(Some(1), &["fetch failed: socket hang up"]),
            Classification::Flake
        );
    }

    #[test]
    fn crash_codes_are_flakes() {
        assert_eq!(classify(Some(139), &[]), Classification::Flake);
        assert_eq!(classify(None, &[]), Classification::Flake);
    }

    #[test]
    fn plain_nonzero_exit_is_real() {
        assert_eq!(
            classify(Some(1), &["error[E0308]: mismatched types"]),
            Classification::Real
        );
    }

    #[test]
    fn every_marker_pattern_compiles() {
        for patterns in [RATE_LIMIT_PATTERNS, FLAKE_PATTERNS, GUARDRAIL_PATTERNS] {
            let set = RegexSetBuilder::new(patterns).build().unwrap();
            assert_eq!(set.len(), patterns.len());
        }
    }

    #[test]
    fn provider_rate_limit_messages() {
        for line in [
            "Error: rate limited, retry in 30s",
            r#"{"type":"error","error":{"type":"rate_limit_error"}}"#,
            "RESOURCE_EXHAUSTED: quota exceeded for model",
        ] {
            assert_eq!(classify(Some(1), &[line]), Classification::RateLimited, "{line}");
        }
    }

    #[test]
    fn status_codes_need_http_context() {
        assert_eq!(
            classify(Some(1), &["HTTP/1.1 429"]),
            Classification::RateLimited
        );
        assert_eq!(
            classify(Some(1), &[r#"{"status": 429, "message": "slow down"}"#]),
            Classification::RateLimited
        );
        assert_eq!(
            classify(Some(1), &["upstream returned HTTP 503"]),
            Classification::Flake
        );
        assert_eq!(
            classify(Some(1), &["request failed with status code 502"]),
            Classification::Flake
        );
    }

    #[test]
    fn line_numbers_are_not_status_codes() {
        assert_eq!(
            classify(
                Some(101),
                &["error[E0308]: mismatched types --> src/pipeline.rs:429:17"]
            ),
            Classification::Real
        );
        assert_eq!(
            classify(Some(101), &["  --> crates/api/src/lib.rs:503:9"]),
            Classification::Real
        );
        assert_eq!(
            classify(Some(101), &["error: unused import --> src/rate_limiter.rs:4:5"]),
            Classification::Real
        );
    }

    #[test]
    fn test_counts_are_not_status_codes() {
        assert_eq!(
            classify(Some(101), &["test result: FAILED. 502 passed; 1 failed"]),
            Classification::Real
        );
        assert_eq!(
            classify(Some(1), &["Tests: 1 failed, 429 passed, 430 total"]),
            Classification::Real
        );
    }

    #[test]
    fn failure_kinds() {
        assert_eq!(Classification::Flake.failure_kind(), FailureKind::Transient);
        assert_eq!(Classification::Real.failure_kind(), FailureKind::Permanent);
        assert_eq!(
            Classification::Guardrail.failure_kind(),
            FailureKind::Guardrail
        );
    }
}
