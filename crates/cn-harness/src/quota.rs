use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};
use cn_core::config::QuotaConfig;
use cn_core::store::QuotaUsage;
use cn_core::types::QuotaState;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Admission types
// ---------------------------------------------------------------------------

/// What a caller wants to charge against the daily budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionKind {
    /// Starting an agent: one agent request plus a concurrency slot.
    AgentSpawn,
    /// A single prompt.
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Usage crossed the pause threshold and the request is not human-initiated.
    Paused,
    ConcurrencyCeiling { max: u32 },
    /// Human request while paused, but the reserve is spent.
    ReserveExhausted,
    /// The hard daily limit is reached.
    Exhausted,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Paused => f.write_str("quota paused"),
            DenyReason::ConcurrencyCeiling { max } => {
                write!(f, "concurrency ceiling reached ({max} agents)")
            }
            DenyReason::ReserveExhausted => f.write_str("human reserve exhausted"),
            DenyReason::Exhausted => f.write_str("daily quota exhausted"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// Granted and charged. `reserve` is set when the unit came out of the
    /// human reserve.
    Granted { reserve: bool },
    Denied(DenyReason),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }
}

// ---------------------------------------------------------------------------
// QuotaLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Counters {
    agent_requests_used: u64,
    prompts_used: u64,
    reserve_used: u64,
    concurrent_agents: u32,
    is_paused: bool,
    /// Set by a manual resume; suppresses the percentage pause until reset.
    resume_override: bool,
    reset_at: DateTime<Utc>,
}

/// Daily usage counters and admission decisions.
///
/// Every check and its matching increment happen under one lock, so two
/// concurrent requests can never both pass a check that only one of them
/// should have passed.
#[derive(Debug)]
pub struct QuotaLedger {
    settings: QuotaConfig,
    offset: FixedOffset,
    counters: Mutex<Counters>,
}

impl QuotaLedger {
    pub fn new(settings: QuotaConfig) -> Self {
        Self::new_at(settings, Utc::now())
    }

    pub fn new_at(settings: QuotaConfig, now: DateTime<Utc>) -> Self {
        let offset = FixedOffset::east_opt(settings.reset_utc_offset_hours * 3600)
            .unwrap_or_else(|| Utc.fix());
        let reset_at = next_reset(now, offset);
        Self {
            settings,
            offset,
            counters: Mutex::new(Counters {
                agent_requests_used: 0,
                prompts_used: 0,
                reserve_used: 0,
                concurrent_agents: 0,
                is_paused: false,
                resume_override: false,
                reset_at,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Decide and charge one unit of `kind`.
    pub fn request_admission(&self, kind: AdmissionKind, human_initiated: bool) -> Admission {
        self.request_admission_at(kind, human_initiated, Utc::now())
    }

    pub fn request_admission_at(
        &self,
        kind: AdmissionKind,
        human_initiated: bool,
        now: DateTime<Utc>,
    ) -> Admission {
        let mut c = self.lock();
        self.roll_over(&mut c, now);

        if kind == AdmissionKind::AgentSpawn && c.concurrent_agents >= self.settings.max_concurrent
        {
            return Admission::Denied(DenyReason::ConcurrencyCeiling {
                max: self.settings.max_concurrent,
            });
        }

        let (used, limit) = match kind {
            AdmissionKind::AgentSpawn => (c.agent_requests_used, self.settings.daily_agent_requests),
            AdmissionKind::Prompt => (c.prompts_used, self.settings.daily_prompts),
        };
        if used >= limit {
            return Admission::Denied(DenyReason::Exhausted);
        }

        let mut from_reserve = false;
        if c.is_paused {
            if !human_initiated {
                return Admission::Denied(DenyReason::Paused);
            }
            if c.reserve_used >= self.settings.reserve_requests {
                return Admission::Denied(DenyReason::ReserveExhausted);
            }
            from_reserve = true;
        } else if !human_initiated
            && kind == AdmissionKind::AgentSpawn
            && used >= limit.saturating_sub(self.settings.reserve_requests)
        {
            // Automated work never eats into the human carve-out.
            c.is_paused = true;
            warn!(used, limit, "automated work reached the reserve boundary, pausing");
            return Admission::Denied(DenyReason::Paused);
        }

        match kind {
            AdmissionKind::AgentSpawn => {
                c.agent_requests_used += 1;
                c.concurrent_agents += 1;
            }
            AdmissionKind::Prompt => c.prompts_used += 1,
        }
        if from_reserve {
            c.reserve_used += 1;
        }
        self.recompute_pause(&mut c);
        Admission::Granted {
            reserve: from_reserve,
        }
    }

    /// Charge agent requests reported by a running agent. Never denies; the
    /// agent is already admitted.
    pub fn record_agent_requests(&self, n: u64) {
        let mut c = self.lock();
        self.roll_over(&mut c, Utc::now());
        c.agent_requests_used += n;
        self.recompute_pause(&mut c);
    }

    pub fn record_prompt(&self) {
        let mut c = self.lock();
        self.roll_over(&mut c, Utc::now());
        c.prompts_used += 1;
        self.recompute_pause(&mut c);
    }

    /// Give back the concurrency slot of an agent that reached a terminal state.
    pub fn agent_stopped(&self) {
        let mut c = self.lock();
        if c.concurrent_agents == 0 {
            warn!("agent_stopped called with no running agents");
        }
        c.concurrent_agents = c.concurrent_agents.saturating_sub(1);
    }

    /// Undo a granted `AgentSpawn` admission whose agent never started.
    /// Returns the request, the concurrency slot and, for `reserve` grants,
    /// the reserve unit. A pause the charge triggered stays until reset.
    pub fn refund_spawn(&self, reserve: bool) {
        let mut c = self.lock();
        c.agent_requests_used = c.agent_requests_used.saturating_sub(1);
        c.concurrent_agents = c.concurrent_agents.saturating_sub(1);
        if reserve {
            c.reserve_used = c.reserve_used.saturating_sub(1);
        }
        debug!(
            used = c.agent_requests_used,
            concurrent = c.concurrent_agents,
            "spawn admission refunded"
        );
    }

    /// Human override: unpause before the daily boundary.
    pub fn resume(&self) {
        let mut c = self.lock();
        c.is_paused = false;
        c.resume_override = true;
        info!(
            used = c.agent_requests_used,
            "quota manually resumed until next reset"
        );
    }

    /// Load persisted counters for `day`. Counters for any other day are ignored.
    pub fn restore_usage(&self, day: &str, usage: QuotaUsage) {
        let mut c = self.lock();
        if day != self.day_key_for(c.reset_at - Duration::seconds(1)) {
            return;
        }
        c.agent_requests_used = usage.agent_requests;
        c.prompts_used = usage.prompts;
        c.reserve_used = usage.reserve_used;
        self.recompute_pause(&mut c);
        info!(
            day,
            agent_requests = usage.agent_requests,
            prompts = usage.prompts,
            paused = c.is_paused,
            "quota usage restored"
        );
    }

    /// Current counters keyed by the reset day they belong to.
    pub fn usage(&self) -> (String, QuotaUsage) {
        let c = self.lock();
        let day = self.day_key_for(c.reset_at - Duration::seconds(1));
        (
            day,
            QuotaUsage {
                agent_requests: c.agent_requests_used,
                prompts: c.prompts_used,
                reserve_used: c.reserve_used,
            },
        )
    }

    pub fn snapshot(&self) -> QuotaState {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> QuotaState {
        let mut c = self.lock();
        self.roll_over(&mut c, now);
        QuotaState {
            agent_requests_used: c.agent_requests_used,
            agent_requests_limit: self.settings.daily_agent_requests,
            prompts_used: c.prompts_used,
            prompts_limit: self.settings.daily_prompts,
            concurrent_agents: c.concurrent_agents,
            max_concurrent: self.settings.max_concurrent,
            pause_at_percent: self.settings.pause_at_percent,
            reserve_requests: self.settings.reserve_requests,
            reserve_used: c.reserve_used,
            is_paused: c.is_paused,
            reset_at: c.reset_at,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().is_paused
    }

    /// Apply the daily reset if `now` is past the boundary. Returns whether a
    /// reset happened.
    pub fn tick(&self, now: DateTime<Utc>) -> bool {
        let mut c = self.lock();
        self.roll_over(&mut c, now)
    }

    /// Remaining time until the next reset, formatted as `"3h 12m"`.
    pub fn time_until_reset(&self, now: DateTime<Utc>) -> String {
        let reset_at = self.lock().reset_at;
        let remaining = (reset_at - now).max(Duration::zero());
        let hours = remaining.num_hours();
        let minutes = remaining.num_minutes() - hours * 60;
        format!("{hours}h {minutes}m")
    }

    fn day_key_for(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format("%Y-%m-%d").to_string()
    }

    fn roll_over(&self, c: &mut Counters, now: DateTime<Utc>) -> bool {
        if now < c.reset_at {
            return false;
        }
        c.agent_requests_used = 0;
        c.prompts_used = 0;
        c.reserve_used = 0;
        c.is_paused = false;
        c.resume_override = false;
        c.reset_at = next_reset(now, self.offset);
        info!(next_reset = %c.reset_at, "daily quota reset");
        true
    }

    fn recompute_pause(&self, c: &mut Counters) {
        if c.is_paused || c.resume_override {
            return;
        }
        let pct = u64::from(self.settings.pause_at_percent);
        let over = |used: u64, limit: u64| limit > 0 && used * 100 >= limit * pct;
        if over(c.agent_requests_used, self.settings.daily_agent_requests)
            || over(c.prompts_used, self.settings.daily_prompts)
        {
            c.is_paused = true;
            warn!(
                agent_requests = c.agent_requests_used,
                prompts = c.prompts_used,
                pause_at_percent = self.settings.pause_at_percent,
                "quota pause threshold reached"
            );
        }
    }
}

/// Next local midnight in `offset`, as a UTC instant.
fn next_reset(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    now.with_timezone(&offset)
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|midnight| offset.from_local_datetime(&midnight).single())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| now + Duration::hours(24))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
