use chrono::{DateTime, Duration, Utc};
use cn_core::config::QuotaConfig;
use cn_core::store::QuotaUsage;
use cn_harness::quota::{Admission, AdmissionKind, DenyReason, QuotaLedger};
use std::sync::Arc;

fn noon() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T20:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn ledger_with_usage(agent_requests: u64) -> QuotaLedger {
    let ledger = QuotaLedger::new_at(QuotaConfig::default(), noon());
    let (day, _) = ledger.usage();
    ledger.restore_usage(
        &day,
        QuotaUsage {
            agent_requests,
            ..QuotaUsage::default()
        },
    );
    ledger
}

#[test]
fn pauses_at_ninety_percent() {
    let ledger = ledger_with_usage(181);
    assert!(ledger.snapshot_at(noon()).is_paused);
}

#[test]
fn below_threshold_is_not_paused() {
    let ledger = ledger_with_usage(179);
    assert!(!ledger.is_paused());
    assert!(ledger
        .request_admission_at(AdmissionKind::AgentSpawn, false, noon())
        .is_granted());
}

#[test]
fn refunded_spawn_returns_request_and_slot() {
    let ledger = ledger_with_usage(10);
    assert!(ledger
        .request_admission_at(AdmissionKind::AgentSpawn, false, noon())
        .is_granted());
    let charged = ledger.snapshot_at(noon());
    assert_eq!(charged.agent_requests_used, 11);
    assert_eq!(charged.concurrent_agents, 1);

    ledger.refund_spawn(false);
    let state = ledger.snapshot_at(noon());
    assert_eq!(state.agent_requests_used, 10);
    assert_eq!(state.concurrent_agents, 0);
    assert_eq!(state.reserve_used, 0);
}

#[test]
fn paused_denies_automated_work() {
    let ledger = ledger_with_usage(181);
    assert_eq!(
        ledger.request_admission_at(AdmissionKind::AgentSpawn, false, noon()),
        Admission::Denied(DenyReason::Paused)
    );
}

#[test]
fn paused_grants_humans_from_reserve_until_spent() {
    let mut cfg = QuotaConfig::default();
    cfg.max_concurrent = 100;
    cfg.reserve_requests = 2;
    let ledger = QuotaLedger::new_at(cfg, noon());
    let (day, _) = ledger.usage();
    ledger.restore_usage(
        &day,
        QuotaUsage {
            agent_requests: 181,
            ..QuotaUsage::default()
        },
    );

    for _ in 0..2 {
        assert_eq!(
            ledger.request_admission_at(AdmissionKind::AgentSpawn, true, noon()),
            Admission::Granted { reserve: true }
        );
    }
    assert_eq!(
        ledger.request_admission_at(AdmissionKind::AgentSpawn, true, noon()),
        Admission::Denied(DenyReason::ReserveExhausted)
    );
    assert_eq!(ledger.snapshot_at(noon()).reserve_used, 2);
}

#[test]
fn concurrency_ceiling_holds() {
    let ledger = QuotaLedger::new_at(QuotaConfig::default(), noon());
    for _ in 0..3 {
        assert!(ledger
            .request_admission_at(AdmissionKind::AgentSpawn, false, noon())
            .is_granted());
    }
    assert_eq!(
        ledger.request_admission_at(AdmissionKind::AgentSpawn, true, noon()),
        Admission::Denied(DenyReason::ConcurrencyCeiling { max: 3 })
    );

    ledger.agent_stopped();
    assert!(ledger
        .request_admission_at(AdmissionKind::AgentSpawn, false, noon())
        .is_granted());
}

#[test]
fn automated_work_stops_at_reserve_boundary() {
    let mut cfg = QuotaConfig::default();
    cfg.daily_agent_requests = 10;
    cfg.reserve_requests = 2;
    cfg.pause_at_percent = 100;
    cfg.max_concurrent = 100;
    let ledger = QuotaLedger::new_at(cfg, noon());

    let granted = (0..10)
        .filter(|_| {
            ledger
                .request_admission_at(AdmissionKind::AgentSpawn, false, noon())
                .is_granted()
        })
        .count();
    assert_eq!(granted, 8);
    assert!(ledger.is_paused());
}

#[test]
fn daily_reset_clears_usage_and_pause() {
    let ledger = ledger_with_usage(190);
    assert!(ledger.is_paused());

    let tomorrow = noon() + Duration::hours(24);
    assert!(ledger.tick(tomorrow));
    let state = ledger.snapshot_at(tomorrow);
    assert!(!state.is_paused);
    assert_eq!(state.agent_requests_used, 0);
    assert!(state.reset_at > tomorrow);
}

#[test]
fn manual_resume_unpauses_until_reset() {
    let ledger = QuotaLedger::new(QuotaConfig::default());
    let (day, _) = ledger.usage();
    ledger.restore_usage(
        &day,
        QuotaUsage {
            agent_requests: 181,
            ..QuotaUsage::default()
        },
    );
    assert!(ledger.is_paused());
    ledger.resume();
    assert!(!ledger.is_paused());
    ledger.record_agent_requests(1);
    assert!(!ledger.is_paused());
}

#[test]
fn prompts_count_toward_pause() {
    let mut cfg = QuotaConfig::default();
    cfg.daily_prompts = 10;
    let ledger = QuotaLedger::new_at(cfg, noon());
    for _ in 0..9 {
        ledger.request_admission_at(AdmissionKind::Prompt, false, noon());
    }
    assert!(ledger.is_paused());
}

#[test]
fn usage_for_other_day_is_ignored() {
    let ledger = QuotaLedger::new_at(QuotaConfig::default(), noon());
    ledger.restore_usage(
        "1999-01-01",
        QuotaUsage {
            agent_requests: 150,
            ..QuotaUsage::default()
        },
    );
    assert_eq!(ledger.snapshot_at(noon()).agent_requests_used, 0);
}

#[test]
fn admission_is_atomic_under_contention() {
    let mut cfg = QuotaConfig::default();
    cfg.max_concurrent = 5;
    let ledger = Arc::new(QuotaLedger::new_at(cfg, noon()));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                ledger
                    .request_admission_at(AdmissionKind::AgentSpawn, false, noon())
                    .is_granted()
            })
        })
        .collect();
    let granted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|g| *g)
        .count();

    assert_eq!(granted, 5);
    assert_eq!(ledger.snapshot_at(noon()).concurrent_agents, 5);
}
