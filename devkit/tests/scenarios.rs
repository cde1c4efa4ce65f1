//! End-to-end behaviour of the agent against the in-memory store

use relayhub_agent::agent::{Flow, RunExit};
use relayhub_agent::reconcile::{CycleOutcome, DesiredState};
use relayhub_agent::safety::{SafetyPolicy, SafetyRefusal};
use relayhub_agent::{FaultCounter, ReconciliationLoop, RelayId};
use relayhub_devkit::TestHarness;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn id(n: u8) -> RelayId {
    RelayId::new(n).unwrap()
}

/// Small deterministic generator for randomised sequences
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

fn single(relay: RelayId, status: bool) -> DesiredState {
    BTreeMap::from([(relay, status)]).into()
}

#[tokio::test(start_paused = true)]
async fn test_active_count_never_exceeds_ceiling() {
    let harness = TestHarness::new();
    let mut bank = harness.bank();
    let reconciler = ReconciliationLoop::new(
        harness.paths(),
        SafetyPolicy::new(12, Duration::ZERO, 10_000),
        FaultCounter::new(10),
    );
    let mut rng = Lcg(7);

    for _ in 0..2_000 {
        let relay = id(rng.below(16) as u8 + 1);
        // Bias towards ON so the ceiling is actually hit
        let status = rng.below(4) != 0;
        reconciler.apply_desired(&single(relay, status), &mut bank).unwrap();
        assert!(bank.active_count() <= 12, "active {}", bank.active_count());
    }
}

#[tokio::test(start_paused = true)]
async fn test_accepted_changes_respect_dwell() {
    let harness = TestHarness::new();
    let mut bank = harness.bank();
    let min = Duration::from_secs(1);
    let reconciler = ReconciliationLoop::new(
        harness.paths(),
        SafetyPolicy::new(16, min, 10_000),
        FaultCounter::new(10),
    );
    let mut rng = Lcg(42);
    let mut last_accept: HashMap<RelayId, Instant> = HashMap::new();
    let mut accepted = 0;

    for _ in 0..1_000 {
        tokio::time::advance(Duration::from_millis(rng.below(400))).await;
        let relay = id(rng.below(4) as u8 + 1);
        let status = !bank.status(relay).unwrap();
        let report = reconciler.apply_desired(&single(relay, status), &mut bank).unwrap();

        for changed in report.changed {
            let now = Instant::now();
            if let Some(prev) = last_accept.insert(changed, now) {
                assert!(now - prev >= min, "{} switched after {:?}", changed, now - prev);
            }
            accepted += 1;
        }
    }
    assert!(accepted > 0);
}

#[tokio::test]
async fn test_same_desired_state_twice_is_idempotent() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    for n in 1..=3 {
        harness.set_desired(n, true);
    }

    agent.reconcile_tick().await;
    let counts: Vec<u32> = agent.bank().lines().values().map(|l| l.switch_count).collect();
    let atomic_writes = harness.store.calls_matching("PATCH", "").len();
    assert_eq!(atomic_writes, 1);

    agent.reconcile_tick().await;
    let again: Vec<u32> = agent.bank().lines().values().map(|l| l.switch_count).collect();
    assert_eq!(counts, again);
    // Nothing changed, nothing published
    assert_eq!(harness.store.calls_matching("PATCH", "").len(), atomic_writes);
    assert!(matches!(
        agent.last_cycle(),
        Some(CycleOutcome::Completed { published: false, .. })
    ));
}

/// Device-owned part of the relay map; operators only ever write `status`
fn published_fields(relays: &Value) -> String {
    match relays {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{}:{}:{}", k, v["last_changed"], v["switch_count"]))
            .collect::<Vec<_>>()
            .join(","),
        _ => String::new(),
    }
}

#[tokio::test]
async fn test_readers_never_see_half_published_snapshot() {
    let harness = TestHarness::new().with_config(|c| c.safety.min_dwell_ms = 0);
    let mut agent = harness.agent();

    let store = harness.store.clone();
    let device = harness.paths().device().to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();

    let reader = std::thread::spawn(move || {
        let mut pairs: HashSet<(String, String)> = HashSet::new();
        while !reader_stop.load(Ordering::Relaxed) {
            let doc = store.read(&device);
            if let Some(ts) = doc["last_update"].as_str() {
                pairs.insert((ts.to_string(), published_fields(&doc["relays"])));
            }
            std::thread::yield_now();
        }
        pairs
    });

    for i in 0..40 {
        harness.set_desired(1 + (i % 3) as u8, i % 2 == 0);
        agent.reconcile_tick().await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    stop.store(true, Ordering::Relaxed);
    let pairs = reader.join().unwrap();

    let timestamps: HashSet<&String> = pairs.iter().map(|(ts, _)| ts).collect();
    let snapshots: HashSet<&String> = pairs.iter().map(|(_, relays)| relays).collect();
    assert!(!pairs.is_empty());
    // Each timestamp pairs with one snapshot and each snapshot with one timestamp
    assert_eq!(timestamps.len(), pairs.len());
    assert_eq!(snapshots.len(), pairs.len());
}

#[tokio::test]
async fn test_persistent_faults_escalate_exactly_once() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    let device = harness.paths().device().to_string();
    let ceiling = harness.config.recovery.max_faults;

    harness.set_desired(1, true);
    harness.set_desired(2, true);
    agent.reconcile_tick().await;
    assert_eq!(harness.driver.energised(), vec![0, 1]);

    // Sign-in still works; every store request fails
    harness.store.fail_path("");
    let offline_patches = || {
        harness
            .store
            .calls_matching("PATCH", &device)
            .into_iter()
            .filter(|c| c.body.as_ref().is_some_and(|b| b["online"] == json!(false)))
            .count()
    };

    for cycle in 1..ceiling {
        assert_eq!(agent.reconcile_tick().await, Flow::Continue);
        assert_eq!(agent.reconciler().faults().count(), cycle);
    }
    assert_eq!(harness.restarter.count(), 0);
    assert_eq!(offline_patches(), 0);
    assert_eq!(harness.driver.energised(), vec![0, 1]);

    assert_eq!(agent.reconcile_tick().await, Flow::Restart);
    assert_eq!(harness.restarter.count(), 1);
    assert_eq!(agent.recovery().escalations(), 1);
    assert_eq!(offline_patches(), 1);
    assert!(harness.driver.energised().is_empty());
    assert_eq!(agent.bank().active_count(), 0);

    // Counter starts over, no second escalation on the next fault
    assert_eq!(agent.reconcile_tick().await, Flow::Continue);
    assert_eq!(harness.restarter.count(), 1);
}

#[tokio::test]
async fn test_heartbeat_failures_share_the_fault_counter() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();

    assert_eq!(agent.telemetry_tick().await, Flow::Continue);
    let device = harness.remote_device();
    assert_eq!(device["online"], true);
    assert_eq!(device["memory_usage"], 35.5);
    assert_eq!(device["error_count"], 0);

    harness.store.set_fail_all(true);
    agent.telemetry_tick().await;
    assert_eq!(agent.reconciler().faults().count(), 1);
    harness.store.heal();

    // A clean sync cycle clears it; heartbeats never do
    agent.reconcile_tick().await;
    assert_eq!(agent.reconciler().faults().count(), 0);
}

#[tokio::test]
async fn test_bulk_on_request_stops_at_ceiling() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    harness.set_desired_all(true);

    agent.reconcile_tick().await;

    assert_eq!(agent.bank().active_count(), 12);
    let Some(CycleOutcome::Completed { report, published }) = agent.last_cycle() else {
        panic!("cycle did not complete: {:?}", agent.last_cycle());
    };
    assert!(published);
    assert_eq!(report.changed, (1..=12).map(id).collect::<Vec<_>>());
    let refused: Vec<RelayId> = report.refused.iter().map(|(r, _)| *r).collect();
    assert_eq!(refused, (13..=16).map(id).collect::<Vec<_>>());
    assert!(report
        .refused
        .iter()
        .all(|(_, why)| matches!(why, SafetyRefusal::TooManyActive { .. })));

    // The published snapshot shows the refusal
    for n in 13..=16 {
        assert_eq!(harness.remote_relay(n)["status"], false);
    }
    assert_eq!(harness.remote_relay(12)["status"], true);
}

#[tokio::test(start_paused = true)]
async fn test_flip_inside_dwell_is_retried_after_it() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();

    harness.set_desired(1, true);
    agent.reconcile_tick().await;
    assert_eq!(agent.bank().status(id(1)), Some(true));

    tokio::time::advance(Duration::from_millis(500)).await;
    harness.set_desired(1, false);
    agent.reconcile_tick().await;
    assert_eq!(agent.bank().status(id(1)), Some(true));
    let Some(CycleOutcome::Completed { report, .. }) = agent.last_cycle() else {
        panic!("cycle did not complete");
    };
    assert!(matches!(report.refused[..], [(_, SafetyRefusal::DwellTime { .. })]));

    tokio::time::advance(Duration::from_millis(600)).await;
    agent.reconcile_tick().await;
    assert_eq!(agent.bank().status(id(1)), Some(false));
    assert_eq!(harness.driver.level(0), Some(false));
    assert_eq!(harness.remote_relay(1)["switch_count"], 2);
}

#[tokio::test]
async fn test_worn_out_relay_is_never_actuated() {
    let harness = TestHarness::new();
    harness
        .store
        .write(&format!("{}/switch_count", harness.paths().relay(id(1))), json!(10_000));
    let mut agent = harness.agent();
    agent.register().await.unwrap();
    assert_eq!(agent.bank().lines()[&id(1)].switch_count, 10_000);
    let init_writes = harness.driver.writes_to(0);

    for status in [true, false, true] {
        harness.set_desired(1, status);
        agent.reconcile_tick().await;
        assert_eq!(agent.bank().status(id(1)), Some(false));
    }
    assert_eq!(harness.driver.writes_to(0), init_writes);
    assert_eq!(harness.remote_relay(1)["switch_count"], 10_000);
}

#[tokio::test]
async fn test_hardware_fault_is_counted_and_logged() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    harness.driver.fail_pin(2);
    harness.set_desired(3, true);

    agent.reconcile_tick().await;

    assert!(agent.last_cycle().is_some_and(|c| c.is_fault()));
    assert_eq!(agent.reconciler().faults().count(), 1);
    assert!(harness.log_messages().iter().any(|m| m.contains("GPIO pin 2")));
}

#[tokio::test]
async fn test_failed_publish_is_retried_by_next_cycle() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    agent.register().await.unwrap();

    harness.set_desired(1, true);
    harness.store.fail_call("PATCH", "");
    agent.reconcile_tick().await;

    assert!(agent.last_cycle().is_some_and(|c| c.is_fault()));
    assert_eq!(agent.bank().status(id(1)), Some(true));
    assert_eq!(harness.remote_relay(1)["switch_count"], 0);
    assert!(agent.reconciler().publish_pending());

    // Desired and actual now agree; the snapshot still goes out
    harness.store.heal();
    agent.reconcile_tick().await;
    assert!(matches!(
        agent.last_cycle(),
        Some(CycleOutcome::Completed { published: true, .. })
    ));
    let relay = harness.remote_relay(1);
    assert_eq!(relay["switch_count"], 1);
    assert_eq!(relay["power_usage"], 100.0);
    assert!(relay["last_changed"].is_string());
    assert!(!agent.reconciler().publish_pending());

    harness.store.clear_calls();
    agent.reconcile_tick().await;
    assert!(harness.store.calls_matching("PATCH", "").is_empty());
}

#[tokio::test]
async fn test_lines_switched_before_hardware_fault_are_published() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    harness.driver.fail_pin(2);
    harness.set_desired(1, true);
    harness.set_desired(3, true);

    agent.reconcile_tick().await;

    assert!(agent.last_cycle().is_some_and(|c| c.is_fault()));
    assert_eq!(agent.bank().status(id(1)), Some(true));
    assert_eq!(harness.remote_relay(1)["switch_count"], 1);
    assert_eq!(harness.remote_relay(3)["switch_count"], 0);
    assert!(!agent.reconciler().publish_pending());
}

#[tokio::test]
async fn test_command_queue() {
    let harness = TestHarness::new().with_config(|c| c.safety.min_dwell_ms = 0);
    let mut agent = harness.agent();
    harness.set_desired(1, true);
    agent.reconcile_tick().await;

    let toggle = harness.push_command("toggle_all");
    let unknown = harness.push_command("disable_safety");
    agent.command_tick().await;

    // relay_1 goes OFF, then lines 2..=13 fill the ceiling
    assert_eq!(agent.bank().status(id(1)), Some(false));
    assert_eq!(agent.bank().active_count(), 12);
    let commands = harness.store.read(&harness.paths().commands());
    assert_eq!(commands[&toggle]["status"], "completed");
    assert!(commands[&toggle]["processed_at"].is_string());
    assert_eq!(commands[&unknown]["status"], "unsupported");

    let off = harness.push_command("all_off");
    agent.command_tick().await;
    assert_eq!(agent.bank().active_count(), 0);
    assert!(harness.driver.energised().is_empty());
    assert_eq!(harness.store.read(&harness.paths().command(&off))["status"], "completed");

    // Processed entries are not run again
    let writes = harness.driver.writes().len();
    agent.command_tick().await;
    assert_eq!(harness.driver.writes().len(), writes);
}

#[tokio::test]
async fn test_restart_command_goes_through_safe_state() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    harness.set_desired(5, true);
    agent.reconcile_tick().await;

    let restart = harness.push_command("reboot");
    assert_eq!(agent.command_tick().await, Flow::Restart);

    assert_eq!(harness.restarter.count(), 1);
    assert!(harness.driver.energised().is_empty());
    assert_eq!(harness.remote_device()["online"], false);
    assert_eq!(
        harness.store.read(&harness.paths().command(&restart))["status"],
        "completed"
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_signal_runs_emergency_stop() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();

    let store = harness.store.clone();
    let desired = format!("{}/status", harness.paths().relay(id(1)));
    let shutdown = async move {
        // Registration resets the remote relays; ask for relay_1 afterwards
        tokio::time::sleep(Duration::from_secs(4)).await;
        store.write(&desired, json!(true));
        tokio::time::sleep(Duration::from_secs(4)).await;
    };

    assert_eq!(agent.run(shutdown).await, RunExit::Shutdown);

    assert!(harness.driver.writes().contains(&(0, true)));
    assert!(harness.driver.energised().is_empty());
    let device = harness.remote_device();
    assert_eq!(device["online"], false);
    assert!(harness.log_messages().iter().any(|m| m.starts_with("emergency_stop")));
    assert!(agent.telemetry().sent() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_stalled_sync() {
    let harness = TestHarness::new();
    let mut agent = harness.agent();
    let start = Instant::now();

    let store = harness.store.clone();
    let relays = harness.paths().relays();
    let desired = format!("{}/status", harness.paths().relay(id(1)));
    let shutdown = async move {
        tokio::time::sleep(Duration::from_secs(4)).await;
        store.write(&desired, json!(true));
        // relay_1 goes ON at the 6s sync; the 9s sync hangs on its pull
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        store.stall_path(&relays);
        tokio::time::sleep(Duration::from_millis(1_600)).await;
    };

    assert_eq!(agent.run(shutdown).await, RunExit::Shutdown);

    assert!(start.elapsed() < Duration::from_secs(10), "stopped after {:?}", start.elapsed());
    assert!(harness.driver.writes().contains(&(0, true)));
    assert!(harness.driver.energised().is_empty());
    assert_eq!(harness.remote_device()["online"], false);
}
