//! Relay bank: sole owner of the physical relay state
//!
//! - One `RelayLine` per configured pin, all driven OFF during construction
//! - `set` actuates a single line and keeps wear/usage counters
//! - `all_off` is the emergency path and never consults the safety policy
//!
//! The bank performs no safety checks itself: ordinary callers ask
//! `SafetyPolicy` first.

pub mod driver;

pub use driver::{RelayDriver, SimulatedDriver, SysfsGpio};

use crate::error::HardwareFault;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Stable relay identifier, `relay_1` .. `relay_16`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayId(u8);

impl RelayId {
    pub const MAX: u8 = 16;

    pub fn new(index: u8) -> Option<Self> {
        (1..=Self::MAX).contains(&index).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "relay_{}", self.0)
    }
}

impl FromStr for RelayId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("relay_")
            .and_then(|n| n.parse::<u8>().ok())
            .and_then(RelayId::new)
            .ok_or_else(|| format!("not a relay id: {}", s))
    }
}

/// Estimated draw per line, watts
#[derive(Debug, Clone)]
pub struct PowerRatings {
    ratings: HashMap<RelayId, f32>,
    default_watts: f32,
}

impl PowerRatings {
    pub fn new(default_watts: f32) -> Self {
        Self {
            ratings: HashMap::new(),
            default_watts,
        }
    }

    pub fn with_rating(mut self, relay_id: RelayId, watts: f32) -> Self {
        self.ratings.insert(relay_id, watts);
        self
    }

    pub fn rating_for(&self, relay_id: RelayId) -> f32 {
        self.ratings.get(&relay_id).copied().unwrap_or(self.default_watts)
    }
}

impl Default for PowerRatings {
    fn default() -> Self {
        let id = |n| RelayId(n);
        Self::new(50.0)
            .with_rating(id(1), 100.0)
            .with_rating(id(2), 75.0)
            .with_rating(id(3), 1500.0)
            .with_rating(id(4), 200.0)
    }
}

/// Actual state of one relay
#[derive(Debug, Clone, PartialEq)]
pub struct RelayLine {
    pub relay_id: RelayId,
    pub pin_index: u32,
    pub status: bool,
    pub name: String,
    /// Monotonic instant of the last actuation, used for dwell checks
    pub last_changed: Option<Instant>,
    /// Wall-clock time of the last actuation, published
    pub last_changed_at: Option<DateTime<Utc>>,
    pub switch_count: u32,
    pub power_usage: f32,
    /// ON time accumulated up to the last OFF transition
    pub total_runtime: Duration,
}

impl RelayLine {
    fn new(relay_id: RelayId, pin_index: u32) -> Self {
        Self {
            relay_id,
            pin_index,
            status: false,
            name: format!("Relay {}", relay_id.index()),
            last_changed: None,
            last_changed_at: None,
            switch_count: 0,
            power_usage: 0.0,
            total_runtime: Duration::ZERO,
        }
    }

    fn record(&mut self, status: bool, now: Instant, wall: DateTime<Utc>, rating: f32) {
        if self.status {
            if let Some(since) = self.last_changed {
                self.total_runtime += now.saturating_duration_since(since);
            }
        }
        if self.status != status {
            self.switch_count = self.switch_count.saturating_add(1);
        }
        self.status = status;
        self.last_changed = Some(now);
        self.last_changed_at = Some(wall);
        self.power_usage = if status { rating } else { 0.0 };
    }

    /// Runtime including the ON span in progress
    pub fn runtime_at(&self, now: Instant) -> Duration {
        match (self.status, self.last_changed) {
            (true, Some(since)) => self.total_runtime + now.saturating_duration_since(since),
            _ => self.total_runtime,
        }
    }

    pub fn to_document(&self, now: Instant) -> RelayDocument {
        RelayDocument {
            status: self.status,
            name: self.name.clone(),
            last_changed: self.last_changed_at.map(crate::wall_timestamp),
            switch_count: self.switch_count,
            power_usage: self.power_usage,
            total_runtime: self.runtime_at(now).as_secs(),
            pin_number: self.pin_index,
        }
    }
}

/// Remote representation of a relay (`relays/{relay_id}`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayDocument {
    pub status: bool,
    pub name: String,
    pub last_changed: Option<String>,
    pub switch_count: u32,
    pub power_usage: f32,
    pub total_runtime: u64,
    pub pin_number: u32,
}

pub type BankSnapshot = BTreeMap<RelayId, RelayLine>;

/// Outcome of the emergency off path
#[derive(Debug, Default)]
pub struct AllOffReport {
    pub switched_off: Vec<RelayId>,
    pub failed: Vec<(RelayId, HardwareFault)>,
}

impl AllOffReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregate view for telemetry
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BankStatus {
    pub total_relays: usize,
    pub active_relays: usize,
    pub inactive_relays: usize,
    pub total_power_usage: f32,
}

pub struct RelayBank {
    lines: BankSnapshot,
    driver: Box<dyn RelayDriver>,
    ratings: PowerRatings,
    revision: u64,
}

impl RelayBank {
    /// Build the bank and command every pin OFF before returning
    pub fn new(
        pins: &[u32],
        ratings: PowerRatings,
        mut driver: Box<dyn RelayDriver>,
    ) -> Result<Self, HardwareFault> {
        let mut lines = BTreeMap::new();
        for (i, &pin) in pins.iter().enumerate() {
            let relay_id = u8::try_from(i + 1)
                .ok()
                .and_then(RelayId::new)
                .ok_or_else(|| HardwareFault {
                    pin,
                    reason: format!("more than {} relay lines", RelayId::MAX),
                })?;
            driver.write(pin, false)?;
            lines.insert(relay_id, RelayLine::new(relay_id, pin));
        }

        info!("Relay bank initialised: {} lines OFF via {} driver", lines.len(), driver.name());
        Ok(Self {
            lines,
            driver,
            ratings,
            revision: 0,
        })
    }

    /// Override display names, in relay order
    pub fn with_names(mut self, names: &[String]) -> Self {
        for (line, name) in self.lines.values_mut().zip(names) {
            line.name = name.clone();
        }
        self
    }

    /// Actuate one line. `Ok(false)` for an unknown relay, nothing mutated.
    pub fn set(&mut self, relay_id: RelayId, status: bool) -> Result<bool, HardwareFault> {
        let rating = self.ratings.rating_for(relay_id);
        let Some(line) = self.lines.get_mut(&relay_id) else {
            warn!("Relay {} not found", relay_id);
            return Ok(false);
        };

        self.driver.write(line.pin_index, status)?;
        line.record(status, Instant::now(), Utc::now(), rating);
        self.revision += 1;

        info!(
            "{} ({}): pin {}, switches {}",
            relay_id,
            if status { "ON" } else { "OFF" },
            line.pin_index,
            line.switch_count
        );
        Ok(true)
    }

    /// Drive every line OFF, continuing past individual failures. Lines that
    /// were already OFF are re-driven but keep their timestamps.
    pub fn all_off(&mut self) -> AllOffReport {
        warn!("EMERGENCY: turning off all relays");
        let mut report = AllOffReport::default();
        let now = Instant::now();
        let wall = Utc::now();

        for line in self.lines.values_mut() {
            match self.driver.write(line.pin_index, false) {
                Ok(()) if line.status => {
                    line.record(false, now, wall, 0.0);
                    report.switched_off.push(line.relay_id);
                }
                Ok(()) => {}
                Err(e) => {
                    error!("Failed to turn off {}: {}", line.relay_id, e);
                    report.failed.push((line.relay_id, e));
                }
            }
        }
        if !report.switched_off.is_empty() {
            self.revision += 1;
        }
        report
    }

    /// Bumped on every recorded actuation; a changed value means the
    /// published snapshot may be stale
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn status(&self, relay_id: RelayId) -> Option<bool> {
        self.lines.get(&relay_id).map(|l| l.status)
    }

    pub fn lines(&self) -> &BankSnapshot {
        &self.lines
    }

    pub fn snapshot(&self) -> BankSnapshot {
        self.lines.clone()
    }

    pub fn active_count(&self) -> usize {
        self.lines.values().filter(|l| l.status).count()
    }

    /// Every line's inverted status, to be fed through the gated apply path
    pub fn toggle_all(&self) -> BTreeMap<RelayId, bool> {
        self.lines.iter().map(|(id, l)| (*id, !l.status)).collect()
    }

    pub fn documents(&self) -> BTreeMap<RelayId, RelayDocument> {
        let now = Instant::now();
        self.lines.iter().map(|(id, l)| (*id, l.to_document(now))).collect()
    }

    pub fn bank_status(&self) -> BankStatus {
        let active = self.active_count();
        BankStatus {
            total_relays: self.lines.len(),
            active_relays: active,
            inactive_relays: self.lines.len() - active,
            total_power_usage: self.lines.values().map(|l| l.power_usage).sum(),
        }
    }

    /// Seed a line's wear counter when restoring persisted state
    pub fn restore_switch_count(&mut self, relay_id: RelayId, switch_count: u32) -> bool {
        match self.lines.get_mut(&relay_id) {
            Some(line) => {
                line.switch_count = switch_count;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Driver that fails on selected pins and logs every write
    #[derive(Clone, Default)]
    struct FlakyDriver {
        writes: Arc<Mutex<Vec<(u32, bool)>>>,
        broken: Arc<Mutex<Vec<u32>>>,
    }

    impl RelayDriver for FlakyDriver {
        fn write(&mut self, pin: u32, on: bool) -> Result<(), HardwareFault> {
            if self.broken.lock().unwrap().contains(&pin) {
                return Err(HardwareFault { pin, reason: "stuck".into() });
            }
            self.writes.lock().unwrap().push((pin, on));
            Ok(())
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn id(n: u8) -> RelayId {
        RelayId::new(n).unwrap()
    }

    fn bank(pins: &[u32]) -> (RelayBank, FlakyDriver) {
        let driver = FlakyDriver::default();
        let bank = RelayBank::new(pins, PowerRatings::default(), Box::new(driver.clone())).unwrap();
        (bank, driver)
    }

    #[test]
    fn test_relay_id_parsing() {
        assert_eq!("relay_3".parse::<RelayId>().unwrap(), id(3));
        assert_eq!(id(16).to_string(), "relay_16");
        assert!("relay_0".parse::<RelayId>().is_err());
        assert!("relay_17".parse::<RelayId>().is_err());
        assert!("pump".parse::<RelayId>().is_err());
        assert!(id(2) < id(10));
    }

    #[test]
    fn test_construction_drives_all_off() {
        let (bank, driver) = bank(&[0, 1, 2, 3]);
        assert_eq!(bank.active_count(), 0);
        assert_eq!(*driver.writes.lock().unwrap(), vec![(0, false), (1, false), (2, false), (3, false)]);
        assert!(bank.lines().values().all(|l| l.last_changed.is_none() && l.switch_count == 0));
    }

    #[test]
    fn test_construction_fails_on_stuck_pin() {
        let driver = FlakyDriver::default();
        driver.broken.lock().unwrap().push(2);
        let err = RelayBank::new(&[0, 1, 2], PowerRatings::default(), Box::new(driver)).err().unwrap();
        assert_eq!(err.pin, 2);
    }

    #[test]
    fn test_set_updates_counters_and_power() {
        let (mut bank, _) = bank(&[10, 11, 12, 13, 14]);

        assert!(bank.set(id(3), true).unwrap());
        let line = &bank.lines()[&id(3)];
        assert!(line.status);
        assert_eq!(line.switch_count, 1);
        assert_eq!(line.power_usage, 1500.0);
        assert!(line.last_changed.is_some());

        // unknown ratings fall back to the default
        bank.set(id(5), true).unwrap();
        assert_eq!(bank.lines()[&id(5)].power_usage, 50.0);

        // same status: timestamp moves, counter does not
        bank.set(id(3), true).unwrap();
        assert_eq!(bank.lines()[&id(3)].switch_count, 1);

        bank.set(id(3), false).unwrap();
        let line = &bank.lines()[&id(3)];
        assert_eq!(line.switch_count, 2);
        assert_eq!(line.power_usage, 0.0);
        assert_eq!(bank.active_count(), 1);
    }

    #[test]
    fn test_set_unknown_relay_is_noop() {
        let (mut bank, driver) = bank(&[0, 1]);
        let before = bank.snapshot();
        assert!(!bank.set(id(9), true).unwrap());
        assert_eq!(bank.snapshot(), before);
        assert_eq!(driver.writes.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_set_hardware_fault_leaves_state() {
        let (mut bank, driver) = bank(&[0, 1]);
        driver.broken.lock().unwrap().push(1);
        let err = bank.set(id(2), true).unwrap_err();
        assert_eq!(err.pin, 1);
        assert_eq!(bank.status(id(2)), Some(false));
        assert_eq!(bank.lines()[&id(2)].switch_count, 0);
    }

    #[test]
    fn test_all_off_continues_past_failures() {
        let (mut bank, driver) = bank(&[0, 1, 2]);
        for n in 1..=3 {
            bank.set(id(n), true).unwrap();
        }
        driver.broken.lock().unwrap().push(1);

        let report = bank.all_off();
        assert_eq!(report.switched_off, vec![id(1), id(3)]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, id(2));
        assert!(!report.is_clean());
        assert_eq!(bank.active_count(), 1);
    }

    #[test]
    fn test_all_off_leaves_idle_lines_unstamped() {
        let (mut bank, driver) = bank(&[0, 1, 2]);
        bank.set(id(2), true).unwrap();
        let revision = bank.revision();

        let report = bank.all_off();
        assert_eq!(report.switched_off, vec![id(2)]);
        assert!(bank.revision() > revision);
        // every pin is still driven low
        assert_eq!(&driver.writes.lock().unwrap()[4..], &[(0, false), (1, false), (2, false)]);

        let idle = &bank.lines()[&id(1)];
        assert!(idle.last_changed.is_none());
        assert!(idle.last_changed_at.is_none());
        assert_eq!(idle.switch_count, 0);
        assert_eq!(bank.lines()[&id(2)].switch_count, 2);

        // nothing left to switch: no new revision
        let revision = bank.revision();
        assert!(bank.all_off().switched_off.is_empty());
        assert_eq!(bank.revision(), revision);
    }

    #[test]
    fn test_toggle_all_inverts_every_line() {
        let (mut bank, _) = bank(&[0, 1, 2]);
        bank.set(id(2), true).unwrap();
        let toggled = bank.toggle_all();
        assert_eq!(toggled.get(&id(1)), Some(&true));
        assert_eq!(toggled.get(&id(2)), Some(&false));
        assert_eq!(toggled.len(), 3);
        // no actuation happened
        assert_eq!(bank.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runtime_accumulates_on_spans() {
        let (mut bank, _) = bank(&[0]);
        bank.set(id(1), true).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(bank.lines()[&id(1)].runtime_at(Instant::now()), Duration::from_secs(30));

        bank.set(id(1), false).unwrap();
        tokio::time::advance(Duration::from_secs(100)).await;
        let doc = bank.documents()[&id(1)].clone();
        assert_eq!(doc.total_runtime, 30);
        assert!(!doc.status);
        assert!(doc.last_changed.is_some());
    }

    #[test]
    fn test_bank_status_and_names() {
        let (bank, _) = bank(&[0, 1]);
        let mut bank = bank.with_names(&["Porch light".to_string()]);
        bank.set(id(1), true).unwrap();
        assert_eq!(bank.lines()[&id(1)].name, "Porch light");
        assert_eq!(bank.lines()[&id(2)].name, "Relay 2");

        let status = bank.bank_status();
        assert_eq!(status.total_relays, 2);
        assert_eq!(status.active_relays, 1);
        assert_eq!(status.inactive_relays, 1);
        assert_eq!(status.total_power_usage, 100.0);
    }
}
