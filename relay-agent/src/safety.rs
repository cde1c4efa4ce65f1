//! Hardware safety policy
//!
//! Pure decision over a bank snapshot. Three independent rules, all must pass:
//! concurrent-active ceiling, minimum dwell time, and lifetime wear ceiling.

use crate::config::SafetyConfig;
use crate::relay::{BankSnapshot, RelayId};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a transition was refused. An expected outcome, not a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyRefusal {
    TooManyActive { active: usize, max: usize },
    DwellTime { elapsed: Duration, min: Duration },
    WearLimit { switch_count: u32, max: u32 },
    UnknownRelay,
}

impl fmt::Display for SafetyRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyRefusal::TooManyActive { active, max } => {
                write!(f, "too many active relays ({}/{})", active, max)
            }
            SafetyRefusal::DwellTime { elapsed, min } => {
                write!(f, "rapid switching ({:?} < {:?})", elapsed, min)
            }
            SafetyRefusal::WearLimit { switch_count, max } => {
                write!(f, "switch count limit reached ({}/{})", switch_count, max)
            }
            SafetyRefusal::UnknownRelay => write!(f, "unknown relay"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    max_active: usize,
    min_dwell: Duration,
    max_switch_count: u32,
    enabled: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            max_active: 12,
            min_dwell: Duration::from_secs(1),
            max_switch_count: 10_000,
            enabled: true,
        }
    }
}

impl SafetyPolicy {
    pub fn new(max_active: usize, min_dwell: Duration, max_switch_count: u32) -> Self {
        Self {
            max_active,
            min_dwell,
            max_switch_count,
            enabled: true,
        }
    }

    pub fn from_config(config: &SafetyConfig) -> Self {
        let mut policy = Self::new(
            config.max_active,
            Duration::from_millis(config.min_dwell_ms),
            config.max_switch_count,
        );
        if !config.enabled {
            policy.disable("disabled in configuration");
        }
        policy
    }

    /// Administrative override. Always logged.
    pub fn disable(&mut self, reason: &str) {
        warn!("SAFETY CHECKS DISABLED: {}", reason);
        self.enabled = false;
    }

    pub fn enable(&mut self) {
        info!("Safety checks enabled");
        self.enabled = true;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Check a proposed transition against the current bank state
    pub fn evaluate(
        &self,
        relay_id: RelayId,
        proposed: bool,
        bank: &BankSnapshot,
        now: Instant,
    ) -> Result<(), SafetyRefusal> {
        if !self.enabled {
            return Ok(());
        }
        let line = bank.get(&relay_id).ok_or(SafetyRefusal::UnknownRelay)?;

        if proposed {
            let others_on = bank
                .values()
                .filter(|l| l.status && l.relay_id != relay_id)
                .count();
            if others_on + 1 > self.max_active {
                return Err(SafetyRefusal::TooManyActive {
                    active: others_on,
                    max: self.max_active,
                });
            }
        }

        if let Some(since) = line.last_changed {
            let elapsed = now.saturating_duration_since(since);
            if elapsed < self.min_dwell {
                return Err(SafetyRefusal::DwellTime {
                    elapsed,
                    min: self.min_dwell,
                });
            }
        }

        if line.switch_count >= self.max_switch_count {
            return Err(SafetyRefusal::WearLimit {
                switch_count: line.switch_count,
                max: self.max_switch_count,
            });
        }

        Ok(())
    }

    pub fn allowed(&self, relay_id: RelayId, proposed: bool, bank: &BankSnapshot, now: Instant) -> bool {
        match self.evaluate(relay_id, proposed, bank, now) {
            Ok(()) => true,
            Err(refusal) => {
                debug!("Safety: {} -> {} refused: {}", relay_id, proposed, refusal);
                false
            }
        }
    }
}
