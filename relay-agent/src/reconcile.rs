//! Reconciliation loop
//!
//! One cycle: `Idle -> Pulling -> Diffing -> Applying -> Publishing -> Idle`.
//! Any failure routes to `Fault`, bumps the fault counter and abandons the
//! cycle; the next scheduled tick is the retry. A snapshot that failed to
//! publish stays pending and is retried by later cycles even when nothing
//! else changes.

use crate::error::{AgentError, HardwareFault};
use crate::relay::{RelayBank, RelayId};
use crate::remote::{DevicePaths, RemoteStateClient, StoreTransport};
use crate::safety::{SafetyPolicy, SafetyRefusal};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Target statuses read from the store. Advisory only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState(BTreeMap<RelayId, bool>);

impl DesiredState {
    /// Parse a `relays` document. Missing or malformed entries request nothing.
    pub fn from_document(doc: Option<&Value>) -> Self {
        let Some(Value::Object(entries)) = doc else {
            return Self::default();
        };

        let mut desired = BTreeMap::new();
        for (key, entry) in entries {
            let Ok(relay_id) = key.parse::<RelayId>() else {
                debug!("Ignoring unknown relay key {}", key);
                continue;
            };
            let status = match entry.get("status") {
                Some(Value::Bool(b)) => *b,
                Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
                _ => continue,
            };
            desired.insert(relay_id, status);
        }
        Self(desired)
    }

    pub fn get(&self, relay_id: RelayId) -> Option<bool> {
        self.0.get(&relay_id).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RelayId, bool)> + '_ {
        self.0.iter().map(|(id, s)| (*id, *s))
    }
}

impl From<BTreeMap<RelayId, bool>> for DesiredState {
    fn from(map: BTreeMap<RelayId, bool>) -> Self {
        Self(map)
    }
}

/// Consecutive failures since the last fully successful cycle
#[derive(Debug, Clone)]
pub struct FaultCounter {
    count: u32,
    ceiling: u32,
}

impl FaultCounter {
    pub fn new(ceiling: u32) -> Self {
        Self { count: 0, ceiling }
    }

    /// Count one fault; true once the ceiling is reached
    pub fn record(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        self.is_exhausted()
    }

    pub fn reset(&mut self) {
        if self.count > 0 {
            debug!("Fault counter reset from {}", self.count);
        }
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    pub fn is_exhausted(&self) -> bool {
        self.count >= self.ceiling
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Pulling,
    Diffing,
    Applying,
    Publishing,
    Fault,
}

/// What the applying step did
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ApplyReport {
    pub changed: Vec<RelayId>,
    pub refused: Vec<(RelayId, SafetyRefusal)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed { report: ApplyReport, published: bool },
    Faulted { stage: CycleState, error: AgentError },
}

impl CycleOutcome {
    pub fn is_fault(&self) -> bool {
        matches!(self, CycleOutcome::Faulted { .. })
    }
}

pub struct ReconciliationLoop {
    paths: DevicePaths,
    policy: SafetyPolicy,
    faults: FaultCounter,
    state: CycleState,
    cycles: u64,
    /// Set when the bank moved on since the last successful publish
    publish_pending: bool,
}

impl ReconciliationLoop {
    pub fn new(paths: DevicePaths, policy: SafetyPolicy, faults: FaultCounter) -> Self {
        Self {
            paths,
            policy,
            faults,
            state: CycleState::Idle,
            cycles: 0,
            publish_pending: false,
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    pub fn faults(&self) -> &FaultCounter {
        &self.faults
    }

    pub fn faults_mut(&mut self) -> &mut FaultCounter {
        &mut self.faults
    }

    pub fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    pub fn publish_pending(&self) -> bool {
        self.publish_pending
    }

    /// Have the next cycle publish even if nothing new changes
    pub fn mark_unpublished(&mut self) {
        self.publish_pending = true;
    }

    /// Run one full cycle. Never propagates: failures become `Faulted`.
    pub async fn run_cycle<T: StoreTransport>(
        &mut self,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
    ) -> CycleOutcome {
        self.cycles += 1;
        let outcome = match self.cycle_steps(client, bank).await {
            Ok((report, published)) => {
                self.faults.reset();
                CycleOutcome::Completed { report, published }
            }
            Err(error) => {
                let stage = self.state;
                self.state = CycleState::Fault;
                self.faults.record();
                warn!(
                    "Sync cycle {} failed while {:?} ({}/{} faults): {}",
                    self.cycles,
                    stage,
                    self.faults.count(),
                    self.faults.ceiling(),
                    error
                );
                CycleOutcome::Faulted { stage, error }
            }
        };
        self.state = CycleState::Idle;
        outcome
    }

    async fn cycle_steps<T: StoreTransport>(
        &mut self,
        client: &mut RemoteStateClient<T>,
        bank: &mut RelayBank,
    ) -> Result<(ApplyReport, bool), AgentError> {
        self.state = CycleState::Pulling;
        let doc = client.get(&self.paths.relays()).await?;
        let desired = DesiredState::from_document(doc.as_ref());

        self.state = CycleState::Diffing;
        let changes = Self::diff(&desired, bank);

        let mut report = ApplyReport::default();
        if !changes.is_empty() {
            self.state = CycleState::Applying;
            let revision = bank.revision();
            let applied = self.apply(&changes, bank);
            if bank.revision() != revision {
                self.publish_pending = true;
            }
            match applied {
                Ok(applied) => report = applied,
                Err(fault) => {
                    // lines switched before the fault still get published
                    if self.publish_pending {
                        self.state = CycleState::Publishing;
                        match publish_snapshot(client, &self.paths, bank).await {
                            Ok(()) => self.publish_pending = false,
                            Err(e) => warn!("Partial snapshot not published: {}", e),
                        }
                        self.state = CycleState::Applying;
                    }
                    return Err(fault.into());
                }
            }
        }

        if !self.publish_pending {
            return Ok((report, false));
        }

        self.state = CycleState::Publishing;
        publish_snapshot(client, &self.paths, bank).await?;
        self.publish_pending = false;
        Ok((report, true))
    }

    /// Lines whose desired status differs from the bank, ascending relay order
    pub fn diff(desired: &DesiredState, bank: &RelayBank) -> Vec<(RelayId, bool)> {
        desired
            .iter()
            .filter(|(id, status)| bank.status(*id).is_some_and(|actual| actual != *status))
            .collect()
    }

    /// Apply changes in order, each gated by the safety policy against the
    /// bank as it stands after the previous change.
    pub fn apply(&self, changes: &[(RelayId, bool)], bank: &mut RelayBank) -> Result<ApplyReport, HardwareFault> {
        let mut report = ApplyReport::default();

        for &(relay_id, status) in changes {
            if let Err(refusal) = self.policy.evaluate(relay_id, status, bank.lines(), Instant::now()) {
                debug!("Safety: {} -> {} refused: {}", relay_id, status, refusal);
                report.refused.push((relay_id, refusal));
                continue;
            }
            match bank.set(relay_id, status) {
                Ok(true) => report.changed.push(relay_id),
                Ok(false) => {}
                Err(e) => {
                    error!("Hardware fault on {}: {}", relay_id, e);
                    return Err(e);
                }
            }
        }

        if !report.changed.is_empty() || !report.refused.is_empty() {
            info!(
                "Applied {} change(s), {} refused, {} relays active",
                report.changed.len(),
                report.refused.len(),
                bank.active_count()
            );
        }
        Ok(report)
    }

    /// Diff and apply an externally built desired state (bulk commands)
    pub fn apply_desired(&self, desired: &DesiredState, bank: &mut RelayBank) -> Result<ApplyReport, HardwareFault> {
        let changes = Self::diff(desired, bank);
        self.apply(&changes, bank)
    }
}

/// Publish the whole bank plus `last_update` in one atomic write
pub async fn publish_snapshot<T: StoreTransport>(
    client: &mut RemoteStateClient<T>,
    paths: &DevicePaths,
    bank: &RelayBank,
) -> Result<(), AgentError> {
    let mut updates = BTreeMap::new();
    for (relay_id, doc) in bank.documents() {
        let value = serde_json::to_value(&doc)?;
        updates.insert(paths.relay(relay_id), value);
    }
    updates.insert(paths.last_update(), Value::String(crate::now_timestamp()));

    client.put_atomic(updates).await?;
    debug!("Published snapshot of {} relays", bank.lines().len());
    Ok(())
}
