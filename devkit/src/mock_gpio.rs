/*!
Recording relay driver

Remembers every write and the last level per pin, and can be told to fail
writes on chosen pins. Clones share state so a test keeps a handle after the
bank takes ownership of its boxed copy.
*/

use parking_lot::Mutex;
use relayhub_agent::relay::driver::RelayDriver;
use relayhub_agent::HardwareFault;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct DriverState {
    writes: Vec<(u32, bool)>,
    levels: HashMap<u32, bool>,
    failing: HashSet<u32>,
}

#[derive(Clone, Default)]
pub struct RecordingDriver {
    state: Arc<Mutex<DriverState>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn RelayDriver> {
        Box::new(self.clone())
    }

    /// Logical level last written to `pin`
    pub fn level(&self, pin: u32) -> Option<bool> {
        self.state.lock().levels.get(&pin).copied()
    }

    pub fn writes(&self) -> Vec<(u32, bool)> {
        self.state.lock().writes.clone()
    }

    pub fn writes_to(&self, pin: u32) -> usize {
        self.state.lock().writes.iter().filter(|(p, _)| *p == pin).count()
    }

    pub fn energised(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self
            .state
            .lock()
            .levels
            .iter()
            .filter(|(_, on)| **on)
            .map(|(pin, _)| *pin)
            .collect();
        pins.sort_unstable();
        pins
    }

    pub fn fail_pin(&self, pin: u32) {
        self.state.lock().failing.insert(pin);
        log::info!("[MOCK] GPIO {} will fail", pin);
    }

    pub fn heal_pin(&self, pin: u32) {
        self.state.lock().failing.remove(&pin);
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

impl RelayDriver for RecordingDriver {
    fn write(&mut self, pin: u32, on: bool) -> Result<(), HardwareFault> {
        let mut state = self.state.lock();
        if state.failing.contains(&pin) {
            return Err(HardwareFault {
                pin,
                reason: "injected write failure".to_string(),
            });
        }
        state.writes.push((pin, on));
        state.levels.insert(pin, on);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
