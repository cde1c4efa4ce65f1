//! GPIO output drivers
//!
//! A driver only knows pins and logical levels (`true` = relay energised).
//! Active-low wiring is the driver's concern, not the bank's.

use crate::error::HardwareFault;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Physical output for relay lines
pub trait RelayDriver: Send {
    /// Drive one pin to the given logical level, synchronously
    fn write(&mut self, pin: u32, on: bool) -> Result<(), HardwareFault>;

    fn name(&self) -> &'static str;
}

/// In-memory driver for hosts without relay hardware
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    levels: HashMap<u32, bool>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: u32) -> Option<bool> {
        self.levels.get(&pin).copied()
    }
}

impl RelayDriver for SimulatedDriver {
    fn write(&mut self, pin: u32, on: bool) -> Result<(), HardwareFault> {
        debug!("[sim] pin {} -> {}", pin, if on { "ON" } else { "OFF" });
        self.levels.insert(pin, on);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Linux sysfs GPIO (`/sys/class/gpio`)
#[derive(Debug)]
pub struct SysfsGpio {
    root: PathBuf,
    active_low: bool,
}

impl SysfsGpio {
    /// Export every pin and configure it as an output
    pub fn open(root: impl AsRef<Path>, pins: &[u32], active_low: bool) -> Result<Self, HardwareFault> {
        let root = root.as_ref().to_path_buf();

        for &pin in pins {
            let pin_dir = root.join(format!("gpio{}", pin));
            if !pin_dir.exists() {
                fs::write(root.join("export"), pin.to_string()).map_err(|e| HardwareFault {
                    pin,
                    reason: format!("export failed: {}", e),
                })?;
            }
            // "high"/"low" set direction and the de-energised level in one write
            let direction = if active_low { "high" } else { "low" };
            fs::write(pin_dir.join("direction"), direction).map_err(|e| HardwareFault {
                pin,
                reason: format!("direction failed: {}", e),
            })?;
        }

        info!("sysfs GPIO ready on {} ({} pins, active_low={})", root.display(), pins.len(), active_low);
        Ok(Self { root, active_low })
    }

    fn raw_level(&self, on: bool) -> &'static str {
        // active low: 0 energises the coil
        match (on, self.active_low) {
            (true, true) | (false, false) => "0",
            (true, false) | (false, true) => "1",
        }
    }
}

impl RelayDriver for SysfsGpio {
    fn write(&mut self, pin: u32, on: bool) -> Result<(), HardwareFault> {
        let path = self.root.join(format!("gpio{}", pin)).join("value");
        fs::write(&path, self.raw_level(on)).map_err(|e| HardwareFault {
            pin,
            reason: format!("{}: {}", path.display(), e),
        })
    }

    fn name(&self) -> &'static str {
        "sysfs"
    }
}
