//! BLE Scanner Module
//!
//! Keeps the set of discovered sensor devices for the current scan.

use crate::domain::models::ScannedDevice;
use tracing::{debug, info};

/// Discovered-device registry for one scan at a time.
pub struct BleScanner {
    name_prefix: String,
    devices: Vec<ScannedDevice>,
    scanning: bool,
    /// Bumped on every scan start so a stale timeout never stops a newer scan
    generation: u64,
}

impl BleScanner {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            devices: Vec::new(),
            scanning: false,
            generation: 0,
        }
    }

    /// Mark a new scan as started, clearing the previous results.
    /// Returns the generation of the new scan.
    pub fn begin(&mut self) -> u64 {
        self.devices.clear();
        self.scanning = true;
        self.generation += 1;
        info!("Scanning for devices named {}*", self.name_prefix);
        self.generation
    }

    /// Returns false if no scan was active.
    pub fn end(&mut self) -> bool {
        std::mem::replace(&mut self.scanning, false)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Offer an advertisement. Returns true if the device set changed.
    pub fn offer(&mut self, device: ScannedDevice) -> bool {
        if !self.scanning {
            return false;
        }
        if !self.matches(&device.name) {
            return false;
        }
        if let Some(existing) = self.devices.iter_mut().find(|d| d.address == device.address) {
            existing.signal_strength = device.signal_strength;
            return false;
        }
        debug!("Discovered {} ({})", device.name, device.address);
        self.devices.push(device);
        true
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.name_prefix)
    }

    pub fn find(&self, address: &str) -> Option<&ScannedDevice> {
        self.devices.iter().find(|d| d.address == address)
    }

    pub fn devices(&self) -> &[ScannedDevice] {
        &self.devices
    }
}
