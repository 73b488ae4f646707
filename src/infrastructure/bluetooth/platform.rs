//! BLE Platform Seam
//!
//! The link drives the operating system's BLE stack through [`BlePlatform`].
//! Commands return immediately; completions and notifications come back as
//! [`PlatformEvent`]s on the sender handed over in `start_scan`/`connect`.
//!
//! Every `connect` gets a sender tagged with its own attempt number. Late
//! callbacks from a connection that was already torn down keep their old tag
//! and are ignored by the link.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::error::LinkError;
use tokio::sync::mpsc::{self, error::SendError};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Scan,
    Connect,
}

/// Link-level connection status as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    DeviceFound(ScannedDevice),
    ConnectionChanged(LinkStatus),
    ServicesDiscovered(Result<(), String>),
    NotificationsEnabled(Result<(), String>),
    CharacteristicChanged { uuid: Uuid, value: Vec<u8> },
}

/// Attempt tag carried by scan senders. Connection attempts count from 1.
pub const SCAN_ATTEMPT: u64 = 0;

pub(crate) type TaggedEvent = (u64, PlatformEvent);

#[derive(Debug, Clone)]
pub struct PlatformEventSender {
    attempt: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl PlatformEventSender {
    pub(crate) fn new(attempt: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { attempt, tx }
    }

    /// Connection attempt this sender belongs to.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn send(&self, event: PlatformEvent) -> Result<(), SendError<PlatformEvent>> {
        self.tx
            .send((self.attempt, event))
            .map_err(|SendError((_, event))| SendError(event))
    }
}

/// Commands are issued while the link holds its connection lock. They must
/// return without waiting on the radio and must not call back into the link.
pub trait BlePlatform: Send + Sync {
    fn has_permission(&self, permission: Permission) -> bool;

    fn start_scan(&self, events: PlatformEventSender) -> Result<(), LinkError>;

    fn stop_scan(&self) -> Result<(), LinkError>;

    fn connect(&self, address: &str, events: PlatformEventSender) -> Result<(), LinkError>;

    /// Completion arrives as [`PlatformEvent::ServicesDiscovered`].
    fn discover_services(&self, service: Uuid) -> Result<(), LinkError>;

    /// Completion arrives as [`PlatformEvent::NotificationsEnabled`].
    fn enable_notifications(&self, characteristics: &[Uuid]) -> Result<(), LinkError>;

    fn disconnect(&self) -> Result<(), LinkError>;

    /// Release the platform connection handle. Must be safe to call repeatedly.
    fn close(&self);
}
