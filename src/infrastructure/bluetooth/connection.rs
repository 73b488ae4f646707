//! BLE Connection Module
//!
//! Connection configuration and the connection state machine:
//! DISCONNECTED -> CONNECTING -> CONNECTED -> READY, with any state falling
//! back to DISCONNECTED on disconnect or link loss.

use crate::domain::models::ConnectionState;
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::platform::LinkStatus;
use crate::infrastructure::bluetooth::protocol;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Service UUID to discover
    pub service_uuid: Uuid,
    /// Motion characteristic UUID
    pub sensor_char_uuid: Uuid,
    /// Placement characteristic UUID
    pub placement_char_uuid: Uuid,
    /// Advertised name prefix used to filter scan results
    pub device_name_prefix: String,
    /// Scans stop on their own after this long
    pub scan_timeout: Duration,
    /// Readings buffered per subscriber before the slowest one lags
    pub reading_buffer: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE_UUID,
            sensor_char_uuid: protocol::SENSOR_CHAR_UUID,
            placement_char_uuid: protocol::PLACEMENT_CHAR_UUID,
            device_name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            scan_timeout: Duration::from_secs(30),
            reading_buffer: 256,
        }
    }
}

impl LinkConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, LinkError> {
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            sensor_char_uuid: protocol::parse_uuid(&settings.ble_sensor_char_uuid)?,
            placement_char_uuid: protocol::parse_uuid(&settings.ble_placement_char_uuid)?,
            device_name_prefix: settings.device_name_prefix.clone(),
            scan_timeout: Duration::from_secs(settings.scan_timeout_secs),
            ..Default::default()
        })
    }
}

/// What the link must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    None,
    DiscoverServices,
    EnableNotifications,
    /// Release the platform handle after a disconnect
    Release,
    /// Report a failure; the state is unchanged
    Report(String),
}

/// Connection state machine. Pure bookkeeping; the link service performs
/// the returned actions against the platform.
///
/// Each `begin_connect` opens a new attempt. Callbacks tagged with any other
/// attempt belong to a connection that was already torn down and never
/// change the state.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    state: ConnectionState,
    address: Option<String>,
    attempt: u64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// True while `attempt` is the live connection attempt.
    pub fn is_current(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.state != ConnectionState::Disconnected
    }

    /// Start a connection attempt. Only valid while disconnected.
    pub fn begin_connect(&mut self, address: &str) -> Result<u64, LinkError> {
        if self.state != ConnectionState::Disconnected {
            return Err(LinkError::AlreadyConnected(self.state));
        }
        self.attempt += 1;
        self.state = ConnectionState::Connecting;
        self.address = Some(address.to_string());
        Ok(self.attempt)
    }

    pub fn on_link_status(&mut self, attempt: u64, status: LinkStatus) -> LinkAction {
        if !self.is_current(attempt) {
            debug!("Ignoring stale {:?} callback from attempt {}", status, attempt);
            return LinkAction::None;
        }
        match (status, self.state) {
            (LinkStatus::Disconnected, _) => {
                self.reset();
                LinkAction::Release
            }
            (LinkStatus::Connecting, ConnectionState::Connecting) => LinkAction::None,
            (LinkStatus::Connecting, state) => {
                warn!("Unexpected Connecting callback while {:?}", state);
                LinkAction::None
            }
            (LinkStatus::Connected, ConnectionState::Connecting) => {
                self.state = ConnectionState::Connected;
                LinkAction::DiscoverServices
            }
            (LinkStatus::Connected, _) => LinkAction::None,
        }
    }

    pub fn on_services_discovered(&mut self, attempt: u64, result: Result<(), String>) -> LinkAction {
        if !self.is_current(attempt) || self.state != ConnectionState::Connected {
            debug!("Ignoring service discovery result while {:?}", self.state);
            return LinkAction::None;
        }
        match result {
            Ok(()) => LinkAction::EnableNotifications,
            Err(e) => LinkAction::Report(format!("Service discovery failed: {e}")),
        }
    }

    pub fn on_notifications_enabled(&mut self, attempt: u64, result: Result<(), String>) -> LinkAction {
        if !self.is_current(attempt) || self.state != ConnectionState::Connected {
            debug!("Ignoring notification setup result while {:?}", self.state);
            return LinkAction::None;
        }
        match result {
            Ok(()) => {
                self.state = ConnectionState::Ready;
                LinkAction::None
            }
            Err(e) => LinkAction::Report(format!("Enabling notifications failed: {e}")),
        }
    }

    /// Force DISCONNECTED. Returns the state the tracker was in.
    pub fn reset(&mut self) -> ConnectionState {
        self.address = None;
        std::mem::replace(&mut self.state, ConnectionState::Disconnected)
    }
}
