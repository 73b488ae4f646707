use serde::{Deserialize, Serialize};

/// Phase of the single device connection owned by the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Services discovered and notifications enabled; reading streams are live.
    Ready,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "No connection",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Ready => "Ready",
        }
    }
}

/// Device-reported classification of how the sensor is worn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DevicePlacement {
    Correct,
    Incorrect,
    #[default]
    Unknown,
}

/// One sensor sample, stamped by the link when the notification arrives.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionReading {
    /// Monotonic milliseconds since the link was created
    pub timestamp: u64,
    pub accelerometer_x: f32,
    pub accelerometer_y: f32,
    pub accelerometer_z: f32,
    pub gyroscope_x: f32,
    pub gyroscope_y: f32,
    pub gyroscope_z: f32,
    /// Derived single-axis joint angle in degrees
    pub angle: f32,
}

impl MotionReading {
    /// Convenience constructor for a reading that only carries an angle.
    pub fn with_angle(timestamp: u64, angle: f32) -> Self {
        Self {
            timestamp,
            angle,
            ..Default::default()
        }
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedDevice {
    pub name: String,
    /// Platform address, also used as the device id for `connect`
    pub address: String,
    pub signal_strength: i16,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
