//! Simulated sensor
//!
//! A [`BlePlatform`] that advertises one sensor and, once notifications are
//! enabled, streams motion frames swinging around a target angle.

use crate::domain::models::{DevicePlacement, MotionReading, ScannedDevice};
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, LinkStatus, Permission, PlatformEvent, PlatformEventSender,
};
use crate::infrastructure::bluetooth::protocol::{self, LittleEndianCodec};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    pub device: ScannedDevice,
    /// Angle the simulated limb swings around
    pub center_angle: f32,
    /// Peak deviation from the center
    pub amplitude: f32,
    /// Full swings per second
    pub frequency_hz: f32,
    pub frame_interval: Duration,
    pub placement: DevicePlacement,
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self {
            device: ScannedDevice {
                name: format!("{}-SIM", protocol::DEVICE_NAME_PREFIX),
                address: "00:11:22:33:44:55".to_string(),
                signal_strength: -48,
            },
            center_angle: 90.0,
            amplitude: 20.0,
            frequency_hz: 0.25,
            frame_interval: Duration::from_millis(100),
            placement: DevicePlacement::Correct,
        }
    }
}

impl SimulatedSensor {
    /// Reading `n` frames after streaming started.
    pub fn frame(&self, n: u64) -> MotionReading {
        let t = n as f32 * self.frame_interval.as_secs_f32();
        let phase = std::f32::consts::TAU * self.frequency_hz * t;
        MotionReading {
            timestamp: 0,
            accelerometer_x: phase.cos() * 0.2,
            accelerometer_y: 9.81,
            accelerometer_z: phase.sin() * 0.2,
            gyroscope_x: 0.0,
            gyroscope_y: 0.0,
            gyroscope_z: self.amplitude * std::f32::consts::TAU * self.frequency_hz * phase.cos(),
            angle: self.center_angle + self.amplitude * phase.sin(),
        }
    }
}

#[derive(Default)]
struct SimState {
    events: Option<PlatformEventSender>,
    connected: bool,
    stream: Option<JoinHandle<()>>,
}

pub struct SimulatedPlatform {
    sensor: SimulatedSensor,
    state: Mutex<SimState>,
}

impl SimulatedPlatform {
    pub fn new(sensor: SimulatedSensor) -> Self {
        Self {
            sensor,
            state: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: PlatformEvent) -> Result<(), LinkError> {
        let state = self.state();
        let events = state.events.as_ref().ok_or(LinkError::NotConnected)?;
        events
            .send(event)
            .map_err(|_| LinkError::Platform("link event channel closed".into()))
    }

    fn stop_stream(state: &mut SimState) {
        if let Some(stream) = state.stream.take() {
            stream.abort();
        }
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new(SimulatedSensor::default())
    }
}

impl BlePlatform for SimulatedPlatform {
    fn has_permission(&self, _permission: Permission) -> bool {
        true
    }

    fn start_scan(&self, events: PlatformEventSender) -> Result<(), LinkError> {
        debug!("Simulated scan started");
        let _ = events.send(PlatformEvent::DeviceFound(self.sensor.device.clone()));
        self.state().events = Some(events);
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), LinkError> {
        debug!("Simulated scan stopped");
        Ok(())
    }

    fn connect(&self, address: &str, events: PlatformEventSender) -> Result<(), LinkError> {
        if address != self.sensor.device.address {
            return Err(LinkError::Platform(format!("no simulated device at {address}")));
        }
        debug!("Simulated connect to {} (attempt {})", address, events.attempt());
        {
            let mut state = self.state();
            state.events = Some(events);
            state.connected = true;
        }
        self.emit(PlatformEvent::ConnectionChanged(LinkStatus::Connecting))?;
        self.emit(PlatformEvent::ConnectionChanged(LinkStatus::Connected))
    }

    fn discover_services(&self, service: Uuid) -> Result<(), LinkError> {
        let result = if service == protocol::SERVICE_UUID {
            Ok(())
        } else {
            Err(format!("service {service} not offered"))
        };
        self.emit(PlatformEvent::ServicesDiscovered(result))
    }

    fn enable_notifications(&self, characteristics: &[Uuid]) -> Result<(), LinkError> {
        self.emit(PlatformEvent::NotificationsEnabled(Ok(())))?;

        let mut state = self.state();
        let Some(events) = state.events.clone() else {
            return Err(LinkError::NotConnected);
        };
        let sensor = self.sensor.clone();
        let streams_motion = characteristics.contains(&protocol::SENSOR_CHAR_UUID);
        let streams_placement = characteristics.contains(&protocol::PLACEMENT_CHAR_UUID);

        Self::stop_stream(&mut state);
        state.stream = Some(tokio::spawn(async move {
            if streams_placement {
                let _ = events.send(PlatformEvent::CharacteristicChanged {
                    uuid: protocol::PLACEMENT_CHAR_UUID,
                    value: LittleEndianCodec::encode_placement(sensor.placement),
                });
            }
            if !streams_motion {
                return;
            }
            let mut interval = tokio::time::interval(sensor.frame_interval);
            for n in 0u64.. {
                interval.tick().await;
                let event = PlatformEvent::CharacteristicChanged {
                    uuid: protocol::SENSOR_CHAR_UUID,
                    value: LittleEndianCodec::encode_motion(&sensor.frame(n)),
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        }));
        info!("Simulated sensor streaming");
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        let was_connected = {
            let mut state = self.state();
            Self::stop_stream(&mut state);
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            self.emit(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected))?;
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state();
        Self::stop_stream(&mut state);
        state.connected = false;
    }
}
