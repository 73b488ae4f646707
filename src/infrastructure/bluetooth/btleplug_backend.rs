//! btleplug backend
//!
//! Drives the host Bluetooth adapter. Every command spawns a task on the
//! current tokio runtime and reports completion through the link's event
//! channel.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::platform::{
    BlePlatform, LinkStatus, Permission, PlatformEvent, PlatformEventSender,
};
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct BackendState {
    events: Option<PlatformEventSender>,
    peripheral: Option<Peripheral>,
    scan_task: Option<JoinHandle<()>>,
    link_task: Option<JoinHandle<()>>,
    notify_task: Option<JoinHandle<()>>,
}

impl BackendState {
    fn abort_link_tasks(&mut self) {
        for task in [self.link_task.take(), self.notify_task.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

pub struct BtleplugPlatform {
    adapter: Adapter,
    state: Arc<Mutex<BackendState>>,
}

impl BtleplugPlatform {
    /// Open the first Bluetooth adapter of the host.
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| LinkError::Platform(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| LinkError::Platform(format!("Failed to get adapters: {e}")))?
            .into_iter()
            .next()
            .ok_or(LinkError::AdapterUnavailable)?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using Bluetooth adapter {}", info);
        }

        Ok(Self {
            adapter,
            state: Arc::new(Mutex::new(BackendState::default())),
        })
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        lock(&self.state)
    }

    fn connected(&self) -> Result<(Peripheral, PlatformEventSender), LinkError> {
        let state = self.state();
        match (&state.peripheral, &state.events) {
            (Some(peripheral), Some(events)) => Ok((peripheral.clone(), events.clone())),
            _ => Err(LinkError::NotConnected),
        }
    }
}

impl BlePlatform for BtleplugPlatform {
    fn has_permission(&self, _permission: Permission) -> bool {
        // Desktop stacks prompt for access on first use
        true
    }

    fn start_scan(&self, events: PlatformEventSender) -> Result<(), LinkError> {
        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            let mut central_events = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                error!("Failed to start scan: {}", e);
                return;
            }

            while let Some(event) = central_events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                if let Some(device) = describe(&adapter, &id).await {
                    if events.send(PlatformEvent::DeviceFound(device)).is_err() {
                        break;
                    }
                }
            }
        });

        let mut state = self.state();
        if let Some(previous) = state.scan_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), LinkError> {
        if let Some(task) = self.state().scan_task.take() {
            task.abort();
        }
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&self, address: &str, events: PlatformEventSender) -> Result<(), LinkError> {
        let adapter = self.adapter.clone();
        let state = Arc::clone(&self.state);
        let address = address.to_string();
        let link_events = events.clone();

        let task = tokio::spawn(async move {
            let _ = link_events.send(PlatformEvent::ConnectionChanged(LinkStatus::Connecting));

            let peripheral = match find_peripheral(&adapter, &address).await {
                Some(p) => p,
                None => {
                    warn!("Peripheral {} is no longer known to the adapter", address);
                    let _ = link_events.send(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
                    return;
                }
            };
            let mut central_events = match adapter.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to adapter events: {}", e);
                    let _ = link_events.send(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
                    return;
                }
            };
            if let Err(e) = peripheral.connect().await {
                error!("Failed to connect to {}: {}", address, e);
                let _ = link_events.send(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
                return;
            }

            let id = peripheral.id();
            lock(&state).peripheral = Some(peripheral);
            let _ = link_events.send(PlatformEvent::ConnectionChanged(LinkStatus::Connected));

            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event {
                    if gone == id {
                        info!("Peripheral {} disconnected", address);
                        lock(&state).peripheral = None;
                        let _ = link_events.send(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
                        break;
                    }
                }
            }
        });

        let mut state = self.state();
        state.abort_link_tasks();
        state.events = Some(events);
        state.link_task = Some(task);
        Ok(())
    }

    fn discover_services(&self, service: Uuid) -> Result<(), LinkError> {
        let (peripheral, events) = self.connected()?;
        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) if peripheral.services().iter().any(|s| s.uuid == service) => Ok(()),
                Ok(()) => Err(format!("service {service} not offered by device")),
                Err(e) => Err(e.to_string()),
            };
            let _ = events.send(PlatformEvent::ServicesDiscovered(result));
        });
        Ok(())
    }

    fn enable_notifications(&self, characteristics: &[Uuid]) -> Result<(), LinkError> {
        let (peripheral, events) = self.connected()?;
        let wanted = characteristics.to_vec();

        let task = tokio::spawn(async move {
            let available = peripheral.characteristics();
            for uuid in &wanted {
                let Some(characteristic) = available.iter().find(|c| c.uuid == *uuid) else {
                    let _ = events.send(PlatformEvent::NotificationsEnabled(Err(format!(
                        "characteristic {uuid} not found"
                    ))));
                    return;
                };
                if let Err(e) = peripheral.subscribe(characteristic).await {
                    let _ = events.send(PlatformEvent::NotificationsEnabled(Err(e.to_string())));
                    return;
                }
            }

            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = events.send(PlatformEvent::NotificationsEnabled(Err(e.to_string())));
                    return;
                }
            };
            let _ = events.send(PlatformEvent::NotificationsEnabled(Ok(())));

            while let Some(notification) = notifications.next().await {
                let event = PlatformEvent::CharacteristicChanged {
                    uuid: notification.uuid,
                    value: notification.value,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification stream ended");
        });

        if let Some(previous) = self.state().notify_task.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), LinkError> {
        let peripheral = self.state().peripheral.clone();
        if let Some(peripheral) = peripheral {
            tokio::spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to disconnect: {}", e);
                }
            });
        }
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state();
        state.abort_link_tasks();
        state.peripheral = None;
    }
}

async fn describe(adapter: &Adapter, id: &PeripheralId) -> Option<ScannedDevice> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    Some(ScannedDevice {
        name: properties.local_name?,
        address: peripheral.address().to_string(),
        signal_strength: properties.rssi.unwrap_or(i16::MIN),
    })
}

async fn find_peripheral(adapter: &Adapter, address: &str) -> Option<Peripheral> {
    adapter
        .peripherals()
        .await
        .ok()?
        .into_iter()
        .find(|p| p.address().to_string() == address)
}

fn lock(state: &Mutex<BackendState>) -> MutexGuard<'_, BackendState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
