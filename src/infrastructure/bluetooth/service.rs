//! Device Link Service
//!
//! Owns the single sensor connection: scanning, connecting, service
//! discovery, notification setup and demultiplexing of characteristic
//! updates into typed streams.

use crate::domain::exercise::BodyPart;
use crate::domain::models::{
    ConnectionState, DevicePlacement, MessageSeverity, MotionReading, ScannedDevice,
    StatusMessage,
};
use crate::infrastructure::bluetooth::{
    connection::{ConnectionTracker, LinkAction, LinkConfig},
    error::LinkError,
    platform::{
        BlePlatform, Permission, PlatformEvent, PlatformEventSender, TaggedEvent, SCAN_ATTEMPT,
    },
    protocol::{LittleEndianCodec, SensorCodec},
    scanner::BleScanner,
};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

struct LinkInner {
    tracker: ConnectionTracker,
    scanner: BleScanner,
}

struct LinkShared {
    platform: Arc<dyn BlePlatform>,
    codec: Arc<dyn SensorCodec>,
    config: LinkConfig,
    inner: Mutex<LinkInner>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    created: Instant,

    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<ScannedDevice>>,
    placement_tx: watch::Sender<DevicePlacement>,
    body_part_tx: watch::Sender<Option<BodyPart>>,
    readings_tx: broadcast::Sender<MotionReading>,
    status_tx: broadcast::Sender<StatusMessage>,

    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the device link. Cheap to clone; every clone drives the same
/// connection. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct DeviceLink {
    shared: Arc<LinkShared>,
}

impl DeviceLink {
    pub fn new(platform: Arc<dyn BlePlatform>, config: LinkConfig) -> Self {
        Self::with_codec(platform, Arc::new(LittleEndianCodec), config)
    }

    pub fn with_codec(
        platform: Arc<dyn BlePlatform>,
        codec: Arc<dyn SensorCodec>,
        config: LinkConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (devices_tx, _) = watch::channel(Vec::new());
        let (placement_tx, _) = watch::channel(DevicePlacement::Unknown);
        let (body_part_tx, _) = watch::channel(None);
        let (readings_tx, _) = broadcast::channel(config.reading_buffer.max(1));
        let (status_tx, _) = broadcast::channel(64);

        let shared = Arc::new(LinkShared {
            platform,
            codec,
            inner: Mutex::new(LinkInner {
                tracker: ConnectionTracker::new(),
                scanner: BleScanner::new(config.device_name_prefix.clone()),
            }),
            config,
            events_tx,
            created: Instant::now(),
            state_tx,
            devices_tx,
            placement_tx,
            body_part_tx,
            readings_tx,
            status_tx,
            pump: Mutex::new(None),
        });

        let pump = tokio::spawn(event_pump(Arc::downgrade(&shared), events_rx));
        *lock(&shared.pump) = Some(pump);

        Self { shared }
    }

    /// Start discovering devices of the configured family.
    ///
    /// Rejected without side effects when a scan is already running or the
    /// scan permission is missing.
    pub fn start_scan(&self) -> Result<(), LinkError> {
        let shared = &self.shared;
        if !shared.platform.has_permission(Permission::Scan) {
            warn!("Scan requested without scan permission");
            shared.send_log("Bluetooth scan permission missing", MessageSeverity::Warning);
            return Err(LinkError::PermissionDenied(Permission::Scan));
        }

        let generation = {
            let mut inner = lock(&shared.inner);
            if inner.scanner.is_scanning() {
                debug!("Scan already in progress");
                return Err(LinkError::ScanInProgress);
            }
            inner.scanner.begin()
        };
        shared.devices_tx.send_replace(Vec::new());

        if let Err(e) = shared.platform.start_scan(shared.events_sender(SCAN_ATTEMPT)) {
            error!("Failed to start scan: {}", e);
            lock(&shared.inner).scanner.end();
            return Err(e);
        }
        shared.send_log("Scanning for sensor devices...", MessageSeverity::Info);

        let timeout = shared.config.scan_timeout;
        let weak = Arc::downgrade(shared);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                let current = {
                    let inner = lock(&shared.inner);
                    inner.scanner.is_scanning() && inner.scanner.generation() == generation
                };
                if current {
                    info!("Scan timed out after {:?}", timeout);
                    shared.stop_scan();
                }
            }
        });

        Ok(())
    }

    /// Halt discovery. Idempotent.
    pub fn stop_scan(&self) {
        self.shared.stop_scan();
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.inner).scanner.is_scanning()
    }

    /// Connect to a previously discovered device.
    pub fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let shared = &self.shared;
        if !shared.platform.has_permission(Permission::Connect) {
            warn!("Connect requested without connect permission");
            return Err(LinkError::PermissionDenied(Permission::Connect));
        }

        let attempt = {
            let mut inner = lock(&shared.inner);
            if inner.tracker.state() != ConnectionState::Disconnected {
                return Err(LinkError::AlreadyConnected(inner.tracker.state()));
            }
            if inner.scanner.find(device_id).is_none() {
                return Err(LinkError::UnknownDevice(device_id.to_string()));
            }
            let attempt = inner.tracker.begin_connect(device_id)?;
            shared.publish_state(ConnectionState::Connecting);
            attempt
        };

        shared.stop_scan();
        info!("Connecting to device {} (attempt {})", device_id, attempt);
        shared.send_log(format!("Connecting to {device_id}..."), MessageSeverity::Info);

        let mut inner = lock(&shared.inner);
        if !inner.tracker.is_current(attempt) {
            debug!("Attempt {} was torn down before the platform connect", attempt);
            return Ok(());
        }
        if let Err(e) = shared.platform.connect(device_id, shared.events_sender(attempt)) {
            error!("Connection to {} failed: {}", device_id, e);
            inner.tracker.reset();
            shared.platform.close();
            shared.publish_state(ConnectionState::Disconnected);
            drop(inner);
            shared.send_log(format!("Connection failed: {e}"), MessageSeverity::Error);
            return Err(e);
        }

        Ok(())
    }

    /// Tear down the connection from any state. Never fails; calling it while
    /// already disconnected changes nothing.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// Disconnect, stop scanning and stop the event pump.
    pub fn shutdown(&self) {
        self.shared.stop_scan();
        self.shared.disconnect();
        if let Some(pump) = lock(&self.shared.pump).take() {
            pump.abort();
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn connected_address(&self) -> Option<String> {
        lock(&self.shared.inner).tracker.address().map(str::to_string)
    }

    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn watch_discovered_devices(&self) -> watch::Receiver<Vec<ScannedDevice>> {
        self.shared.devices_tx.subscribe()
    }

    pub fn discovered_devices(&self) -> Vec<ScannedDevice> {
        self.shared.devices_tx.borrow().clone()
    }

    pub fn watch_placement(&self) -> watch::Receiver<DevicePlacement> {
        self.shared.placement_tx.subscribe()
    }

    /// Every reading produced from now on.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<MotionReading> {
        self.shared.readings_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusMessage> {
        self.shared.status_tx.subscribe()
    }

    /// Record the body part the sensor is placed on.
    pub fn select_body_part(&self, body_part: BodyPart) {
        info!("Sensor placed on {:?}", body_part);
        self.shared.body_part_tx.send_replace(Some(body_part));
    }

    pub fn watch_body_part(&self) -> watch::Receiver<Option<BodyPart>> {
        self.shared.body_part_tx.subscribe()
    }
}

impl LinkShared {
    fn stop_scan(&self) {
        let was_scanning = lock(&self.inner).scanner.end();
        if !was_scanning {
            return;
        }
        info!("Stopping scan");
        if let Err(e) = self.platform.stop_scan() {
            warn!("Failed to stop scan: {}", e);
        }
        self.send_log("Scan stopped.", MessageSeverity::Info);
    }

    fn events_sender(&self, attempt: u64) -> PlatformEventSender {
        PlatformEventSender::new(attempt, self.events_tx.clone())
    }

    fn disconnect(&self) {
        {
            let mut inner = lock(&self.inner);
            if inner.tracker.reset() == ConnectionState::Disconnected {
                return;
            }
            if let Err(e) = self.platform.disconnect() {
                warn!("Platform disconnect failed: {}", e);
            }
            self.platform.close();
            self.publish_state(ConnectionState::Disconnected);
        }
        info!("Disconnected from device");
        self.send_log("Disconnected from device", MessageSeverity::Info);
    }

    /// Tracker transitions, state publication and the platform commands they
    /// trigger all happen under `inner`, so a concurrent disconnect either
    /// runs before them or after them as a whole.
    fn handle_event(&self, attempt: u64, event: PlatformEvent) {
        match event {
            PlatformEvent::DeviceFound(device) => {
                let devices = {
                    let mut inner = lock(&self.inner);
                    if inner.scanner.offer(device) {
                        Some(inner.scanner.devices().to_vec())
                    } else {
                        None
                    }
                };
                if let Some(devices) = devices {
                    self.devices_tx.send_replace(devices);
                }
            }
            PlatformEvent::ConnectionChanged(status) => {
                let mut inner = lock(&self.inner);
                let action = inner.tracker.on_link_status(attempt, status);
                self.publish_state(inner.tracker.state());
                self.run(action);
            }
            PlatformEvent::ServicesDiscovered(result) => {
                let mut inner = lock(&self.inner);
                let action = inner.tracker.on_services_discovered(attempt, result);
                self.run(action);
            }
            PlatformEvent::NotificationsEnabled(result) => {
                let mut inner = lock(&self.inner);
                let was_ready = inner.tracker.state() == ConnectionState::Ready;
                let action = inner.tracker.on_notifications_enabled(attempt, result);
                let state = inner.tracker.state();
                self.publish_state(state);
                self.run(action);
                drop(inner);
                if state == ConnectionState::Ready && !was_ready {
                    info!("Notifications enabled, device ready");
                    self.send_log("Device ready", MessageSeverity::Success);
                }
            }
            PlatformEvent::CharacteristicChanged { uuid, value } => {
                self.on_characteristic_changed(attempt, uuid, &value);
            }
        }
    }

    fn run(&self, action: LinkAction) {
        match action {
            LinkAction::None => {}
            LinkAction::DiscoverServices => {
                info!("Link established, discovering services");
                if let Err(e) = self.platform.discover_services(self.config.service_uuid) {
                    self.report(format!("Service discovery failed to start: {e}"));
                }
            }
            LinkAction::EnableNotifications => {
                let characteristics = [self.config.sensor_char_uuid, self.config.placement_char_uuid];
                if let Err(e) = self.platform.enable_notifications(&characteristics) {
                    self.report(format!("Enabling notifications failed: {e}"));
                }
            }
            LinkAction::Release => {
                warn!("Connection lost");
                self.platform.close();
                self.send_log("Connection lost", MessageSeverity::Warning);
            }
            LinkAction::Report(message) => self.report(message),
        }
    }

    fn on_characteristic_changed(&self, attempt: u64, uuid: Uuid, value: &[u8]) {
        let ready = {
            let inner = lock(&self.inner);
            inner.tracker.is_current(attempt) && inner.tracker.state() == ConnectionState::Ready
        };
        if !ready {
            trace!("Dropping notification from {} outside a ready connection", uuid);
            return;
        }

        if uuid == self.config.sensor_char_uuid {
            let timestamp = self.created.elapsed().as_millis() as u64;
            match self.codec.decode_motion(value, timestamp) {
                // No subscribers is fine
                Ok(reading) => {
                    let _ = self.readings_tx.send(reading);
                }
                Err(e) => warn!("Dropping malformed motion payload: {}", e),
            }
        } else if uuid == self.config.placement_char_uuid {
            match self.codec.decode_placement(value) {
                Ok(placement) => {
                    self.placement_tx.send_if_modified(|current| {
                        let changed = *current != placement;
                        *current = placement;
                        changed
                    });
                }
                Err(e) => warn!("Dropping malformed placement payload: {}", e),
            }
        } else {
            trace!("Ignoring notification from unknown characteristic {}", uuid);
        }
    }

    fn publish_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            debug!("Connection state -> {:?}", state);
        }
    }

    fn report(&self, message: String) {
        error!("{}", message);
        self.send_log(message, MessageSeverity::Error);
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.status_tx.send(StatusMessage::new(message, severity));
    }
}

async fn event_pump(shared: Weak<LinkShared>, mut events: mpsc::UnboundedReceiver<TaggedEvent>) {
    while let Some((attempt, event)) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_event(attempt, event);
    }
    debug!("Device link event pump stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // State stays consistent across a panicked holder; keep going
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::platform::LinkStatus;
    use crate::infrastructure::bluetooth::protocol;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::timeout;

    /// Platform double that completes every GATT step immediately unless
    /// told otherwise.
    #[derive(Default)]
    struct MockPlatform {
        deny_scan: bool,
        fail_connect: bool,
        fail_discovery: bool,
        /// Report the torn-down link like Android does, after the fact
        report_disconnect: bool,
        events: Mutex<Option<PlatformEventSender>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockPlatform {
        fn emit(&self, event: PlatformEvent) {
            let events = lock(&self.events);
            events.as_ref().expect("no event sender yet").send(event).unwrap();
        }

        fn calls(&self, name: &str) -> usize {
            lock(&self.calls).iter().filter(|c| **c == name).count()
        }

        fn record(&self, name: &'static str) {
            lock(&self.calls).push(name);
        }
    }

    impl BlePlatform for MockPlatform {
        fn has_permission(&self, permission: Permission) -> bool {
            !(self.deny_scan && permission == Permission::Scan)
        }

        fn start_scan(&self, events: PlatformEventSender) -> Result<(), LinkError> {
            self.record("start_scan");
            *lock(&self.events) = Some(events);
            Ok(())
        }

        fn stop_scan(&self) -> Result<(), LinkError> {
            self.record("stop_scan");
            Ok(())
        }

        fn connect(&self, _address: &str, events: PlatformEventSender) -> Result<(), LinkError> {
            self.record("connect");
            if self.fail_connect {
                return Err(LinkError::Platform("gatt 133".into()));
            }
            events.send(PlatformEvent::ConnectionChanged(LinkStatus::Connected)).unwrap();
            *lock(&self.events) = Some(events);
            Ok(())
        }

        fn discover_services(&self, _service: Uuid) -> Result<(), LinkError> {
            self.record("discover_services");
            let result = if self.fail_discovery { Err("no service".to_string()) } else { Ok(()) };
            self.emit(PlatformEvent::ServicesDiscovered(result));
            Ok(())
        }

        fn enable_notifications(&self, characteristics: &[Uuid]) -> Result<(), LinkError> {
            self.record("enable_notifications");
            assert_eq!(characteristics.len(), 2);
            self.emit(PlatformEvent::NotificationsEnabled(Ok(())));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), LinkError> {
            self.record("disconnect");
            if self.report_disconnect {
                self.emit(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
            }
            Ok(())
        }

        fn close(&self) {
            self.record("close");
        }
    }

    fn device(name: &str, address: &str) -> ScannedDevice {
        ScannedDevice {
            name: name.to_string(),
            address: address.to_string(),
            signal_strength: -55,
        }
    }

    fn link_with(platform: MockPlatform) -> (DeviceLink, Arc<MockPlatform>) {
        let platform = Arc::new(platform);
        let link = DeviceLink::new(platform.clone(), LinkConfig::default());
        (link, platform)
    }

    async fn wait_state(link: &DeviceLink, state: ConnectionState) {
        let mut rx = link.watch_connection_state();
        timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    async fn discover(link: &DeviceLink, platform: &MockPlatform, address: &str) {
        link.start_scan().unwrap();
        platform.emit(PlatformEvent::DeviceFound(device("PhysioDevice-01", address)));
        let mut rx = link.watch_discovered_devices();
        timeout(Duration::from_secs(1), rx.wait_for(|d| d.iter().any(|d| d.address == address)))
            .await
            .unwrap()
            .unwrap();
    }

    async fn ready_link() -> (DeviceLink, Arc<MockPlatform>) {
        let (link, platform) = link_with(MockPlatform::default());
        discover(&link, &platform, "AA").await;
        link.connect("AA").unwrap();
        wait_state(&link, ConnectionState::Ready).await;
        (link, platform)
    }

    #[tokio::test]
    async fn scan_without_permission_is_rejected() {
        let (link, platform) = link_with(MockPlatform {
            deny_scan: true,
            ..Default::default()
        });
        assert_eq!(link.start_scan(), Err(LinkError::PermissionDenied(Permission::Scan)));
        assert!(!link.is_scanning());
        assert_eq!(platform.calls("start_scan"), 0);
    }

    #[tokio::test]
    async fn scan_filters_devices_and_rejects_a_second_start() {
        let (link, platform) = link_with(MockPlatform::default());
        link.start_scan().unwrap();
        assert_eq!(link.start_scan(), Err(LinkError::ScanInProgress));

        platform.emit(PlatformEvent::DeviceFound(device("Headphones", "BB")));
        platform.emit(PlatformEvent::DeviceFound(device("PhysioDevice-01", "AA")));
        platform.emit(PlatformEvent::DeviceFound(device("PhysioDevice-01", "AA")));

        let mut rx = link.watch_discovered_devices();
        timeout(Duration::from_secs(1), rx.wait_for(|d| !d.is_empty()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.discovered_devices(), vec![device("PhysioDevice-01", "AA")]);

        link.stop_scan();
        link.stop_scan();
        assert_eq!(platform.calls("stop_scan"), 1);

        // A new scan starts from an empty list
        link.start_scan().unwrap();
        assert!(link.discovered_devices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_stops_after_timeout() {
        let (link, platform) = link_with(MockPlatform::default());
        link.start_scan().unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(link.is_scanning());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!link.is_scanning());
        assert_eq!(platform.calls("stop_scan"), 1);
    }

    #[tokio::test]
    async fn connect_walks_to_ready_and_stops_the_scan() {
        let (link, platform) = ready_link().await;
        assert!(!link.is_scanning());
        assert_eq!(platform.calls("stop_scan"), 1);
        assert_eq!(platform.calls("discover_services"), 1);
        assert_eq!(platform.calls("enable_notifications"), 1);
        assert_eq!(link.connected_address().as_deref(), Some("AA"));

        assert_eq!(
            link.connect("AA"),
            Err(LinkError::AlreadyConnected(ConnectionState::Ready))
        );
    }

    #[tokio::test]
    async fn connect_requires_a_discovered_device() {
        let (link, platform) = link_with(MockPlatform::default());
        assert_eq!(link.connect("ZZ"), Err(LinkError::UnknownDevice("ZZ".into())));
        assert_eq!(platform.calls("connect"), 0);
        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let (link, platform) = link_with(MockPlatform {
            fail_connect: true,
            ..Default::default()
        });
        discover(&link, &platform, "AA").await;

        assert!(matches!(link.connect("AA"), Err(LinkError::Platform(_))));
        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
        assert_eq!(link.connected_address(), None);
    }

    #[tokio::test]
    async fn notifications_are_decoded_and_demultiplexed() {
        let (link, platform) = ready_link().await;
        let mut readings = link.subscribe_readings();
        let mut placement = link.watch_placement();

        let mut reading = MotionReading::with_angle(0, 42.5);
        reading.gyroscope_z = 1.25;

        // Malformed frame is dropped, the following one goes through
        platform.emit(PlatformEvent::CharacteristicChanged {
            uuid: protocol::SENSOR_CHAR_UUID,
            value: vec![1, 2, 3],
        });
        platform.emit(PlatformEvent::CharacteristicChanged {
            uuid: protocol::SENSOR_CHAR_UUID,
            value: LittleEndianCodec::encode_motion(&reading),
        });
        platform.emit(PlatformEvent::CharacteristicChanged {
            uuid: protocol::PLACEMENT_CHAR_UUID,
            value: LittleEndianCodec::encode_placement(DevicePlacement::Correct),
        });

        let received = timeout(Duration::from_secs(1), readings.recv()).await.unwrap().unwrap();
        assert_eq!(received.angle, 42.5);
        assert_eq!(received.gyroscope_z, 1.25);

        timeout(Duration::from_secs(1), placement.wait_for(|p| *p == DevicePlacement::Correct))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(readings.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn discovery_failure_keeps_link_connected_without_readings() {
        let (link, platform) = link_with(MockPlatform {
            fail_discovery: true,
            ..Default::default()
        });
        let mut status = link.subscribe_status();
        let mut readings = link.subscribe_readings();
        discover(&link, &platform, "AA").await;
        link.connect("AA").unwrap();

        let error = timeout(Duration::from_secs(1), async {
            loop {
                let message = status.recv().await.unwrap();
                if message.severity == MessageSeverity::Error {
                    break message;
                }
            }
        })
        .await
        .unwrap();
        assert!(error.message.contains("Service discovery failed"));
        assert_eq!(link.connection_state(), ConnectionState::Connected);
        assert_eq!(platform.calls("enable_notifications"), 0);

        platform.emit(PlatformEvent::CharacteristicChanged {
            uuid: protocol::SENSOR_CHAR_UUID,
            value: LittleEndianCodec::encode_motion(&MotionReading::with_angle(0, 10.0)),
        });
        platform.emit(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
        wait_state(&link, ConnectionState::Disconnected).await;
        assert!(matches!(readings.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn disconnect_is_silent_when_already_disconnected() {
        let (link, platform) = ready_link().await;
        let mut state = link.watch_connection_state();
        state.borrow_and_update();

        link.disconnect();
        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
        assert!(state.has_changed().unwrap());
        state.borrow_and_update();
        assert_eq!(platform.calls("disconnect"), 1);
        assert_eq!(platform.calls("close"), 1);

        link.disconnect();
        assert!(!state.has_changed().unwrap());
        assert_eq!(platform.calls("disconnect"), 1);
    }

    #[tokio::test]
    async fn link_loss_releases_the_connection() {
        let (link, platform) = ready_link().await;
        platform.emit(PlatformEvent::ConnectionChanged(LinkStatus::Disconnected));
        wait_state(&link, ConnectionState::Disconnected).await;
        assert_eq!(platform.calls("close"), 1);
        assert_eq!(link.connected_address(), None);

        // Reconnect is allowed afterwards
        discover(&link, &platform, "AA").await;
        link.connect("AA").unwrap();
        wait_state(&link, ConnectionState::Ready).await;
    }

    #[tokio::test]
    async fn reconnect_right_after_disconnect_reaches_ready() {
        let (link, platform) = link_with(MockPlatform {
            report_disconnect: true,
            ..Default::default()
        });
        discover(&link, &platform, "AA").await;
        link.connect("AA").unwrap();
        wait_state(&link, ConnectionState::Ready).await;

        // The late Disconnected for the first link is still queued here
        link.disconnect();
        link.connect("AA").unwrap();
        wait_state(&link, ConnectionState::Ready).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.connection_state(), ConnectionState::Ready);
        assert_eq!(link.connected_address().as_deref(), Some("AA"));
        assert_eq!(platform.calls("connect"), 2);
        assert_eq!(platform.calls("close"), 1);

        let mut readings = link.subscribe_readings();
        platform.emit(PlatformEvent::CharacteristicChanged {
            uuid: protocol::SENSOR_CHAR_UUID,
            value: LittleEndianCodec::encode_motion(&MotionReading::with_angle(0, 30.0)),
        });
        let reading = timeout(Duration::from_secs(1), readings.recv()).await.unwrap().unwrap();
        assert_eq!(reading.angle, 30.0);
    }

    #[tokio::test]
    async fn callbacks_queued_before_a_disconnect_change_nothing() {
        let (link, platform) = link_with(MockPlatform::default());
        discover(&link, &platform, "AA").await;

        // Connected is queued by the platform but not yet pumped
        link.connect("AA").unwrap();
        link.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(link.connection_state(), ConnectionState::Disconnected);
        assert_eq!(platform.calls("discover_services"), 0);
        assert_eq!(link.connected_address(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disconnect_racing_the_event_pump_leaves_the_link_disconnected() {
        let (link, platform) = link_with(MockPlatform::default());
        discover(&link, &platform, "AA").await;

        for _ in 0..200 {
            link.connect("AA").unwrap();
            let racer = link.clone();
            tokio::spawn(async move { racer.disconnect() }).await.unwrap();

            tokio::time::sleep(Duration::from_millis(2)).await;
            assert_eq!(link.connection_state(), ConnectionState::Disconnected);
            assert_eq!(link.connected_address(), None);
        }
        assert_eq!(platform.calls("connect"), 200);
    }

    #[tokio::test]
    async fn body_part_selection_is_observable() {
        let (link, _platform) = link_with(MockPlatform::default());
        let rx = link.watch_body_part();
        assert_eq!(*rx.borrow(), None);
        link.select_body_part(BodyPart::Knee);
        assert_eq!(*rx.borrow(), Some(BodyPart::Knee));
    }
}
