//! Engine handle.
//! One explicitly constructed handle owns the configuration, the radio
//! backend, the connection pool and the scan controller. Component lifetime
//! is tied to this handle; there is no process-wide state.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::device::DeviceIdentity;
use crate::error::EngineError;
use crate::events::{
    ConnectCallback, DeviceEvent, MtuCallback, NotifyCallback, ReadCallback, RssiCallback,
    ScanCallback, WriteCallback,
};
use crate::platform::{ConnectionPriority, Radio, RadioState};
use crate::pool::ConnectionPool;
use crate::scanner::{ScanController, ScanFilter};
use crate::session::{CccdPolicy, ConnectionSession};

/// The BLE GATT client engine.
///
/// Cloning is cheap; every clone drives the same pool, scanner and radio.
/// All failures are delivered through the operation callbacks; no call
/// panics across the engine boundary.
#[derive(Clone)]
pub struct BleEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    radio: Arc<dyn Radio>,
    pool: ConnectionPool<ConnectionSession>,
    scanner: ScanController,
    radio_watch: Mutex<Option<JoinHandle<()>>>,
}

impl BleEngine {
    /// Builds an engine over the given radio backend.
    pub fn new(radio: Arc<dyn Radio>, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let inner = Arc::new(EngineInner {
            config: config.clone(),
            radio: radio.clone(),
            pool: ConnectionPool::new(config.max_connections),
            scanner: ScanController::new(radio.clone(), config),
            radio_watch: Mutex::new(None),
        });

        // Observe radio state for the lifetime of the engine: sessions
        // cannot outlive a powered-off radio.
        let mut state_rx = radio.observe_state();
        let weak = Arc::downgrade(&inner);
        let watcher = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                if state == RadioState::PoweredOn {
                    continue;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                warn!("radio left powered-on state ({state:?}); releasing all sessions");
                inner.scanner.stop();
                for session in inner.pool.clear() {
                    session.release(true).await;
                }
            }
        });
        *inner.radio_watch.lock().unwrap() = Some(watcher);

        Self { inner }
    }

    fn check_radio(&self) -> Result<(), EngineError> {
        match self.inner.radio.state() {
            RadioState::PoweredOn => Ok(()),
            RadioState::PoweredOff => Err(EngineError::RadioOff),
            RadioState::Unauthorized => Err(EngineError::PermissionDenied),
            RadioState::Unsupported => Err(EngineError::NotSupported),
        }
    }

    fn session_for(&self, identity: &DeviceIdentity) -> Result<ConnectionSession, EngineError> {
        self.check_radio()?;
        self.inner
            .pool
            .get(identity.address())
            .ok_or_else(|| EngineError::NotConnected {
                address: identity.address().to_string(),
            })
    }

    /// Starts a multi-attempt scan using the configured timeout, retry
    /// count and retry interval.
    pub fn start_scan(&self, filter: ScanFilter, callback: ScanCallback) {
        if let Err(err) = self.check_radio() {
            if let Some(handler) = &callback.on_fail {
                handler(&err);
            }
            return;
        }
        self.inner.scanner.start(filter, callback);
    }

    /// Stops the running scan sequence, if any.
    pub fn stop_scan(&self) {
        self.inner.scanner.stop();
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_scanning()
    }

    /// Scans until the first filter-matched device appears, then stops
    /// scanning and connects to it. Reports `ScanTimeout` when the whole
    /// sequence ends without a match.
    pub fn scan_then_connect(&self, filter: ScanFilter, callback: ConnectCallback) {
        if let Err(err) = self.check_radio() {
            if let Some(handler) = &callback.on_fail {
                handler(&err);
            }
            return;
        }

        let pending = Arc::new(Mutex::new(Some(callback)));
        let found: Arc<Mutex<Option<DeviceIdentity>>> = Arc::new(Mutex::new(None));

        let engine_on_match = self.clone();
        let found_on_match = found.clone();
        let engine_on_complete = self.clone();
        let pending_on_complete = pending.clone();

        let scan_callback = ScanCallback::new()
            .on_dedup_sighting(move |identity| {
                let mut found = found_on_match.lock().unwrap();
                if found.is_none() {
                    *found = Some(identity.clone());
                    engine_on_match.stop_scan();
                }
            })
            .on_complete(move |_report| {
                let Some(callback) = pending_on_complete.lock().unwrap().take() else {
                    return;
                };
                match found.lock().unwrap().take() {
                    Some(identity) => {
                        info!("scan-then-connect matched {identity}");
                        engine_on_complete.connect(&identity, callback);
                    }
                    None => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&EngineError::ScanTimeout);
                        }
                    }
                }
            })
            .on_fail(move |err| {
                if let Some(callback) = pending.lock().unwrap().take() {
                    if let Some(handler) = &callback.on_fail {
                        handler(err);
                    }
                }
            });
        self.inner.scanner.start(filter, scan_callback);
    }

    /// Connects to a device, pooling the session. When the pool is at
    /// capacity the least recently used session is disconnected first.
    pub fn connect(&self, identity: &DeviceIdentity, callback: ConnectCallback) {
        self.connect_with(identity, false, callback);
    }

    /// Like [`BleEngine::connect`], with an explicit force-reconnect flag.
    /// A forced connect re-issues the platform connect even when the
    /// session already reports connected.
    pub fn connect_with(&self, identity: &DeviceIdentity, force: bool, callback: ConnectCallback) {
        if let Err(err) = self.check_radio() {
            if let Some(handler) = &callback.on_fail {
                handler(&err);
            }
            return;
        }
        let inner = self.inner.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            let session = inner.admit_session(&identity).await;
            session.connect(force, callback);
        });
    }

    /// Connects to a bare address string, wrapping it into a minimal
    /// identity first.
    pub fn connect_address(&self, address: &str, callback: ConnectCallback) {
        match DeviceIdentity::from_address(address) {
            Ok(identity) => self.connect(&identity, callback),
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    /// Cancels an in-flight connect attempt without waiting for any
    /// network round trip.
    pub fn stop_connect(&self, identity: &DeviceIdentity) {
        if let Some(session) = self.inner.pool.get(identity.address()) {
            session.stop_connect();
        }
    }

    pub fn is_connected(&self, identity: &DeviceIdentity) -> bool {
        self.inner
            .pool
            .get(identity.address())
            .is_some_and(|session| session.is_connected())
    }

    /// Identities of every pooled session that is currently connected.
    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        self.inner
            .pool
            .values()
            .into_iter()
            .filter(|session| session.is_connected())
            .map(|session| session.identity().clone())
            .collect()
    }

    /// Standing per-device event channel: connection-state changes and
    /// characteristic-change data, independent of any pending operation.
    pub fn subscribe(&self, identity: &DeviceIdentity) -> Option<broadcast::Receiver<DeviceEvent>> {
        self.inner
            .pool
            .get(identity.address())
            .map(|session| session.subscribe())
    }

    pub fn enable_notify(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        policy: CccdPolicy,
        callback: NotifyCallback,
    ) {
        match self.session_for(identity) {
            Ok(session) => {
                session.enable_notifications(service, characteristic, policy, false, callback)
            }
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    pub fn disable_notify(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        policy: CccdPolicy,
    ) {
        if let Ok(session) = self.session_for(identity) {
            session.disable_notifications(service, characteristic, policy, false);
        }
    }

    pub fn enable_indicate(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        policy: CccdPolicy,
        callback: NotifyCallback,
    ) {
        match self.session_for(identity) {
            Ok(session) => {
                session.enable_notifications(service, characteristic, policy, true, callback)
            }
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    pub fn disable_indicate(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        policy: CccdPolicy,
    ) {
        if let Ok(session) = self.session_for(identity) {
            session.disable_notifications(service, characteristic, policy, true);
        }
    }

    pub fn read(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        callback: ReadCallback,
    ) {
        match self.session_for(identity) {
            Ok(session) => session.read(service, characteristic, callback),
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    pub fn write(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        callback: WriteCallback,
    ) {
        match self.session_for(identity) {
            Ok(session) => session.write(service, characteristic, value, callback),
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    /// Writes an ordered list of buffers, retrying each failed buffer up to
    /// `retry_count` times. See the write callback for per-buffer progress.
    pub fn write_queued(
        &self,
        identity: &DeviceIdentity,
        service: Uuid,
        characteristic: Uuid,
        buffers: Vec<Vec<u8>>,
        retry_count: u32,
        skip_empty: bool,
        callback: WriteCallback,
    ) {
        match self.session_for(identity) {
            Ok(session) => session.write_queued(
                service,
                characteristic,
                buffers,
                retry_count,
                skip_empty,
                callback,
            ),
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    pub fn read_rssi(&self, identity: &DeviceIdentity, callback: RssiCallback) {
        match self.session_for(identity) {
            Ok(session) => session.read_rssi(callback),
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    pub fn set_mtu(&self, identity: &DeviceIdentity, mtu: u16, callback: MtuCallback) {
        match self.session_for(identity) {
            Ok(session) => session.set_mtu(mtu, callback),
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
            }
        }
    }

    /// Forwards a connection-priority request to the link layer.
    pub async fn set_connection_priority(
        &self,
        identity: &DeviceIdentity,
        priority: ConnectionPriority,
    ) -> Result<(), EngineError> {
        let session = self.session_for(identity)?;
        session.set_connection_priority(priority).await
    }

    /// Disconnects one device and removes its session from the pool.
    pub async fn release(&self, identity: &DeviceIdentity) {
        if let Some(session) = self.inner.pool.remove(identity.address()) {
            session.release(true).await;
        }
    }

    /// Full teardown: stops scanning, disconnects and clears every pooled
    /// session, and unregisters the radio-state observation.
    pub async fn release_all(&self) {
        self.inner.scanner.stop();
        for session in self.inner.pool.clear() {
            session.release(true).await;
        }
        if let Some(watcher) = self.inner.radio_watch.lock().unwrap().take() {
            watcher.abort();
        }
        info!("engine released all sessions");
    }
}

impl EngineInner {
    /// Returns the pooled session for `identity`, creating one when absent.
    /// Evicted sessions are disconnected *before* the new entry is admitted,
    /// so a connect never fails solely due to capacity.
    async fn admit_session(&self, identity: &DeviceIdentity) -> ConnectionSession {
        loop {
            if let Some(session) = self.pool.get(identity.address()) {
                return session;
            }
            match self.pool.evict_candidate(identity.address()) {
                Some((address, victim)) => {
                    info!(
                        "pool at capacity: releasing {address} before admitting {}",
                        identity.address()
                    );
                    victim.release(true).await;
                }
                None => {
                    let session = ConnectionSession::new(
                        identity.clone(),
                        self.config.clone(),
                        self.radio.clone(),
                    );
                    if self.pool.insert_new(identity.address(), session.clone()) {
                        return session;
                    }
                }
            }
        }
    }
}
