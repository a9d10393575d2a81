//! Per-device connection session.
//! Owns the GATT link, the lanes operations run on, the per-characteristic
//! callback registries, and the connect/disconnect state machine.

mod ops;

pub use ops::CccdPolicy;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{DEFAULT_ATT_MTU, EngineConfig};
use crate::device::DeviceIdentity;
use crate::error::EngineError;
use crate::events::{ConnectCallback, DeviceEvent, MtuCallback, NotifyCallback};
use crate::platform::{GattLink, GattService, LinkEvent, Radio};
use crate::queue::{LaneSet, OpKind};

/// Interval of the is-still-connected poll after issuing a disconnect.
const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(4);
/// Polling window for a deliberate teardown. The platform needs more time
/// to fully release native resources than it does to notice link loss.
const ACTIVE_RELEASE_WINDOW: Duration = Duration::from_millis(600);
/// Polling window after passive link loss.
const PASSIVE_RELEASE_WINDOW: Duration = Duration::from_millis(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectState {
    Idle,
    Connecting,
    Connected,
    /// Terminal failure of the last connect request; a fresh `Connecting`
    /// transition is allowed from here.
    ConnectFailure,
    /// Link released, deliberately or by loss; reconnectable.
    Disconnected,
}

/// Routing key for a one-shot operation awaiting its platform completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PendingKey {
    kind: OpKind,
    characteristic: Option<Uuid>,
}

impl PendingKey {
    pub(crate) fn characteristic(kind: OpKind, uuid: Uuid) -> Self {
        Self {
            kind,
            characteristic: Some(uuid),
        }
    }

    pub(crate) fn bare(kind: OpKind) -> Self {
        Self {
            kind,
            characteristic: None,
        }
    }
}

/// Waiters for in-flight platform requests. Registered *before* the
/// platform primitive is issued so a fast completion cannot race ahead of
/// registration.
pub(crate) struct PendingRegistry {
    slots: Mutex<HashMap<PendingKey, mpsc::UnboundedSender<LinkEvent>>>,
}

impl PendingRegistry {
    fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, key: PendingKey, sender: mpsc::UnboundedSender<LinkEvent>) {
        self.slots.lock().unwrap().insert(key, sender);
    }

    pub(crate) fn deregister(&self, key: PendingKey) {
        self.slots.lock().unwrap().remove(&key);
    }

    /// Delivers `event` to the waiter registered under `key`, if any.
    fn route(&self, key: PendingKey, event: LinkEvent) -> bool {
        let sender = self.slots.lock().unwrap().get(&key).cloned();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Drops every waiter. Their receivers observe a closed channel and the
    /// owning tasks fail instead of touching a stale link.
    fn abort_all(&self) {
        self.slots.lock().unwrap().clear();
    }
}

struct SessionInner {
    identity: DeviceIdentity,
    config: Arc<EngineConfig>,
    radio: Arc<dyn Radio>,
    state: Mutex<ConnectState>,
    link: Mutex<Option<Arc<dyn GattLink>>>,
    services: Mutex<Vec<GattService>>,
    lanes: LaneSet,
    pending: PendingRegistry,
    notify_callbacks: Mutex<HashMap<Uuid, Arc<NotifyCallback>>>,
    indicate_callbacks: Mutex<HashMap<Uuid, Arc<NotifyCallback>>>,
    connect_callback: Mutex<Option<Arc<ConnectCallback>>>,
    pending_connect: Mutex<Option<oneshot::Sender<Result<(), i32>>>>,
    connect_cancel: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<DeviceEvent>,
    mtu: AtomicU16,
    disconnect_reported: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
}

/// One live (or in-progress) connection to one peripheral. Cheap to clone;
/// at most one session exists per address, enforced by the pool.
#[derive(Clone)]
pub(crate) struct ConnectionSession {
    inner: Arc<SessionInner>,
}

enum AttemptError {
    Cancelled,
    Timeout,
    Failed(EngineError),
}

impl ConnectionSession {
    pub(crate) fn new(
        identity: DeviceIdentity,
        config: Arc<EngineConfig>,
        radio: Arc<dyn Radio>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let lanes = LaneSet::new(identity.address().to_string(), config.queue_mode);
        Self {
            inner: Arc::new(SessionInner {
                identity,
                config,
                radio,
                state: Mutex::new(ConnectState::Idle),
                link: Mutex::new(None),
                services: Mutex::new(Vec::new()),
                lanes,
                pending: PendingRegistry::new(),
                notify_callbacks: Mutex::new(HashMap::new()),
                indicate_callbacks: Mutex::new(HashMap::new()),
                connect_callback: Mutex::new(None),
                pending_connect: Mutex::new(None),
                connect_cancel: Mutex::new(None),
                events,
                mtu: AtomicU16::new(DEFAULT_ATT_MTU),
                disconnect_reported: AtomicBool::new(false),
                router: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn identity(&self) -> &DeviceIdentity {
        &self.inner.identity
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(*self.inner.state.lock().unwrap(), ConnectState::Connected)
    }

    /// Standing per-device event channel, independent of any pending task.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn current_mtu(&self) -> u16 {
        self.inner.mtu.load(Ordering::SeqCst)
    }

    /// Starts (or short-circuits) a connect request. All outcomes are
    /// reported through `callback`; one terminal event per request.
    pub(crate) fn connect(&self, force: bool, callback: ConnectCallback) {
        let callback = Arc::new(callback);
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                ConnectState::Connected if !force => {
                    drop(state);
                    debug!("device {} already connected", self.inner.identity);
                    if let Some(handler) = &callback.on_success {
                        handler(&self.inner.identity);
                    }
                    return;
                }
                ConnectState::Connecting => {
                    drop(state);
                    if let Some(handler) = &callback.on_fail {
                        handler(&EngineError::AlreadyConnecting);
                    }
                    return;
                }
                _ => *state = ConnectState::Connecting,
            }
        }

        *self.inner.connect_callback.lock().unwrap() = Some(callback.clone());
        let cancel = CancellationToken::new();
        *self.inner.connect_cancel.lock().unwrap() = Some(cancel.clone());
        if let Some(handler) = &callback.on_start {
            handler();
        }
        info!("connecting to {}", self.inner.identity);

        let session = self.clone();
        tokio::spawn(async move {
            session.drive_connect(cancel, force).await;
        });
    }

    /// Cancels an in-flight connect attempt without waiting for any
    /// network round trip. Silent: cancellation is not an error.
    pub(crate) fn stop_connect(&self) {
        if let Some(cancel) = self.inner.connect_cancel.lock().unwrap().take() {
            cancel.cancel();
        }
    }

    async fn drive_connect(&self, cancel: CancellationToken, force: bool) {
        if force {
            // A forced reconnect starts from a clean link.
            if let Some(link) = self.take_link() {
                let _ = link.disconnect().await;
            }
            self.abort_router();
        }

        let timeout = Duration::from_millis(self.inner.config.connect_timeout_ms);
        let retry_interval = Duration::from_millis(self.inner.config.connect_retry_interval_ms);
        let mut attempts_left = self.inner.config.connect_retry_count;

        loop {
            match self.attempt_connect(&cancel, timeout).await {
                Ok(()) => {
                    self.finish_connect_success().await;
                    return;
                }
                Err(AttemptError::Cancelled) => {
                    debug!("connect to {} cancelled", self.inner.identity);
                    self.reset_after_cancel();
                    return;
                }
                Err(AttemptError::Timeout) if attempts_left == 0 => {
                    self.finish_connect_failure(EngineError::ConnectTimeout);
                    return;
                }
                Err(AttemptError::Failed(err)) if attempts_left == 0 => {
                    self.finish_connect_failure(err);
                    return;
                }
                Err(attempt) => {
                    attempts_left -= 1;
                    let reason = match attempt {
                        AttemptError::Timeout => "timed out".to_string(),
                        AttemptError::Failed(err) => err.to_string(),
                        AttemptError::Cancelled => unreachable!("handled above"),
                    };
                    warn!(
                        "connect attempt to {} failed ({reason}), retrying in {retry_interval:?}",
                        self.inner.identity
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.reset_after_cancel();
                            return;
                        }
                        _ = sleep(retry_interval) => {}
                    }
                }
            }
        }
    }

    /// One platform connect attempt, service discovery included.
    async fn attempt_connect(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), AttemptError> {
        let existing = self.inner.link.lock().unwrap().clone();
        let link = match existing {
            Some(link) => link,
            None => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let link = self
                    .inner
                    .radio
                    .open_link(self.inner.identity.address(), events_tx)
                    .await
                    .map_err(|err| AttemptError::Failed(err.into()))?;
                *self.inner.link.lock().unwrap() = Some(link.clone());
                let session = self.clone();
                let router = tokio::spawn(async move {
                    session.route_events(events_rx).await;
                });
                if let Some(old) = self.inner.router.lock().unwrap().replace(router) {
                    old.abort();
                }
                link
            }
        };

        let (resolved_tx, resolved_rx) = oneshot::channel();
        *self.inner.pending_connect.lock().unwrap() = Some(resolved_tx);

        if let Err(err) = link.connect().await {
            self.inner.pending_connect.lock().unwrap().take();
            return Err(AttemptError::Failed(err.into()));
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            _ = sleep(timeout) => Err(AttemptError::Timeout),
            resolved = resolved_rx => match resolved {
                Ok(Ok(())) => Ok(()),
                Ok(Err(status)) => Err(AttemptError::Failed(EngineError::Gatt { status })),
                Err(_) => Err(AttemptError::Failed(EngineError::Internal(
                    "connect resolver dropped".into(),
                ))),
            }
        };
        if result.is_err() {
            self.inner.pending_connect.lock().unwrap().take();
            return result;
        }

        let services = link
            .discover_services()
            .await
            .map_err(|err| AttemptError::Failed(err.into()))?;
        *self.inner.services.lock().unwrap() = services;
        Ok(())
    }

    async fn finish_connect_success(&self) {
        *self.inner.state.lock().unwrap() = ConnectState::Connected;
        self.inner.disconnect_reported.store(false, Ordering::SeqCst);
        self.inner.connect_cancel.lock().unwrap().take();
        self.inner.mtu.store(DEFAULT_ATT_MTU, Ordering::SeqCst);
        info!("device {} connected", self.inner.identity);

        let callback = self.inner.connect_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            if let Some(handler) = &callback.on_success {
                handler(&self.inner.identity);
            }
        }
        let _ = self.inner.events.send(DeviceEvent::ConnectionChanged {
            connected: true,
            status: 0,
        });

        if self.inner.config.auto_set_mtu && self.inner.config.default_mtu > DEFAULT_ATT_MTU {
            let requested = self.inner.config.default_mtu;
            debug!(
                "requesting configured mtu {requested} for {}",
                self.inner.identity
            );
            self.set_mtu(
                requested,
                MtuCallback::new().on_fail(|err| warn!("automatic mtu request failed: {err}")),
            );
        }
    }

    fn finish_connect_failure(&self, err: EngineError) {
        *self.inner.state.lock().unwrap() = ConnectState::ConnectFailure;
        self.inner.connect_cancel.lock().unwrap().take();
        self.take_link();
        self.abort_router();
        error!("connect to {} failed: {err}", self.inner.identity);
        let callback = self.inner.connect_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            if let Some(handler) = &callback.on_fail {
                handler(&err);
            }
        }
    }

    fn reset_after_cancel(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if *state == ConnectState::Connecting {
            *state = ConnectState::Idle;
        }
        drop(state);
        self.inner.connect_cancel.lock().unwrap().take();
        self.inner.pending_connect.lock().unwrap().take();
        self.take_link();
        self.abort_router();
    }

    /// Routes platform events to the matching waiter or standing callback.
    async fn route_events(&self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::ConnectionState { connected, status } => {
                    self.on_connection_state(connected, status);
                }
                LinkEvent::CharacteristicChanged {
                    characteristic,
                    value,
                } => {
                    let notify = self
                        .inner
                        .notify_callbacks
                        .lock()
                        .unwrap()
                        .get(&characteristic)
                        .cloned();
                    if let Some(callback) = notify {
                        if let Some(handler) = &callback.on_data {
                            handler(&value);
                        }
                    }
                    let indicate = self
                        .inner
                        .indicate_callbacks
                        .lock()
                        .unwrap()
                        .get(&characteristic)
                        .cloned();
                    if let Some(callback) = indicate {
                        if let Some(handler) = &callback.on_data {
                            handler(&value);
                        }
                    }
                    let _ = self.inner.events.send(DeviceEvent::CharacteristicChanged {
                        characteristic,
                        value,
                    });
                }
                LinkEvent::CharacteristicRead { characteristic, .. } => {
                    self.inner.pending.route(
                        PendingKey::characteristic(OpKind::Read, characteristic),
                        event,
                    );
                }
                LinkEvent::CharacteristicWritten { characteristic, .. } => {
                    self.inner.pending.route(
                        PendingKey::characteristic(OpKind::Write, characteristic),
                        event,
                    );
                }
                LinkEvent::DescriptorWritten { characteristic, .. } => {
                    let delivered = self.inner.pending.route(
                        PendingKey::characteristic(OpKind::Notify, characteristic),
                        event.clone(),
                    );
                    if !delivered {
                        self.inner.pending.route(
                            PendingKey::characteristic(OpKind::Indicate, characteristic),
                            event,
                        );
                    }
                }
                LinkEvent::MtuChanged { mtu, status } => {
                    if status == 0 {
                        self.inner.mtu.store(mtu, Ordering::SeqCst);
                    }
                    self.inner.pending.route(PendingKey::bare(OpKind::Mtu), event);
                }
                LinkEvent::RssiRead { .. } => {
                    self.inner.pending.route(PendingKey::bare(OpKind::Rssi), event);
                }
            }
        }
    }

    fn on_connection_state(&self, connected: bool, status: i32) {
        if connected {
            if let Some(resolver) = self.inner.pending_connect.lock().unwrap().take() {
                let _ = resolver.send(Ok(()));
            }
            return;
        }
        if let Some(resolver) = self.inner.pending_connect.lock().unwrap().take() {
            let _ = resolver.send(Err(status));
            return;
        }
        if self.is_connected() {
            warn!(
                "device {} lost its link (status {status})",
                self.inner.identity
            );
            let session = self.clone();
            tokio::spawn(async move {
                session.finish_disconnect(false, status).await;
            });
        }
    }

    /// Tears the session down: cancels queues, releases the link and fires
    /// the single user-visible disconnected event. `active` marks a
    /// deliberate teardown as opposed to link loss.
    pub(crate) async fn release(&self, active: bool) {
        self.stop_connect();
        let was_connected = self.is_connected();
        if active && was_connected {
            let callback = self.inner.connect_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                if let Some(handler) = &callback.on_disconnecting {
                    handler(&self.inner.identity);
                }
            }
        }
        self.inner.lanes.clear_all();
        if was_connected {
            self.finish_disconnect(active, 0).await;
        } else {
            self.inner.pending.abort_all();
            self.take_link();
            self.abort_router();
            *self.inner.state.lock().unwrap() = ConnectState::Disconnected;
        }
        self.inner.notify_callbacks.lock().unwrap().clear();
        self.inner.indicate_callbacks.lock().unwrap().clear();
    }

    async fn finish_disconnect(&self, active: bool, status: i32) {
        if self.inner.disconnect_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.state.lock().unwrap() = ConnectState::Disconnected;
        self.inner.pending.abort_all();

        if let Some(link) = self.take_link() {
            if active {
                let _ = link.disconnect().await;
            }
            // Releasing the native handle is itself asynchronous and not
            // reliably signalled; poll until the handle reports down.
            let window = if active {
                ACTIVE_RELEASE_WINDOW
            } else {
                PASSIVE_RELEASE_WINDOW
            };
            let deadline = Instant::now() + window;
            while link.is_connected() && Instant::now() < deadline {
                sleep(RELEASE_POLL_INTERVAL).await;
            }
        }
        self.abort_router();

        info!(
            "device {} disconnected (active: {active}, status {status})",
            self.inner.identity
        );
        let callback = self.inner.connect_callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            if let Some(handler) = &callback.on_disconnected {
                handler(&self.inner.identity, active, status);
            }
        }
        let _ = self.inner.events.send(DeviceEvent::ConnectionChanged {
            connected: false,
            status,
        });
    }

    fn take_link(&self) -> Option<Arc<dyn GattLink>> {
        self.inner.link.lock().unwrap().take()
    }

    fn abort_router(&self) {
        if let Some(router) = self.inner.router.lock().unwrap().take() {
            router.abort();
        }
    }
}
