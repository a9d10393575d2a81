//! Callback surface.
//! Each operation takes an immutable subscription value built once at the
//! call site: a struct of optional boxed handlers. Handlers may fire from
//! the engine's worker tasks, so they must be `Send + Sync` and must not
//! block.

use uuid::Uuid;

use crate::device::DeviceIdentity;
use crate::error::EngineError;

type Handler0 = Box<dyn Fn() + Send + Sync>;
type FailHandler = Box<dyn Fn(&EngineError) + Send + Sync>;

/// Accumulated result of one whole multi-attempt scan sequence.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Every sighting, duplicates included, across all attempts.
    pub raw: Vec<DeviceIdentity>,
    /// First sighting per address, filter-matched, across all attempts.
    pub deduplicated: Vec<DeviceIdentity>,
}

/// Subscription for a scan sequence. `on_start`/`on_complete` fire exactly
/// once per sequence; the sighting handlers fire per advertisement.
#[derive(Default)]
pub struct ScanCallback {
    pub(crate) on_start: Option<Handler0>,
    pub(crate) on_sighting: Option<Box<dyn Fn(&DeviceIdentity) + Send + Sync>>,
    pub(crate) on_dedup_sighting: Option<Box<dyn Fn(&DeviceIdentity) + Send + Sync>>,
    pub(crate) on_fail: Option<FailHandler>,
    pub(crate) on_complete: Option<Box<dyn Fn(ScanReport) + Send + Sync>>,
}

impl ScanCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(handler));
        self
    }

    /// Fires for every sighting, before filtering or de-duplication.
    pub fn on_sighting(mut self, handler: impl Fn(&DeviceIdentity) + Send + Sync + 'static) -> Self {
        self.on_sighting = Some(Box::new(handler));
        self
    }

    /// Fires for the first filter-matched sighting of each address.
    pub fn on_dedup_sighting(
        mut self,
        handler: impl Fn(&DeviceIdentity) + Send + Sync + 'static,
    ) -> Self {
        self.on_dedup_sighting = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }

    pub fn on_complete(mut self, handler: impl Fn(ScanReport) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(handler));
        self
    }
}

/// Subscription for a connect request and the lifetime of the resulting
/// connection. The disconnect handlers stay armed until the session is
/// released.
#[derive(Default)]
pub struct ConnectCallback {
    pub(crate) on_start: Option<Handler0>,
    pub(crate) on_success: Option<Box<dyn Fn(&DeviceIdentity) + Send + Sync>>,
    pub(crate) on_fail: Option<FailHandler>,
    pub(crate) on_disconnecting: Option<Box<dyn Fn(&DeviceIdentity) + Send + Sync>>,
    /// `active` distinguishes a requested teardown from link loss.
    pub(crate) on_disconnected: Option<Box<dyn Fn(&DeviceIdentity, bool, i32) + Send + Sync>>,
}

impl ConnectCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Box::new(handler));
        self
    }

    pub fn on_success(
        mut self,
        handler: impl Fn(&DeviceIdentity) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }

    pub fn on_disconnecting(
        mut self,
        handler: impl Fn(&DeviceIdentity) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnecting = Some(Box::new(handler));
        self
    }

    pub fn on_disconnected(
        mut self,
        handler: impl Fn(&DeviceIdentity, bool, i32) + Send + Sync + 'static,
    ) -> Self {
        self.on_disconnected = Some(Box::new(handler));
        self
    }
}

/// Standing subscription for notify or indicate traffic. `on_data` keeps
/// firing for every characteristic-change event until explicitly disabled.
#[derive(Default)]
pub struct NotifyCallback {
    pub(crate) on_success: Option<Handler0>,
    pub(crate) on_fail: Option<FailHandler>,
    pub(crate) on_data: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
}

impl NotifyCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }

    pub fn on_data(mut self, handler: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Box::new(handler));
        self
    }
}

/// One-shot read subscription.
#[derive(Default)]
pub struct ReadCallback {
    pub(crate) on_success: Option<Box<dyn Fn(&[u8]) + Send + Sync>>,
    pub(crate) on_fail: Option<FailHandler>,
}

impl ReadCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, handler: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }
}

/// Write subscription. `on_success` fires per buffer with (index, total,
/// payload); `on_complete` fires once after the last buffer succeeded.
#[derive(Default)]
pub struct WriteCallback {
    pub(crate) on_success: Option<Box<dyn Fn(usize, usize, &[u8]) + Send + Sync>>,
    pub(crate) on_fail: Option<FailHandler>,
    pub(crate) on_complete: Option<Handler0>,
}

impl WriteCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(
        mut self,
        handler: impl Fn(usize, usize, &[u8]) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }

    pub fn on_complete(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(handler));
        self
    }
}

/// One-shot RSSI subscription.
#[derive(Default)]
pub struct RssiCallback {
    pub(crate) on_success: Option<Box<dyn Fn(i16) + Send + Sync>>,
    pub(crate) on_fail: Option<FailHandler>,
}

impl RssiCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success(mut self, handler: impl Fn(i16) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }
}

/// One-shot MTU negotiation subscription.
#[derive(Default)]
pub struct MtuCallback {
    pub(crate) on_changed: Option<Box<dyn Fn(u16) + Send + Sync>>,
    pub(crate) on_fail: Option<FailHandler>,
}

impl MtuCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_changed(mut self, handler: impl Fn(u16) + Send + Sync + 'static) -> Self {
        self.on_changed = Some(Box::new(handler));
        self
    }

    pub fn on_fail(mut self, handler: impl Fn(&EngineError) + Send + Sync + 'static) -> Self {
        self.on_fail = Some(Box::new(handler));
        self
    }
}

/// Standing per-device event channel, delivered independently of any
/// pending task. Consumers are responsible for their own synchronization
/// against queued operations on the same characteristic.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    ConnectionChanged {
        connected: bool,
        status: i32,
    },
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
}
