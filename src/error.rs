//! Unified error type for the engine.
//! Every failure delivered through a callback is one of these variants;
//! nothing else crosses the engine boundary.

use thiserror::Error;
use uuid::Uuid;

use crate::platform::PlatformError;

/// Top-level error type surfaced through operation callbacks.
#[derive(Debug, Error)]
pub enum EngineError {
    // Capability / permission. Detected synchronously, never enqueued.
    /// The hardware has no BLE support.
    #[error("bluetooth low energy is not supported on this hardware")]
    NotSupported,

    /// The radio is powered off.
    #[error("bluetooth radio is powered off")]
    RadioOff,

    /// Runtime permission for BLE is missing.
    #[error("missing bluetooth permission")]
    PermissionDenied,

    // Scan
    /// A scan sequence is already running.
    #[error("a scan is already running")]
    AlreadyScanning,

    /// Scan-then-connect found no matching device before its deadline.
    #[error("scan found no matching device")]
    ScanTimeout,

    /// The platform could not start or sustain discovery.
    #[error("scan failed: {0}")]
    ScanFailed(String),

    // Connect
    /// No usable target address.
    #[error("no usable target device: {0}")]
    NoTargetDevice(String),

    /// The connect attempt (retries exhausted) ran out of time.
    #[error("connect attempt timed out")]
    ConnectTimeout,

    /// A connect attempt for this device is already in flight.
    #[error("a connect attempt is already in flight")]
    AlreadyConnecting,

    // Operations
    /// The target device is not connected.
    #[error("device {address} is not connected")]
    NotConnected { address: String },

    /// No such characteristic under the given service.
    #[error("characteristic {characteristic} not found under service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    /// The characteristic does not advertise the required GATT property.
    #[error("characteristic {characteristic} does not support {property}")]
    PropertyUnsupported {
        characteristic: Uuid,
        property: &'static str,
    },

    /// No descriptor matched the configured resolution policy.
    #[error("no matching descriptor on characteristic {characteristic}")]
    DescriptorNotFound { characteristic: Uuid },

    /// The client-configuration descriptor write was rejected.
    #[error("descriptor write failed with status {status}")]
    DescriptorWriteFailed { status: i32 },

    /// The platform refused to toggle characteristic notification routing.
    #[error("platform rejected the notification toggle")]
    SetNotificationFailed,

    /// A queued operation did not complete within its deadline.
    #[error("operation timed out")]
    OperationTimeout,

    /// Single-write payload larger than the negotiated MTU allows.
    #[error("payload of {len} bytes exceeds what mtu {mtu} allows")]
    DataExceedsMtu { len: usize, mtu: u16 },

    /// Requested MTU outside the 23..=517 range.
    #[error("requested mtu {0} is out of range")]
    MtuOutOfRange(u16),

    /// Nothing to write after filtering.
    #[error("write payload is empty")]
    EmptyPayload,

    /// Low-level GATT failure carrying the platform status code.
    #[error("gatt failure (status {status})")]
    Gatt { status: i32 },

    /// Engine-internal fault, e.g. a panicking task body.
    #[error("internal failure: {0}")]
    Internal(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl EngineError {
    /// Numeric platform status code, where one accompanied the failure.
    pub fn status_code(&self) -> Option<i32> {
        match self {
            EngineError::Gatt { status }
            | EngineError::DescriptorWriteFailed { status }
            | EngineError::Platform(PlatformError::Status { status }) => Some(*status),
            _ => None,
        }
    }
}
