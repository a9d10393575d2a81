//! Platform radio boundary.
//! The host Bluetooth stack is an external dependency behind these traits:
//! it provides connect/disconnect/read/write/notify primitives whose
//! completions arrive asynchronously as [`LinkEvent`]s.

pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Standard client-characteristic-configuration descriptor.
pub const CLIENT_CHARACTERISTIC_CONFIG: Uuid =
    Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];
/// CCCD value disabling both.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// ATT header overhead subtracted from the MTU for a single write payload.
pub const ATT_WRITE_OVERHEAD: u16 = 3;

/// Failure reported by the platform stack itself.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    /// No usable adapter, or the adapter went away.
    #[error("bluetooth adapter unavailable")]
    AdapterUnavailable,
    /// The GATT link was closed underneath the call.
    #[error("gatt link is closed")]
    LinkClosed,
    /// The stack rejected the call with a numeric status code.
    #[error("platform call failed with status {status}")]
    Status { status: i32 },
    /// Anything the platform reports only as text.
    #[error("{0}")]
    Other(String),
}

/// Power and permission state of the host radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    /// Runtime permission for BLE has not been granted.
    Unauthorized,
    /// The hardware has no BLE support at all.
    Unsupported,
}

/// Connection priority values accepted by the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionPriority {
    Balanced,
    High,
    LowPower,
}

/// GATT characteristic property bits, as defined by the Bluetooth spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharProps(pub u16);

impl CharProps {
    pub const BROADCAST: CharProps = CharProps(0x01);
    pub const READ: CharProps = CharProps(0x02);
    pub const WRITE_WITHOUT_RESPONSE: CharProps = CharProps(0x04);
    pub const WRITE: CharProps = CharProps(0x08);
    pub const NOTIFY: CharProps = CharProps(0x10);
    pub const INDICATE: CharProps = CharProps(0x20);

    pub fn contains(self, other: CharProps) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CharProps {
    type Output = CharProps;

    fn bitor(self, rhs: CharProps) -> CharProps {
        CharProps(self.0 | rhs.0)
    }
}

/// Descriptor attached to a characteristic.
#[derive(Debug, Clone)]
pub struct GattDescriptor {
    pub uuid: Uuid,
}

/// Characteristic entry in a discovered service table.
#[derive(Debug, Clone)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service: Uuid,
    pub properties: CharProps,
    pub descriptors: Vec<GattDescriptor>,
}

/// Service entry in a discovered service table.
#[derive(Debug, Clone)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

/// A single advertisement sighting delivered during discovery.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub payload: Option<Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
}

/// Completion and unsolicited events from one GATT link.
///
/// `status` follows the platform convention: zero is success, anything else
/// is a stack-specific error code passed through to the caller.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    ConnectionState {
        connected: bool,
        status: i32,
    },
    CharacteristicRead {
        characteristic: Uuid,
        value: Vec<u8>,
        status: i32,
    },
    CharacteristicWritten {
        characteristic: Uuid,
        status: i32,
    },
    /// Peripheral-initiated notify/indicate data. Not tied to any request.
    CharacteristicChanged {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    DescriptorWritten {
        characteristic: Uuid,
        descriptor: Uuid,
        status: i32,
    },
    MtuChanged {
        mtu: u16,
        status: i32,
    },
    RssiRead {
        rssi: i16,
        status: i32,
    },
}

/// Handle to a running discovery pass. Dropping it, or calling `stop`,
/// ends the flow of sightings.
pub trait DiscoverySession: Send {
    fn stop(self: Box<Self>);
}

/// Host radio: capability queries, discovery, and link opening.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Current radio state. Consulted synchronously before every operation.
    fn state(&self) -> RadioState;

    /// Watches radio state transitions for the lifetime of the engine.
    fn observe_state(&self) -> watch::Receiver<RadioState>;

    /// Starts one discovery pass; sightings flow into `sink` until the
    /// returned session is stopped.
    async fn start_discovery(
        &self,
        sink: mpsc::UnboundedSender<Advertisement>,
    ) -> Result<Box<dyn DiscoverySession>, PlatformError>;

    /// Opens (but does not connect) a GATT link to `address`. All
    /// asynchronous completions for the link arrive on `events`.
    async fn open_link(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn GattLink>, PlatformError>;
}

/// One GATT link to one peripheral, exclusively owned by its session.
///
/// Methods return as soon as the request is issued; the matching
/// [`LinkEvent`] reports the true outcome. A synchronous `Err` means the
/// request never left the stack and no event will follow.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn connect(&self) -> Result<(), PlatformError>;

    async fn disconnect(&self) -> Result<(), PlatformError>;

    /// Whether the native link still holds a connection. Polled during
    /// teardown because releasing native resources is itself asynchronous.
    fn is_connected(&self) -> bool;

    /// Discovers and returns the remote service table. Valid once connected.
    async fn discover_services(&self) -> Result<Vec<GattService>, PlatformError>;

    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), PlatformError>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError>;

    async fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError>;

    /// Toggles local routing of notify/indicate traffic for a characteristic.
    async fn set_characteristic_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), PlatformError>;

    async fn request_mtu(&self, mtu: u16) -> Result<(), PlatformError>;

    async fn read_rssi(&self) -> Result<(), PlatformError>;

    async fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<(), PlatformError>;
}
