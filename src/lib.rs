//! Client-side BLE GATT engine.
//!
//! GATT is a single-outstanding-request protocol layered over an
//! asynchronous radio stack that provides no queuing, timeout or fairness
//! of its own. This crate synthesizes those guarantees: a bounded LRU pool
//! of per-device connection sessions, strictly serialized operation lanes
//! per device (and, configurably, per characteristic), and a
//! timeout/retry/cancellation contract around every operation.
//!
//! The host Bluetooth stack stays behind the [`platform::Radio`] and
//! [`platform::GattLink`] traits; [`platform::mock`] ships a scriptable
//! in-memory backend for tests and development.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use bleflow::{BleEngine, ConnectCallback, EngineConfig, ScanCallback, ScanFilter};
//! use bleflow::platform::mock::MockRadio;
//!
//! # async fn demo() {
//! let radio = Arc::new(MockRadio::new());
//! let engine = BleEngine::new(radio, EngineConfig::default());
//!
//! engine.start_scan(
//!     ScanFilter::default(),
//!     ScanCallback::new().on_dedup_sighting(|device| println!("found {device}")),
//! );
//! # }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod platform;

mod engine;
mod pool;
mod queue;
mod scanner;
mod session;

pub use config::EngineConfig;
pub use device::DeviceIdentity;
pub use engine::BleEngine;
pub use error::EngineError;
pub use events::{
    ConnectCallback, DeviceEvent, MtuCallback, NotifyCallback, ReadCallback, RssiCallback,
    ScanCallback, ScanReport, WriteCallback,
};
pub use queue::QueueMode;
pub use scanner::ScanFilter;
pub use session::CccdPolicy;
