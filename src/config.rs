//! Engine configuration.
//! All timing values are in milliseconds; defaults follow the values the
//! engine was field-tested with.

use serde::{Deserialize, Serialize};

use crate::queue::QueueMode;

/// Default ATT MTU before any negotiation.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Largest MTU the engine will request.
pub const MAX_ATT_MTU: u16 = 517;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently pooled connections. The least recently
    /// used session is disconnected when a connect would exceed this.
    pub max_connections: usize,

    /// Duration of a single scan attempt.
    pub scan_timeout_ms: u64,
    /// Extra scan attempts after the first one.
    pub scan_retry_count: u32,
    /// Pause between scan attempts.
    pub scan_retry_interval_ms: u64,

    /// Deadline for one connect attempt, platform callback included.
    pub connect_timeout_ms: u64,
    /// Extra connect attempts after the first one.
    pub connect_retry_count: u32,
    /// Pause between connect attempts.
    pub connect_retry_interval_ms: u64,

    /// Deadline for a single queued characteristic operation.
    pub operation_timeout_ms: u64,
    /// Pacing delay between consecutive operations on one lane. Write-heavy
    /// peripherals drop frames without it.
    pub operation_interval_ms: u64,

    /// MTU requested right after connect when `auto_set_mtu` is on.
    pub default_mtu: u16,
    /// Request `default_mtu` automatically once a connection is established.
    pub auto_set_mtu: bool,

    /// Lane assignment policy. Fixed at session creation; tear all sessions
    /// down before changing it.
    pub queue_mode: QueueMode,

    /// Gates the chatty per-operation debug logging.
    pub log_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 7,
            scan_timeout_ms: 10_000,
            scan_retry_count: 0,
            scan_retry_interval_ms: 1_000,
            connect_timeout_ms: 10_000,
            connect_retry_count: 0,
            connect_retry_interval_ms: 1_000,
            operation_timeout_ms: 10_000,
            operation_interval_ms: 100,
            default_mtu: DEFAULT_ATT_MTU,
            auto_set_mtu: false,
            queue_mode: QueueMode::Default,
            log_enabled: true,
        }
    }
}
