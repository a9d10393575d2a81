//! Lane assignment policy.
//! Maps (operation kind, characteristic) to the serial lane it must run on.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::lane::Lane;

/// Process-wide lane assignment policy, read at session construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueMode {
    /// One shared lane per device for notify/indicate/read/write/mtu, plus
    /// a separate lane for RSSI. The asymmetry is deliberate: it matches
    /// observed peripheral behavior, keep it.
    #[default]
    Default,
    /// One lane per operation kind per device. RSSI and MTU keep their own
    /// lanes.
    PerOperation,
    /// One lane per (operation kind, characteristic) per device. RSSI and
    /// MTU have no characteristic and keep their own lanes.
    PerCharacteristic,
}

/// Kind of queued GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OpKind {
    Notify,
    Indicate,
    Read,
    Write,
    Mtu,
    Rssi,
}

impl OpKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            OpKind::Notify => "notify",
            OpKind::Indicate => "indicate",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Mtu => "mtu",
            OpKind::Rssi => "rssi",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LaneKey {
    Shared,
    Rssi,
    Op(OpKind),
    OpChar(OpKind, Uuid),
}

/// Per-session lane cache. Lanes are created lazily on first assignment
/// and live until [`LaneSet::clear_all`].
pub(crate) struct LaneSet {
    address: String,
    mode: QueueMode,
    lanes: Mutex<HashMap<LaneKey, Arc<Lane>>>,
}

impl LaneSet {
    pub(crate) fn new(address: String, mode: QueueMode) -> Self {
        Self {
            address,
            mode,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the lane the given operation must enqueue onto.
    pub(crate) fn assign(&self, kind: OpKind, characteristic: Option<Uuid>) -> Arc<Lane> {
        let key = self.key_for(kind, characteristic);
        let mut lanes = self.lanes.lock().unwrap();
        lanes
            .entry(key)
            .or_insert_with(|| Arc::new(Lane::new(self.label_for(key))))
            .clone()
    }

    fn key_for(&self, kind: OpKind, characteristic: Option<Uuid>) -> LaneKey {
        match kind {
            // RSSI always runs on its own lane, in every mode.
            OpKind::Rssi => LaneKey::Rssi,
            OpKind::Mtu => match self.mode {
                QueueMode::Default => LaneKey::Shared,
                QueueMode::PerOperation | QueueMode::PerCharacteristic => LaneKey::Op(OpKind::Mtu),
            },
            _ => match self.mode {
                QueueMode::Default => LaneKey::Shared,
                QueueMode::PerOperation => LaneKey::Op(kind),
                QueueMode::PerCharacteristic => match characteristic {
                    Some(uuid) => LaneKey::OpChar(kind, uuid),
                    None => LaneKey::Op(kind),
                },
            },
        }
    }

    fn label_for(&self, key: LaneKey) -> String {
        match key {
            LaneKey::Shared => format!("{}/shared", self.address),
            LaneKey::Rssi => format!("{}/rssi", self.address),
            LaneKey::Op(kind) => format!("{}/{}", self.address, kind.name()),
            LaneKey::OpChar(kind, uuid) => format!("{}/{}/{}", self.address, kind.name(), uuid),
        }
    }

    /// Cancels every lane and drops the cache. Lanes are recreated lazily
    /// by the next assignment.
    pub(crate) fn clear_all(&self) {
        let drained: Vec<Arc<Lane>> = {
            let mut lanes = self.lanes.lock().unwrap();
            lanes.drain().map(|(_, lane)| lane).collect()
        };
        for lane in drained {
            lane.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn set(mode: QueueMode) -> LaneSet {
        LaneSet::new("AA:BB:CC:DD:EE:FF".into(), mode)
    }

    #[tokio::test]
    async fn default_mode_shares_one_lane_except_rssi() {
        let lanes = set(QueueMode::Default);
        let read = lanes.assign(OpKind::Read, Some(uuid(1)));
        let write = lanes.assign(OpKind::Write, Some(uuid(2)));
        let notify = lanes.assign(OpKind::Notify, Some(uuid(3)));
        let mtu = lanes.assign(OpKind::Mtu, None);
        let rssi = lanes.assign(OpKind::Rssi, None);

        assert!(Arc::ptr_eq(&read, &write));
        assert!(Arc::ptr_eq(&read, &notify));
        assert!(Arc::ptr_eq(&read, &mtu));
        assert!(!Arc::ptr_eq(&read, &rssi));
    }

    #[tokio::test]
    async fn per_operation_mode_splits_by_kind() {
        let lanes = set(QueueMode::PerOperation);
        let read_a = lanes.assign(OpKind::Read, Some(uuid(1)));
        let read_b = lanes.assign(OpKind::Read, Some(uuid(2)));
        let write = lanes.assign(OpKind::Write, Some(uuid(1)));
        let mtu = lanes.assign(OpKind::Mtu, None);
        let rssi = lanes.assign(OpKind::Rssi, None);

        assert!(Arc::ptr_eq(&read_a, &read_b));
        assert!(!Arc::ptr_eq(&read_a, &write));
        assert!(!Arc::ptr_eq(&mtu, &rssi));
        assert!(!Arc::ptr_eq(&read_a, &mtu));
    }

    #[tokio::test]
    async fn per_characteristic_mode_splits_by_kind_and_uuid() {
        let lanes = set(QueueMode::PerCharacteristic);
        let read_a = lanes.assign(OpKind::Read, Some(uuid(1)));
        let read_a_again = lanes.assign(OpKind::Read, Some(uuid(1)));
        let read_b = lanes.assign(OpKind::Read, Some(uuid(2)));
        let write_a = lanes.assign(OpKind::Write, Some(uuid(1)));

        assert!(Arc::ptr_eq(&read_a, &read_a_again));
        assert!(!Arc::ptr_eq(&read_a, &read_b));
        assert!(!Arc::ptr_eq(&read_a, &write_a));
    }

    #[tokio::test]
    async fn rssi_lane_is_distinct_in_every_mode() {
        for mode in [
            QueueMode::Default,
            QueueMode::PerOperation,
            QueueMode::PerCharacteristic,
        ] {
            let lanes = set(mode);
            let rssi = lanes.assign(OpKind::Rssi, None);
            let read = lanes.assign(OpKind::Read, Some(uuid(1)));
            assert!(!Arc::ptr_eq(&rssi, &read), "mode {mode:?}");
        }
    }
}
