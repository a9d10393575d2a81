//! Characteristic operations.
//! Every operation validates synchronously, registers its callback before
//! touching the platform, then runs as a queued task racing its timeout.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::{DEFAULT_ATT_MTU, MAX_ATT_MTU};
use crate::error::EngineError;
use crate::events::{MtuCallback, NotifyCallback, ReadCallback, RssiCallback, WriteCallback};
use crate::platform::{
    ATT_WRITE_OVERHEAD, CLIENT_CHARACTERISTIC_CONFIG, CharProps, ConnectionPriority,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE,
    GattCharacteristic, GattDescriptor, GattLink, LinkEvent,
};
use crate::queue::{OpKind, Task, TaskContext, TaskOutcome};

use super::{ConnectState, ConnectionSession, PendingKey};

/// How the client-configuration descriptor is located when enabling or
/// disabling notify/indicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CccdPolicy {
    /// Write the descriptor carrying the characteristic's own UUID.
    CharacteristicUuid,
    /// Write the standard client-characteristic-configuration descriptor.
    #[default]
    ClientConfig,
    /// Write every descriptor under the characteristic and treat any single
    /// success as overall success. Compatibility fallback for peripherals
    /// with non-conformant descriptor tables.
    AllDescriptors,
}

fn descriptors_for(
    characteristic: &GattCharacteristic,
    policy: CccdPolicy,
) -> Vec<GattDescriptor> {
    match policy {
        CccdPolicy::CharacteristicUuid => characteristic
            .descriptors
            .iter()
            .filter(|descriptor| descriptor.uuid == characteristic.uuid)
            .cloned()
            .collect(),
        CccdPolicy::ClientConfig => characteristic
            .descriptors
            .iter()
            .filter(|descriptor| descriptor.uuid == CLIENT_CHARACTERISTIC_CONFIG)
            .cloned()
            .collect(),
        CccdPolicy::AllDescriptors => characteristic.descriptors.clone(),
    }
}

impl ConnectionSession {
    fn require_link(&self) -> Result<Arc<dyn GattLink>, EngineError> {
        if !matches!(*self.inner.state.lock().unwrap(), ConnectState::Connected) {
            return Err(self.not_connected_error());
        }
        self.inner
            .link
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| self.not_connected_error())
    }

    fn find_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<GattCharacteristic, EngineError> {
        let services = self.inner.services.lock().unwrap();
        services
            .iter()
            .find(|entry| entry.uuid == service)
            .and_then(|entry| {
                entry
                    .characteristics
                    .iter()
                    .find(|chr| chr.uuid == characteristic)
            })
            .cloned()
            .ok_or(EngineError::CharacteristicNotFound {
                service,
                characteristic,
            })
    }

    fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.inner.config.operation_timeout_ms)
    }

    fn op_interval(&self) -> Duration {
        Duration::from_millis(self.inner.config.operation_interval_ms)
    }

    fn not_connected_error(&self) -> EngineError {
        EngineError::NotConnected {
            address: self.inner.identity.address().to_string(),
        }
    }

    fn standing_insert(&self, kind: OpKind, characteristic: Uuid, callback: Arc<NotifyCallback>) {
        let map = match kind {
            OpKind::Indicate => &self.inner.indicate_callbacks,
            _ => &self.inner.notify_callbacks,
        };
        map.lock().unwrap().insert(characteristic, callback);
    }

    fn standing_remove(&self, kind: OpKind, characteristic: Uuid) {
        let map = match kind {
            OpKind::Indicate => &self.inner.indicate_callbacks,
            _ => &self.inner.notify_callbacks,
        };
        map.lock().unwrap().remove(&characteristic);
    }

    /// Enables notify or indicate delivery for a characteristic. The
    /// standing callback keeps firing for every change event until
    /// explicitly disabled.
    pub(crate) fn enable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        policy: CccdPolicy,
        indicate: bool,
        callback: NotifyCallback,
    ) {
        let callback = Arc::new(callback);
        let kind = if indicate {
            OpKind::Indicate
        } else {
            OpKind::Notify
        };
        let (property, property_name) = if indicate {
            (CharProps::INDICATE, "indicate")
        } else {
            (CharProps::NOTIFY, "notify")
        };

        let prepared = self.require_link().and_then(|link| {
            let target = self.find_characteristic(service, characteristic)?;
            if !target.properties.contains(property) {
                return Err(EngineError::PropertyUnsupported {
                    characteristic,
                    property: property_name,
                });
            }
            Ok((link, target))
        });
        let (link, target) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
                return;
            }
        };

        // Register before the platform call: an immediate change event must
        // find the callback already in place.
        self.standing_insert(kind, characteristic, callback.clone());

        if self.inner.config.log_enabled {
            debug!(
                "{}: enabling {} on {characteristic}",
                self.inner.identity,
                kind.name()
            );
        }

        let key = PendingKey::characteristic(kind, characteristic);
        let enable_value = if indicate {
            ENABLE_INDICATION_VALUE
        } else {
            ENABLE_NOTIFICATION_VALUE
        };
        let session = self.clone();
        let body_callback = callback.clone();
        let body = Box::new(move |ctx: TaskContext| {
            async move {
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                session.inner.pending.register(key, ack_tx);

                if link
                    .set_characteristic_notification(target.service, target.uuid, true)
                    .await
                    .is_err()
                {
                    ctx.signal
                        .resolve(TaskOutcome::Failed(EngineError::SetNotificationFailed));
                    return;
                }

                let targets = descriptors_for(&target, policy);
                if targets.is_empty() {
                    ctx.signal
                        .resolve(TaskOutcome::Failed(EngineError::DescriptorNotFound {
                            characteristic: target.uuid,
                        }));
                    return;
                }

                let mut successes = 0usize;
                let mut last_status = 0i32;
                for descriptor in &targets {
                    if link
                        .write_descriptor(target.service, target.uuid, descriptor.uuid, &enable_value)
                        .await
                        .is_err()
                    {
                        continue;
                    }
                    match ack_rx.recv().await {
                        Some(LinkEvent::DescriptorWritten { status, .. }) => {
                            if status == 0 {
                                successes += 1;
                            } else {
                                last_status = status;
                            }
                        }
                        Some(_) => {}
                        None => {
                            ctx.signal
                                .resolve(TaskOutcome::Failed(session.not_connected_error()));
                            return;
                        }
                    }
                }

                if successes > 0 {
                    if let Some(handler) = &body_callback.on_success {
                        handler();
                    }
                    ctx.signal.resolve(TaskOutcome::Completed);
                } else {
                    ctx.signal
                        .resolve(TaskOutcome::Failed(EngineError::DescriptorWriteFailed {
                            status: last_status,
                        }));
                }
            }
            .boxed()
        });

        let session = self.clone();
        let task = Task::new(self.op_timeout(), false, body)
            .with_interval_after(self.op_interval())
            .with_completion_hook(Box::new(move |outcome| {
                session.inner.pending.deregister(key);
                match outcome {
                    TaskOutcome::Completed => {}
                    TaskOutcome::Cancelled => {
                        session.standing_remove(kind, characteristic);
                    }
                    TaskOutcome::TimedOut => {
                        session.standing_remove(kind, characteristic);
                        if let Some(handler) = &callback.on_fail {
                            handler(&EngineError::OperationTimeout);
                        }
                    }
                    TaskOutcome::Failed(err) => {
                        session.standing_remove(kind, characteristic);
                        if let Some(handler) = &callback.on_fail {
                            handler(&err);
                        }
                    }
                }
            }));
        self.inner
            .lanes
            .assign(kind, Some(characteristic))
            .enqueue(task);
    }

    /// Disables notify or indicate delivery. The standing callback is
    /// removed only if the disable write succeeds.
    pub(crate) fn disable_notifications(
        &self,
        service: Uuid,
        characteristic: Uuid,
        policy: CccdPolicy,
        indicate: bool,
    ) {
        let kind = if indicate {
            OpKind::Indicate
        } else {
            OpKind::Notify
        };
        let prepared = self
            .require_link()
            .and_then(|link| Ok((link, self.find_characteristic(service, characteristic)?)));
        let (link, target) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(
                    "{}: disable {} skipped: {err}",
                    self.inner.identity,
                    kind.name()
                );
                return;
            }
        };

        let key = PendingKey::characteristic(kind, characteristic);
        let session = self.clone();
        let body = Box::new(move |ctx: TaskContext| {
            async move {
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                session.inner.pending.register(key, ack_tx);

                if link
                    .set_characteristic_notification(target.service, target.uuid, false)
                    .await
                    .is_err()
                {
                    ctx.signal
                        .resolve(TaskOutcome::Failed(EngineError::SetNotificationFailed));
                    return;
                }

                let targets = descriptors_for(&target, policy);
                if targets.is_empty() {
                    ctx.signal
                        .resolve(TaskOutcome::Failed(EngineError::DescriptorNotFound {
                            characteristic: target.uuid,
                        }));
                    return;
                }

                let mut successes = 0usize;
                let mut last_status = 0i32;
                for descriptor in &targets {
                    if link
                        .write_descriptor(
                            target.service,
                            target.uuid,
                            descriptor.uuid,
                            &DISABLE_NOTIFICATION_VALUE,
                        )
                        .await
                        .is_err()
                    {
                        continue;
                    }
                    match ack_rx.recv().await {
                        Some(LinkEvent::DescriptorWritten { status, .. }) => {
                            if status == 0 {
                                successes += 1;
                            } else {
                                last_status = status;
                            }
                        }
                        Some(_) => {}
                        None => {
                            ctx.signal
                                .resolve(TaskOutcome::Failed(session.not_connected_error()));
                            return;
                        }
                    }
                }

                if successes > 0 {
                    session.standing_remove(kind, target.uuid);
                    ctx.signal.resolve(TaskOutcome::Completed);
                } else {
                    ctx.signal
                        .resolve(TaskOutcome::Failed(EngineError::DescriptorWriteFailed {
                            status: last_status,
                        }));
                }
            }
            .boxed()
        });

        let session = self.clone();
        let identity = self.inner.identity.clone();
        let task = Task::new(self.op_timeout(), false, body)
            .with_interval_after(self.op_interval())
            .with_interrupt_hook(Box::new(move |outcome| {
                if !matches!(outcome, TaskOutcome::Cancelled) {
                    warn!("{identity}: disable {} interrupted: {outcome:?}", kind.name());
                }
            }))
            .with_completion_hook(Box::new(move |_| {
                session.inner.pending.deregister(key);
            }));
        self.inner
            .lanes
            .assign(kind, Some(characteristic))
            .enqueue(task);
    }

    /// One-shot characteristic read.
    pub(crate) fn read(&self, service: Uuid, characteristic: Uuid, callback: ReadCallback) {
        let callback = Arc::new(callback);
        let prepared = self.require_link().and_then(|link| {
            let target = self.find_characteristic(service, characteristic)?;
            if !target.properties.contains(CharProps::READ) {
                return Err(EngineError::PropertyUnsupported {
                    characteristic,
                    property: "read",
                });
            }
            Ok((link, target))
        });
        let (link, target) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
                return;
            }
        };

        let key = PendingKey::characteristic(OpKind::Read, characteristic);
        let session = self.clone();
        let body_callback = callback.clone();
        let body = Box::new(move |ctx: TaskContext| {
            async move {
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                session.inner.pending.register(key, ack_tx);

                if let Err(err) = link.read_characteristic(target.service, target.uuid).await {
                    ctx.signal.resolve(TaskOutcome::Failed(err.into()));
                    return;
                }
                match ack_rx.recv().await {
                    Some(LinkEvent::CharacteristicRead { value, status, .. }) => {
                        if status == 0 {
                            if let Some(handler) = &body_callback.on_success {
                                handler(&value);
                            }
                            ctx.signal.resolve(TaskOutcome::Completed);
                        } else {
                            ctx.signal
                                .resolve(TaskOutcome::Failed(EngineError::Gatt { status }));
                        }
                    }
                    Some(_) => {
                        ctx.signal.resolve(TaskOutcome::Failed(EngineError::Internal(
                            "unexpected event for pending read".into(),
                        )));
                    }
                    None => {
                        ctx.signal
                            .resolve(TaskOutcome::Failed(session.not_connected_error()));
                    }
                }
            }
            .boxed()
        });

        let session = self.clone();
        let task = Task::new(self.op_timeout(), false, body)
            .with_interval_after(self.op_interval())
            .with_completion_hook(Box::new(move |outcome| {
                session.inner.pending.deregister(key);
                match outcome {
                    TaskOutcome::Completed | TaskOutcome::Cancelled => {}
                    TaskOutcome::TimedOut => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&EngineError::OperationTimeout);
                        }
                    }
                    TaskOutcome::Failed(err) => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&err);
                        }
                    }
                }
            }));
        self.inner
            .lanes
            .assign(OpKind::Read, Some(characteristic))
            .enqueue(task);
    }

    /// Single write: one buffer, no engine-side chunking. Payloads larger
    /// than the negotiated MTU allows fail fast.
    pub(crate) fn write(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
        callback: WriteCallback,
    ) {
        self.write_queued(service, characteristic, vec![value], 0, false, callback);
    }

    /// Queued write: an ordered list of buffers written in sequence. A
    /// failed buffer is retried up to `retry_count` times with the pacing
    /// interval between attempts; per-buffer success callbacks plus one
    /// final all-succeeded callback.
    pub(crate) fn write_queued(
        &self,
        service: Uuid,
        characteristic: Uuid,
        buffers: Vec<Vec<u8>>,
        retry_count: u32,
        skip_empty: bool,
        callback: WriteCallback,
    ) {
        let callback = Arc::new(callback);
        let buffers: Vec<Vec<u8>> = if skip_empty {
            buffers
                .into_iter()
                .filter(|buffer| !buffer.is_empty())
                .collect()
        } else {
            buffers
        };

        let prepared = self.require_link().and_then(|link| {
            let target = self.find_characteristic(service, characteristic)?;
            if !target.properties.contains(CharProps::WRITE)
                && !target
                    .properties
                    .contains(CharProps::WRITE_WITHOUT_RESPONSE)
            {
                return Err(EngineError::PropertyUnsupported {
                    characteristic,
                    property: "write",
                });
            }
            if buffers.is_empty() {
                return Err(EngineError::EmptyPayload);
            }
            let mtu = self.current_mtu();
            let limit = mtu.saturating_sub(ATT_WRITE_OVERHEAD) as usize;
            if let Some(oversized) = buffers.iter().find(|buffer| buffer.len() > limit) {
                return Err(EngineError::DataExceedsMtu {
                    len: oversized.len(),
                    mtu,
                });
            }
            Ok((link, target))
        });
        let (link, target) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
                return;
            }
        };

        let key = PendingKey::characteristic(OpKind::Write, characteristic);
        let per_write_timeout = self.op_timeout();
        let pacing = self.op_interval();
        let total_attempts = buffers.len() as u32 * (retry_count + 1);
        let task_timeout = per_write_timeout
            .saturating_mul(total_attempts)
            .saturating_add(pacing.saturating_mul(buffers.len() as u32));

        let session = self.clone();
        let body_callback = callback.clone();
        let body = Box::new(move |ctx: TaskContext| {
            async move {
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                session.inner.pending.register(key, ack_tx);

                let total = buffers.len();
                for (index, buffer) in buffers.iter().enumerate() {
                    let mut tries_left = retry_count;
                    loop {
                        let attempt_error = match link
                            .write_characteristic(target.service, target.uuid, buffer)
                            .await
                        {
                            Err(err) => Some(EngineError::from(err)),
                            Ok(()) => {
                                match tokio::time::timeout(per_write_timeout, ack_rx.recv()).await
                                {
                                    Ok(Some(LinkEvent::CharacteristicWritten {
                                        status, ..
                                    })) => {
                                        if status == 0 {
                                            None
                                        } else {
                                            Some(EngineError::Gatt { status })
                                        }
                                    }
                                    Ok(Some(_)) => Some(EngineError::Internal(
                                        "unexpected event for pending write".into(),
                                    )),
                                    Ok(None) => {
                                        ctx.signal.resolve(TaskOutcome::Failed(
                                            session.not_connected_error(),
                                        ));
                                        return;
                                    }
                                    Err(_) => Some(EngineError::OperationTimeout),
                                }
                            }
                        };
                        match attempt_error {
                            None => break,
                            Some(err) => {
                                if tries_left == 0 {
                                    ctx.signal.resolve(TaskOutcome::Failed(err));
                                    return;
                                }
                                tries_left -= 1;
                                warn!(
                                    "{}: write buffer {}/{total} failed ({err}), retrying",
                                    session.inner.identity,
                                    index + 1
                                );
                                sleep(pacing).await;
                            }
                        }
                    }
                    if let Some(handler) = &body_callback.on_success {
                        handler(index + 1, total, buffer);
                    }
                    if index + 1 < total && !pacing.is_zero() {
                        sleep(pacing).await;
                    }
                }
                if let Some(handler) = &body_callback.on_complete {
                    handler();
                }
                ctx.signal.resolve(TaskOutcome::Completed);
            }
            .boxed()
        });

        let session = self.clone();
        let task = Task::new(task_timeout, false, body)
            .with_interval_after(pacing)
            .with_completion_hook(Box::new(move |outcome| {
                session.inner.pending.deregister(key);
                match outcome {
                    TaskOutcome::Completed | TaskOutcome::Cancelled => {}
                    TaskOutcome::TimedOut => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&EngineError::OperationTimeout);
                        }
                    }
                    TaskOutcome::Failed(err) => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&err);
                        }
                    }
                }
            }));
        self.inner
            .lanes
            .assign(OpKind::Write, Some(characteristic))
            .enqueue(task);
    }

    /// Requests an MTU change; a success updates the cached MTU used by
    /// subsequent write-size checks.
    pub(crate) fn set_mtu(&self, mtu: u16, callback: MtuCallback) {
        let callback = Arc::new(callback);
        if !(DEFAULT_ATT_MTU..=MAX_ATT_MTU).contains(&mtu) {
            if let Some(handler) = &callback.on_fail {
                handler(&EngineError::MtuOutOfRange(mtu));
            }
            return;
        }
        let link = match self.require_link() {
            Ok(link) => link,
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
                return;
            }
        };

        let key = PendingKey::bare(OpKind::Mtu);
        let session = self.clone();
        let body_callback = callback.clone();
        let body = Box::new(move |ctx: TaskContext| {
            async move {
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                session.inner.pending.register(key, ack_tx);

                if let Err(err) = link.request_mtu(mtu).await {
                    ctx.signal.resolve(TaskOutcome::Failed(err.into()));
                    return;
                }
                match ack_rx.recv().await {
                    Some(LinkEvent::MtuChanged { mtu: granted, status }) => {
                        if status == 0 {
                            if let Some(handler) = &body_callback.on_changed {
                                handler(granted);
                            }
                            ctx.signal.resolve(TaskOutcome::Completed);
                        } else {
                            ctx.signal
                                .resolve(TaskOutcome::Failed(EngineError::Gatt { status }));
                        }
                    }
                    Some(_) => {
                        ctx.signal.resolve(TaskOutcome::Failed(EngineError::Internal(
                            "unexpected event for pending mtu request".into(),
                        )));
                    }
                    None => {
                        ctx.signal
                            .resolve(TaskOutcome::Failed(session.not_connected_error()));
                    }
                }
            }
            .boxed()
        });

        let session = self.clone();
        let task = Task::new(self.op_timeout(), false, body)
            .with_interval_after(self.op_interval())
            .with_completion_hook(Box::new(move |outcome| {
                session.inner.pending.deregister(key);
                match outcome {
                    TaskOutcome::Completed | TaskOutcome::Cancelled => {}
                    TaskOutcome::TimedOut => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&EngineError::OperationTimeout);
                        }
                    }
                    TaskOutcome::Failed(err) => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&err);
                        }
                    }
                }
            }));
        self.inner.lanes.assign(OpKind::Mtu, None).enqueue(task);
    }

    /// One-shot RSSI read. Always runs on the dedicated RSSI lane.
    pub(crate) fn read_rssi(&self, callback: RssiCallback) {
        let callback = Arc::new(callback);
        let link = match self.require_link() {
            Ok(link) => link,
            Err(err) => {
                if let Some(handler) = &callback.on_fail {
                    handler(&err);
                }
                return;
            }
        };

        let key = PendingKey::bare(OpKind::Rssi);
        let session = self.clone();
        let body_callback = callback.clone();
        let body = Box::new(move |ctx: TaskContext| {
            async move {
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                session.inner.pending.register(key, ack_tx);

                if let Err(err) = link.read_rssi().await {
                    ctx.signal.resolve(TaskOutcome::Failed(err.into()));
                    return;
                }
                match ack_rx.recv().await {
                    Some(LinkEvent::RssiRead { rssi, status }) => {
                        if status == 0 {
                            if let Some(handler) = &body_callback.on_success {
                                handler(rssi);
                            }
                            ctx.signal.resolve(TaskOutcome::Completed);
                        } else {
                            ctx.signal
                                .resolve(TaskOutcome::Failed(EngineError::Gatt { status }));
                        }
                    }
                    Some(_) => {
                        ctx.signal.resolve(TaskOutcome::Failed(EngineError::Internal(
                            "unexpected event for pending rssi read".into(),
                        )));
                    }
                    None => {
                        ctx.signal
                            .resolve(TaskOutcome::Failed(session.not_connected_error()));
                    }
                }
            }
            .boxed()
        });

        let session = self.clone();
        let task = Task::new(self.op_timeout(), false, body)
            .with_interval_after(self.op_interval())
            .with_completion_hook(Box::new(move |outcome| {
                session.inner.pending.deregister(key);
                match outcome {
                    TaskOutcome::Completed | TaskOutcome::Cancelled => {}
                    TaskOutcome::TimedOut => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&EngineError::OperationTimeout);
                        }
                    }
                    TaskOutcome::Failed(err) => {
                        if let Some(handler) = &callback.on_fail {
                            handler(&err);
                        }
                    }
                }
            }));
        self.inner.lanes.assign(OpKind::Rssi, None).enqueue(task);
    }

    /// Forwards a connection-priority request. The three-value enumeration
    /// is the validation; the platform call has no asynchronous completion.
    pub(crate) async fn set_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<(), EngineError> {
        let link = self.require_link()?;
        link.request_connection_priority(priority)
            .await
            .map_err(Into::into)
    }
}
