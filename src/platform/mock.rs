//! Scriptable in-memory radio backend.
//! Backs the test suite and non-hardware environments: scan fixtures per
//! attempt, scripted connect failures, per-descriptor write outcomes and
//! notification injection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{
    Advertisement, CharProps, ConnectionPriority, DiscoverySession, GattCharacteristic,
    GattDescriptor, GattLink, GattService, LinkEvent, PlatformError, Radio, RadioState,
};

/// Platform status code the mock uses for scripted connect failures.
pub const MOCK_CONNECT_FAILURE_STATUS: i32 = 133;

struct PeripheralInner {
    address: String,
    name: Mutex<Option<String>>,
    rssi: Mutex<i16>,
    service_uuids: Mutex<Vec<Uuid>>,
    services: Mutex<Vec<GattService>>,
    /// 1-based scan attempts the device shows up in. `None` = every attempt.
    appearances: Mutex<Option<Vec<u32>>>,
    sightings_per_attempt: AtomicU32,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    /// Accept requests but never complete them. For timeout scripting.
    silent: AtomicBool,
    connected: AtomicBool,
    read_values: Mutex<HashMap<Uuid, Vec<u8>>>,
    write_statuses: Mutex<HashMap<Uuid, VecDeque<i32>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    descriptor_statuses: Mutex<HashMap<(Uuid, Uuid), i32>>,
    descriptor_writes: Mutex<Vec<(Uuid, Uuid, Vec<u8>)>>,
    notifications_enabled: Mutex<HashSet<Uuid>>,
    mtu_cap: AtomicU16,
    priority: Mutex<Option<ConnectionPriority>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
}

impl PeripheralInner {
    fn send_event(&self, event: LinkEvent) -> bool {
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    fn advertisement(&self) -> Advertisement {
        Advertisement {
            address: self.address.clone(),
            name: self.name.lock().unwrap().clone(),
            rssi: Some(*self.rssi.lock().unwrap()),
            payload: None,
            service_uuids: self.service_uuids.lock().unwrap().clone(),
        }
    }

    fn appears_in(&self, attempt: u32) -> bool {
        match self.appearances.lock().unwrap().as_ref() {
            Some(attempts) => attempts.contains(&attempt),
            None => true,
        }
    }
}

/// Scripting and inspection handle for one fake peripheral.
#[derive(Clone)]
pub struct MockPeripheral {
    inner: Arc<PeripheralInner>,
}

impl MockPeripheral {
    /// Fails the next `count` connect attempts with status 133 before
    /// letting one succeed.
    pub fn fail_connects(&self, count: u32) {
        self.inner.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Number of platform connect calls issued against this peripheral.
    pub fn connect_attempts(&self) -> u32 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// When silent, requests are accepted but never complete.
    pub fn set_silent(&self, silent: bool) {
        self.inner.silent.store(silent, Ordering::SeqCst);
    }

    /// Restricts which 1-based scan attempts the device shows up in.
    pub fn appear_in_attempts(&self, attempts: &[u32]) {
        *self.inner.appearances.lock().unwrap() = Some(attempts.to_vec());
    }

    pub fn set_sightings_per_attempt(&self, count: u32) {
        self.inner
            .sightings_per_attempt
            .store(count.max(1), Ordering::SeqCst);
    }

    /// Adds a characteristic (creating the service entry if needed) with
    /// the given properties and descriptor UUIDs.
    pub fn add_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        properties: CharProps,
        descriptors: &[Uuid],
    ) {
        let entry = GattCharacteristic {
            uuid: characteristic,
            service,
            properties,
            descriptors: descriptors
                .iter()
                .map(|&uuid| GattDescriptor { uuid })
                .collect(),
        };
        let mut services = self.inner.services.lock().unwrap();
        match services.iter_mut().find(|s| s.uuid == service) {
            Some(existing) => existing.characteristics.push(entry),
            None => services.push(GattService {
                uuid: service,
                characteristics: vec![entry],
            }),
        }
    }

    pub fn set_read_value(&self, characteristic: Uuid, value: Vec<u8>) {
        self.inner
            .read_values
            .lock()
            .unwrap()
            .insert(characteristic, value);
    }

    /// Scripts the status of upcoming writes to `characteristic`, consumed
    /// one per attempt; afterwards writes succeed.
    pub fn set_write_statuses(&self, characteristic: Uuid, statuses: &[i32]) {
        self.inner
            .write_statuses
            .lock()
            .unwrap()
            .insert(characteristic, statuses.iter().copied().collect());
    }

    pub fn set_descriptor_status(&self, characteristic: Uuid, descriptor: Uuid, status: i32) {
        self.inner
            .descriptor_statuses
            .lock()
            .unwrap()
            .insert((characteristic, descriptor), status);
    }

    /// Every (characteristic, value) written so far.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.inner.writes.lock().unwrap().clone()
    }

    /// Every (characteristic, descriptor, value) descriptor write so far.
    pub fn descriptor_writes(&self) -> Vec<(Uuid, Uuid, Vec<u8>)> {
        self.inner.descriptor_writes.lock().unwrap().clone()
    }

    pub fn notifications_enabled(&self, characteristic: Uuid) -> bool {
        self.inner
            .notifications_enabled
            .lock()
            .unwrap()
            .contains(&characteristic)
    }

    pub fn set_rssi(&self, rssi: i16) {
        *self.inner.rssi.lock().unwrap() = rssi;
    }

    pub fn set_mtu_cap(&self, cap: u16) {
        self.inner.mtu_cap.store(cap, Ordering::SeqCst);
    }

    pub fn priority(&self) -> Option<ConnectionPriority> {
        *self.inner.priority.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Pushes an unsolicited characteristic-change event, as a peripheral
    /// notifying would. Returns whether a link was there to deliver it.
    pub fn inject_notification(&self, characteristic: Uuid, value: Vec<u8>) -> bool {
        self.inner.send_event(LinkEvent::CharacteristicChanged {
            characteristic,
            value,
        })
    }

    /// Simulates passive link loss with the given status code.
    pub fn drop_link(&self, status: i32) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.send_event(LinkEvent::ConnectionState {
            connected: false,
            status,
        });
    }
}

struct MockRadioInner {
    state_tx: watch::Sender<RadioState>,
    peripherals: Mutex<Vec<Arc<PeripheralInner>>>,
    scan_attempts: AtomicU32,
}

/// In-memory [`Radio`] implementation.
#[derive(Clone)]
pub struct MockRadio {
    inner: Arc<MockRadioInner>,
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRadio {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(RadioState::PoweredOn);
        Self {
            inner: Arc::new(MockRadioInner {
                state_tx,
                peripherals: Mutex::new(Vec::new()),
                scan_attempts: AtomicU32::new(0),
            }),
        }
    }

    pub fn set_state(&self, state: RadioState) {
        self.inner.state_tx.send_replace(state);
    }

    /// Registers a peripheral and returns its scripting handle.
    pub fn add_peripheral(&self, address: &str, name: &str) -> MockPeripheral {
        let inner = Arc::new(PeripheralInner {
            address: address.to_string(),
            name: Mutex::new(Some(name.to_string())),
            rssi: Mutex::new(-50),
            service_uuids: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            appearances: Mutex::new(None),
            sightings_per_attempt: AtomicU32::new(1),
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            silent: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            read_values: Mutex::new(HashMap::new()),
            write_statuses: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            descriptor_statuses: Mutex::new(HashMap::new()),
            descriptor_writes: Mutex::new(Vec::new()),
            notifications_enabled: Mutex::new(HashSet::new()),
            mtu_cap: AtomicU16::new(247),
            priority: Mutex::new(None),
            events: Mutex::new(None),
        });
        self.inner.peripherals.lock().unwrap().push(inner.clone());
        MockPeripheral { inner }
    }

    /// Number of discovery passes started so far.
    pub fn scan_attempts(&self) -> u32 {
        self.inner.scan_attempts.load(Ordering::SeqCst)
    }
}

struct MockDiscovery;

impl DiscoverySession for MockDiscovery {
    fn stop(self: Box<Self>) {}
}

#[async_trait]
impl Radio for MockRadio {
    fn state(&self) -> RadioState {
        *self.inner.state_tx.borrow()
    }

    fn observe_state(&self) -> watch::Receiver<RadioState> {
        self.inner.state_tx.subscribe()
    }

    async fn start_discovery(
        &self,
        sink: mpsc::UnboundedSender<Advertisement>,
    ) -> Result<Box<dyn DiscoverySession>, PlatformError> {
        if *self.inner.state_tx.borrow() != RadioState::PoweredOn {
            return Err(PlatformError::AdapterUnavailable);
        }
        let attempt = self.inner.scan_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let peripherals = self.inner.peripherals.lock().unwrap().clone();
        for peripheral in peripherals {
            if !peripheral.appears_in(attempt) {
                continue;
            }
            let sightings = peripheral.sightings_per_attempt.load(Ordering::SeqCst);
            for _ in 0..sightings {
                let _ = sink.send(peripheral.advertisement());
            }
        }
        Ok(Box::new(MockDiscovery))
    }

    async fn open_link(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn GattLink>, PlatformError> {
        let peripheral = {
            let peripherals = self.inner.peripherals.lock().unwrap();
            peripherals
                .iter()
                .find(|p| p.address.eq_ignore_ascii_case(address))
                .cloned()
        };
        let Some(peripheral) = peripheral else {
            return Err(PlatformError::Other(format!("unknown device {address}")));
        };
        *peripheral.events.lock().unwrap() = Some(events);
        Ok(Arc::new(MockLink { peripheral }))
    }
}

struct MockLink {
    peripheral: Arc<PeripheralInner>,
}

#[async_trait]
impl GattLink for MockLink {
    async fn connect(&self) -> Result<(), PlatformError> {
        let peripheral = &self.peripheral;
        peripheral.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if peripheral.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let failures = peripheral.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            peripheral
                .connect_failures
                .store(failures - 1, Ordering::SeqCst);
            peripheral.send_event(LinkEvent::ConnectionState {
                connected: false,
                status: MOCK_CONNECT_FAILURE_STATUS,
            });
            return Ok(());
        }
        peripheral.connected.store(true, Ordering::SeqCst);
        peripheral.send_event(LinkEvent::ConnectionState {
            connected: true,
            status: 0,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), PlatformError> {
        self.peripheral.connected.store(false, Ordering::SeqCst);
        self.peripheral.send_event(LinkEvent::ConnectionState {
            connected: false,
            status: 0,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.peripheral.connected.load(Ordering::SeqCst)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, PlatformError> {
        Ok(self.peripheral.services.lock().unwrap().clone())
    }

    async fn read_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), PlatformError> {
        if self.peripheral.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let value = self
            .peripheral
            .read_values
            .lock()
            .unwrap()
            .get(&characteristic)
            .cloned()
            .unwrap_or_default();
        self.peripheral.send_event(LinkEvent::CharacteristicRead {
            characteristic,
            value,
            status: 0,
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        self.peripheral
            .writes
            .lock()
            .unwrap()
            .push((characteristic, value.to_vec()));
        if self.peripheral.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let status = self
            .peripheral
            .write_statuses
            .lock()
            .unwrap()
            .get_mut(&characteristic)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(0);
        self.peripheral.send_event(LinkEvent::CharacteristicWritten {
            characteristic,
            status,
        });
        Ok(())
    }

    async fn write_descriptor(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        self.peripheral
            .descriptor_writes
            .lock()
            .unwrap()
            .push((characteristic, descriptor, value.to_vec()));
        if self.peripheral.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let status = self
            .peripheral
            .descriptor_statuses
            .lock()
            .unwrap()
            .get(&(characteristic, descriptor))
            .copied()
            .unwrap_or(0);
        self.peripheral.send_event(LinkEvent::DescriptorWritten {
            characteristic,
            descriptor,
            status,
        });
        Ok(())
    }

    async fn set_characteristic_notification(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), PlatformError> {
        let mut enabled = self.peripheral.notifications_enabled.lock().unwrap();
        if enable {
            enabled.insert(characteristic);
        } else {
            enabled.remove(&characteristic);
        }
        Ok(())
    }

    async fn request_mtu(&self, mtu: u16) -> Result<(), PlatformError> {
        if self.peripheral.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let cap = self.peripheral.mtu_cap.load(Ordering::SeqCst);
        self.peripheral.send_event(LinkEvent::MtuChanged {
            mtu: mtu.min(cap),
            status: 0,
        });
        Ok(())
    }

    async fn read_rssi(&self) -> Result<(), PlatformError> {
        if self.peripheral.silent.load(Ordering::SeqCst) {
            return Ok(());
        }
        let rssi = *self.peripheral.rssi.lock().unwrap();
        self.peripheral
            .send_event(LinkEvent::RssiRead { rssi, status: 0 });
        Ok(())
    }

    async fn request_connection_priority(
        &self,
        priority: ConnectionPriority,
    ) -> Result<(), PlatformError> {
        *self.peripheral.priority.lock().unwrap() = Some(priority);
        Ok(())
    }
}
