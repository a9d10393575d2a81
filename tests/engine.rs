//! End-to-end tests for the engine over the scriptable mock radio.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use bleflow::platform::mock::{MOCK_CONNECT_FAILURE_STATUS, MockRadio};
use bleflow::platform::{
    CLIENT_CHARACTERISTIC_CONFIG, CharProps, ConnectionPriority, DISABLE_NOTIFICATION_VALUE,
    ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, RadioState,
};
use bleflow::{
    BleEngine, CccdPolicy, ConnectCallback, DeviceIdentity, EngineConfig, EngineError,
    MtuCallback, NotifyCallback, ReadCallback, RssiCallback, ScanCallback, ScanFilter,
    WriteCallback,
};

const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
const DATA_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
const DATA_NOTIFY: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
const DATA_WRITE: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

const ADDR_A: &str = "AA:BB:CC:DD:EE:01";
const ADDR_B: &str = "AA:BB:CC:DD:EE:02";
const ADDR_C: &str = "AA:BB:CC:DD:EE:03";

const WAIT: Duration = Duration::from_secs(60);

fn engine_with(config: EngineConfig) -> (BleEngine, MockRadio) {
    let radio = MockRadio::new();
    let engine = BleEngine::new(Arc::new(radio.clone()), config);
    (engine, radio)
}

fn identity(address: &str) -> DeviceIdentity {
    DeviceIdentity::from_address(address).expect("valid test address")
}

async fn connect_ok(engine: &BleEngine, identity: &DeviceIdentity) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.connect(
        identity,
        ConnectCallback::new().on_success(move |_| {
            let _ = tx.send(());
        }),
    );
    timeout(WAIT, rx.recv())
        .await
        .expect("connect did not complete")
        .expect("success channel closed");
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_without_force() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = radio.add_peripheral(ADDR_A, "Thermo");
    let device = identity(ADDR_A);

    connect_ok(&engine, &device).await;
    assert_eq!(peripheral.connect_attempts(), 1);
    assert!(engine.is_connected(&device));

    // Second connect short-circuits: success reported, zero platform calls.
    connect_ok(&engine, &device).await;
    assert_eq!(peripheral.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_retry_exhaustion_counts_attempts() {
    let config = EngineConfig {
        connect_retry_count: 2,
        connect_retry_interval_ms: 500,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    let peripheral = radio.add_peripheral(ADDR_A, "Thermo");
    peripheral.fail_connects(10);
    let device = identity(ADDR_A);

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.connect(
        &device,
        ConnectCallback::new().on_fail(move |err| {
            let _ = tx.send(err.status_code());
        }),
    );

    let status = timeout(WAIT, rx.recv())
        .await
        .expect("terminal failure expected")
        .expect("failure channel closed");
    assert_eq!(status, Some(MOCK_CONNECT_FAILURE_STATUS));

    // retryCount = 2 means exactly 3 platform attempts and one terminal
    // failure callback.
    assert_eq!(peripheral.connect_attempts(), 3);
    sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
    assert!(!engine.is_connected(&device));
}

#[tokio::test(start_paused = true)]
async fn connect_succeeds_after_scripted_failures() {
    let config = EngineConfig {
        connect_retry_count: 3,
        connect_retry_interval_ms: 100,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    let peripheral = radio.add_peripheral(ADDR_A, "Thermo");
    peripheral.fail_connects(2);
    let device = identity(ADDR_A);

    connect_ok(&engine, &device).await;
    assert_eq!(peripheral.connect_attempts(), 3);
    assert!(peripheral.is_connected());
}

#[tokio::test(start_paused = true)]
async fn lru_pool_evicts_least_recently_used_session() {
    let config = EngineConfig {
        max_connections: 2,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    let peripheral_a = radio.add_peripheral(ADDR_A, "A");
    let _peripheral_b = radio.add_peripheral(ADDR_B, "B");
    let _peripheral_c = radio.add_peripheral(ADDR_C, "C");

    connect_ok(&engine, &identity(ADDR_A)).await;
    connect_ok(&engine, &identity(ADDR_B)).await;
    assert_eq!(engine.connected_devices().len(), 2);

    // Third connect evicts A, the least recently touched session, and
    // disconnects it before admitting C.
    connect_ok(&engine, &identity(ADDR_C)).await;

    assert!(!peripheral_a.is_connected());
    assert!(!engine.is_connected(&identity(ADDR_A)));
    let connected = engine.connected_devices();
    assert_eq!(connected.len(), 2);
    assert!(connected.contains(&identity(ADDR_B)));
    assert!(connected.contains(&identity(ADDR_C)));
}

#[tokio::test(start_paused = true)]
async fn scan_aggregates_raw_and_deduplicated_across_attempts() {
    let config = EngineConfig {
        scan_timeout_ms: 100,
        scan_retry_count: 2,
        scan_retry_interval_ms: 50,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    radio.add_peripheral(ADDR_A, "A");
    let b = radio.add_peripheral(ADDR_B, "B");
    b.appear_in_attempts(&[2]);
    let c = radio.add_peripheral(ADDR_C, "C");
    c.appear_in_attempts(&[3]);

    let (start_tx, mut start_rx) = mpsc::unbounded_channel();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    engine.start_scan(
        ScanFilter::default(),
        ScanCallback::new()
            .on_start(move || {
                let _ = start_tx.send(());
            })
            .on_complete(move |report| {
                let _ = done_tx.send(report);
            }),
    );

    let report = timeout(WAIT, done_rx.recv())
        .await
        .expect("scan did not complete")
        .expect("report channel closed");

    // A seen in all three attempts, B only in attempt 2, C only in 3.
    assert_eq!(report.raw.len(), 5);
    let unique: Vec<&str> = report
        .deduplicated
        .iter()
        .map(|device| device.address())
        .collect();
    assert_eq!(unique, vec![ADDR_A, ADDR_B, ADDR_C]);

    // Start and complete fire exactly once for the whole sequence.
    assert!(start_rx.recv().await.is_some());
    assert!(start_rx.try_recv().is_err());
    assert!(done_rx.try_recv().is_err());
    assert_eq!(radio.scan_attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn second_scan_fails_fast_while_scanning() {
    let config = EngineConfig {
        scan_timeout_ms: 10_000,
        ..Default::default()
    };
    let (engine, _radio) = engine_with(config);

    engine.start_scan(ScanFilter::default(), ScanCallback::new());
    tokio::task::yield_now().await;
    assert!(engine.is_scanning());

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.start_scan(
        ScanFilter::default(),
        ScanCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::AlreadyScanning));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));
    engine.stop_scan();
}

#[tokio::test(start_paused = true)]
async fn scan_then_connect_stops_scanning_and_connects_first_match() {
    let config = EngineConfig {
        scan_timeout_ms: 10_000,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    let peripheral = radio.add_peripheral(ADDR_A, "Thermo-1");

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.scan_then_connect(
        ScanFilter {
            names: vec!["Thermo".into()],
            fuzzy_name: true,
            ..Default::default()
        },
        ConnectCallback::new().on_success(move |device| {
            let _ = tx.send(device.address().to_string());
        }),
    );

    let address = timeout(WAIT, rx.recv())
        .await
        .expect("scan-then-connect stalled")
        .expect("channel closed");
    assert_eq!(address, ADDR_A);
    assert!(peripheral.is_connected());
    assert!(!engine.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn scan_then_connect_reports_timeout_when_nothing_matches() {
    let config = EngineConfig {
        scan_timeout_ms: 100,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    radio.add_peripheral(ADDR_A, "Other");

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.scan_then_connect(
        ScanFilter {
            names: vec!["Thermo".into()],
            ..Default::default()
        },
        ConnectCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::ScanTimeout));
        }),
    );
    assert_eq!(timeout(WAIT, rx.recv()).await.expect("fail expected"), Some(true));
}

fn data_peripheral(radio: &MockRadio) -> bleflow::platform::mock::MockPeripheral {
    let peripheral = radio.add_peripheral(ADDR_A, "Thermo");
    peripheral.add_characteristic(
        BATTERY_SERVICE,
        BATTERY_LEVEL,
        CharProps::READ,
        &[],
    );
    peripheral.add_characteristic(
        DATA_SERVICE,
        DATA_NOTIFY,
        CharProps::NOTIFY | CharProps::INDICATE,
        &[CLIENT_CHARACTERISTIC_CONFIG],
    );
    peripheral.add_characteristic(DATA_SERVICE, DATA_WRITE, CharProps::WRITE, &[]);
    peripheral
}

#[tokio::test(start_paused = true)]
async fn read_returns_the_characteristic_value() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    peripheral.set_read_value(BATTERY_LEVEL, vec![87]);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.read(
        &device,
        BATTERY_SERVICE,
        BATTERY_LEVEL,
        ReadCallback::new().on_success(move |value| {
            let _ = tx.send(value.to_vec());
        }),
    );
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("read stalled"),
        Some(vec![87])
    );
}

#[tokio::test(start_paused = true)]
async fn operations_fail_fast_before_any_platform_call() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);

    // Not connected yet.
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.read(
        &device,
        BATTERY_SERVICE,
        BATTERY_LEVEL,
        ReadCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::NotConnected { .. }));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));

    connect_ok(&engine, &device).await;

    // Notify requested on a characteristic without the NOTIFY property.
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.enable_notify(
        &device,
        BATTERY_SERVICE,
        BATTERY_LEVEL,
        CccdPolicy::ClientConfig,
        NotifyCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::PropertyUnsupported { .. }));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));

    // Unknown characteristic.
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.read(
        &device,
        BATTERY_SERVICE,
        Uuid::from_u128(0xdead),
        ReadCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::CharacteristicNotFound { .. }));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));
    assert!(peripheral.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn operation_timeout_fails_the_task_and_releases_the_lane() {
    let config = EngineConfig {
        operation_timeout_ms: 500,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    let peripheral = data_peripheral(&radio);
    peripheral.set_read_value(BATTERY_LEVEL, vec![42]);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    peripheral.set_silent(true);
    let timeout_tx = tx.clone();
    engine.read(
        &device,
        BATTERY_SERVICE,
        BATTERY_LEVEL,
        ReadCallback::new().on_fail(move |err| {
            let _ = timeout_tx.send(matches!(err, EngineError::OperationTimeout).to_string());
        }),
    );
    // Let the stuck read issue its (never-answered) platform call.
    sleep(Duration::from_millis(50)).await;

    // Queued behind the stuck read on the same lane; must run after the
    // timeout releases the execution token.
    peripheral.set_silent(false);
    engine.read(
        &device,
        BATTERY_SERVICE,
        BATTERY_LEVEL,
        ReadCallback::new().on_success(move |value| {
            let _ = tx.send(format!("value:{}", value[0]));
        }),
    );

    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("first outcome"),
        Some("true".to_string())
    );
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("second outcome"),
        Some("value:42".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn notify_enable_writes_cccd_and_delivers_data() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (ok_tx, mut ok_rx) = mpsc::unbounded_channel();
    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    engine.enable_notify(
        &device,
        DATA_SERVICE,
        DATA_NOTIFY,
        CccdPolicy::ClientConfig,
        NotifyCallback::new()
            .on_success(move || {
                let _ = ok_tx.send(());
            })
            .on_data(move |value| {
                let _ = data_tx.send(value.to_vec());
            }),
    );
    timeout(WAIT, ok_rx.recv()).await.expect("enable stalled");

    let writes = peripheral.descriptor_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].1, CLIENT_CHARACTERISTIC_CONFIG);
    assert_eq!(writes[0].2, ENABLE_NOTIFICATION_VALUE.to_vec());
    assert!(peripheral.notifications_enabled(DATA_NOTIFY));

    assert!(peripheral.inject_notification(DATA_NOTIFY, vec![1, 2, 3]));
    assert_eq!(
        timeout(WAIT, data_rx.recv()).await.expect("data stalled"),
        Some(vec![1, 2, 3])
    );
}

#[tokio::test(start_paused = true)]
async fn notify_disable_round_trip_leaves_no_residual_callback() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (ok_tx, mut ok_rx) = mpsc::unbounded_channel();
    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    engine.enable_notify(
        &device,
        DATA_SERVICE,
        DATA_NOTIFY,
        CccdPolicy::ClientConfig,
        NotifyCallback::new()
            .on_success(move || {
                let _ = ok_tx.send(());
            })
            .on_data(move |value| {
                let _ = data_tx.send(value.to_vec());
            }),
    );
    timeout(WAIT, ok_rx.recv()).await.expect("enable stalled");

    engine.disable_notify(&device, DATA_SERVICE, DATA_NOTIFY, CccdPolicy::ClientConfig);
    sleep(Duration::from_millis(500)).await;

    let writes = peripheral.descriptor_writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].2, DISABLE_NOTIFICATION_VALUE.to_vec());

    // A subsequent unsolicited change event is no longer delivered.
    peripheral.inject_notification(DATA_NOTIFY, vec![9]);
    sleep(Duration::from_millis(200)).await;
    assert!(data_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn notify_all_descriptor_fallback_counts_any_success() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = radio.add_peripheral(ADDR_A, "Quirky");
    let extra_descriptor = Uuid::from_u128(0x2903);
    peripheral.add_characteristic(
        DATA_SERVICE,
        DATA_NOTIFY,
        CharProps::NOTIFY,
        &[CLIENT_CHARACTERISTIC_CONFIG, extra_descriptor],
    );
    // One of the two descriptor writes fails.
    peripheral.set_descriptor_status(DATA_NOTIFY, CLIENT_CHARACTERISTIC_CONFIG, 5);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.enable_notify(
        &device,
        DATA_SERVICE,
        DATA_NOTIFY,
        CccdPolicy::AllDescriptors,
        NotifyCallback::new().on_success(move || {
            let _ = tx.send(());
        }),
    );
    timeout(WAIT, rx.recv()).await.expect("any-success expected");
    assert_eq!(peripheral.descriptor_writes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn notify_all_descriptor_fallback_fails_when_every_write_fails() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = radio.add_peripheral(ADDR_A, "Quirky");
    let extra_descriptor = Uuid::from_u128(0x2903);
    peripheral.add_characteristic(
        DATA_SERVICE,
        DATA_NOTIFY,
        CharProps::NOTIFY,
        &[CLIENT_CHARACTERISTIC_CONFIG, extra_descriptor],
    );
    peripheral.set_descriptor_status(DATA_NOTIFY, CLIENT_CHARACTERISTIC_CONFIG, 5);
    peripheral.set_descriptor_status(DATA_NOTIFY, extra_descriptor, 5);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
    let (data_tx, mut data_rx) = mpsc::unbounded_channel();
    engine.enable_notify(
        &device,
        DATA_SERVICE,
        DATA_NOTIFY,
        CccdPolicy::AllDescriptors,
        NotifyCallback::new()
            .on_fail(move |err| {
                let _ = fail_tx.send(err.status_code());
            })
            .on_data(move |value| {
                let _ = data_tx.send(value.to_vec());
            }),
    );
    assert_eq!(
        timeout(WAIT, fail_rx.recv()).await.expect("failure expected"),
        Some(Some(5))
    );

    // The failed enable left no standing callback behind.
    peripheral.inject_notification(DATA_NOTIFY, vec![7]);
    sleep(Duration::from_millis(200)).await;
    assert!(data_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn indicate_enable_writes_the_indication_value() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.enable_indicate(
        &device,
        DATA_SERVICE,
        DATA_NOTIFY,
        CccdPolicy::ClientConfig,
        NotifyCallback::new().on_success(move || {
            let _ = tx.send(());
        }),
    );
    timeout(WAIT, rx.recv()).await.expect("indicate stalled");

    let writes = peripheral.descriptor_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].2, ENABLE_INDICATION_VALUE.to_vec());
}

#[tokio::test(start_paused = true)]
async fn concurrent_connect_fails_fast_and_stop_connect_is_silent() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = radio.add_peripheral(ADDR_A, "Thermo");
    peripheral.set_silent(true);
    let device = identity(ADDR_A);

    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let fail_tx = first_tx.clone();
    engine.connect(
        &device,
        ConnectCallback::new()
            .on_success(move |_| {
                let _ = first_tx.send("success");
            })
            .on_fail(move |_| {
                let _ = fail_tx.send("fail");
            }),
    );
    // Let the first request reach the Connecting state.
    sleep(Duration::from_millis(50)).await;

    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    engine.connect(
        &device,
        ConnectCallback::new().on_fail(move |err| {
            let _ = second_tx.send(matches!(err, EngineError::AlreadyConnecting));
        }),
    );
    assert_eq!(
        timeout(WAIT, second_rx.recv()).await.expect("fail-fast expected"),
        Some(true)
    );

    // Cancelling the in-flight attempt surfaces no callback at all.
    engine.stop_connect(&device);
    sleep(Duration::from_millis(500)).await;
    assert!(first_rx.try_recv().is_err());
    assert!(!engine.is_connected(&device));

    // The session is reconnectable afterwards.
    peripheral.set_silent(false);
    connect_ok(&engine, &device).await;
}

#[tokio::test(start_paused = true)]
async fn write_exceeding_mtu_fails_fast() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.write(
        &device,
        DATA_SERVICE,
        DATA_WRITE,
        vec![0u8; 100],
        WriteCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::DataExceedsMtu { mtu: 23, .. }));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));
    assert!(peripheral.writes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn queued_write_retries_failed_buffers_and_reports_progress() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    // First write attempt fails, the retry succeeds.
    peripheral.set_write_statuses(DATA_WRITE, &[1]);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress_tx = tx.clone();
    engine.write_queued(
        &device,
        DATA_SERVICE,
        DATA_WRITE,
        vec![vec![1], vec![], vec![2]],
        1,
        true,
        WriteCallback::new()
            .on_success(move |index, total, _chunk| {
                let _ = progress_tx.send(format!("{index}/{total}"));
            })
            .on_complete(move || {
                let _ = tx.send("complete".into());
            }),
    );

    assert_eq!(timeout(WAIT, rx.recv()).await.expect("p1"), Some("1/2".into()));
    assert_eq!(timeout(WAIT, rx.recv()).await.expect("p2"), Some("2/2".into()));
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("done"),
        Some("complete".into())
    );
    // Zero-length buffer skipped; failed first buffer written twice.
    assert_eq!(peripheral.writes().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn mtu_success_updates_write_size_checks() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.set_mtu(
        &device,
        185,
        MtuCallback::new().on_changed(move |mtu| {
            let _ = tx.send(mtu);
        }),
    );
    assert_eq!(timeout(WAIT, rx.recv()).await.expect("mtu stalled"), Some(185));

    // The 100-byte write that previously exceeded the default MTU now fits.
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.write(
        &device,
        DATA_SERVICE,
        DATA_WRITE,
        vec![0u8; 100],
        WriteCallback::new().on_complete(move || {
            let _ = tx.send(());
        }),
    );
    timeout(WAIT, rx.recv()).await.expect("write stalled");
    assert_eq!(peripheral.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn mtu_out_of_range_is_rejected() {
    let (engine, radio) = engine_with(EngineConfig::default());
    data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.set_mtu(
        &device,
        10,
        MtuCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::MtuOutOfRange(10)));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn rssi_and_priority_round_trip() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    peripheral.set_rssi(-42);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.read_rssi(
        &device,
        RssiCallback::new().on_success(move |rssi| {
            let _ = tx.send(rssi);
        }),
    );
    assert_eq!(timeout(WAIT, rx.recv()).await.expect("rssi stalled"), Some(-42));

    engine
        .set_connection_priority(&device, ConnectionPriority::High)
        .await
        .expect("priority forwarded");
    assert_eq!(peripheral.priority(), Some(ConnectionPriority::High));
}

#[tokio::test(start_paused = true)]
async fn auto_set_mtu_requests_configured_mtu_after_connect() {
    let config = EngineConfig {
        default_mtu: 185,
        auto_set_mtu: true,
        ..Default::default()
    };
    let (engine, radio) = engine_with(config);
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;
    sleep(Duration::from_millis(500)).await;

    // The engine negotiated the configured MTU on its own: a large write
    // passes the size check without an explicit set_mtu call.
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.write(
        &device,
        DATA_SERVICE,
        DATA_WRITE,
        vec![0u8; 100],
        WriteCallback::new().on_complete(move || {
            let _ = tx.send(());
        }),
    );
    timeout(WAIT, rx.recv()).await.expect("write stalled");
    assert_eq!(peripheral.writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn passive_link_loss_fires_single_disconnected_event() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.connect(
        &device,
        ConnectCallback::new()
            .on_success({
                let tx = tx.clone();
                move |_| {
                    let _ = tx.send("connected".to_string());
                }
            })
            .on_disconnected(move |_, active, status| {
                let _ = tx.send(format!("disconnected:{active}:{status}"));
            }),
    );
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("connect"),
        Some("connected".to_string())
    );

    peripheral.drop_link(8);
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("disconnect event"),
        Some("disconnected:false:8".to_string())
    );
    sleep(Duration::from_millis(500)).await;
    assert!(rx.try_recv().is_err());
    assert!(!engine.is_connected(&device));
}

#[tokio::test(start_paused = true)]
async fn release_disconnects_and_removes_the_session() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.connect(
        &device,
        ConnectCallback::new()
            .on_success({
                let tx = tx.clone();
                move |_| {
                    let _ = tx.send("connected".to_string());
                }
            })
            .on_disconnecting({
                let tx = tx.clone();
                move |_| {
                    let _ = tx.send("disconnecting".to_string());
                }
            })
            .on_disconnected(move |_, active, _| {
                let _ = tx.send(format!("disconnected:{active}"));
            }),
    );
    assert_eq!(
        timeout(WAIT, rx.recv()).await.expect("connect"),
        Some("connected".to_string())
    );

    engine.release(&device).await;
    assert_eq!(rx.try_recv().ok(), Some("disconnecting".to_string()));
    assert_eq!(rx.try_recv().ok(), Some("disconnected:true".to_string()));
    assert!(!peripheral.is_connected());
    assert!(engine.connected_devices().is_empty());
}

#[tokio::test(start_paused = true)]
async fn release_all_tears_everything_down() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral_a = radio.add_peripheral(ADDR_A, "A");
    let peripheral_b = radio.add_peripheral(ADDR_B, "B");
    connect_ok(&engine, &identity(ADDR_A)).await;
    connect_ok(&engine, &identity(ADDR_B)).await;

    engine.release_all().await;
    assert!(!peripheral_a.is_connected());
    assert!(!peripheral_b.is_connected());
    assert!(engine.connected_devices().is_empty());
    assert!(!engine.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn radio_off_fails_fast_and_releases_sessions() {
    let (engine, radio) = engine_with(EngineConfig::default());
    let peripheral = data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    radio.set_state(RadioState::PoweredOff);
    sleep(Duration::from_millis(500)).await;
    assert!(!peripheral.is_connected());

    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.start_scan(
        ScanFilter::default(),
        ScanCallback::new().on_fail(move |err| {
            let _ = tx.send(matches!(err, EngineError::RadioOff));
        }),
    );
    assert_eq!(rx.recv().await, Some(true));
}

#[tokio::test(start_paused = true)]
async fn standing_event_channel_reports_connection_changes() {
    let (engine, radio) = engine_with(EngineConfig::default());
    data_peripheral(&radio);
    let device = identity(ADDR_A);
    connect_ok(&engine, &device).await;

    let mut events = engine.subscribe(&device).expect("session pooled");
    engine.release(&device).await;

    loop {
        match timeout(WAIT, events.recv()).await.expect("event stalled") {
            Ok(bleflow::DeviceEvent::ConnectionChanged { connected, .. }) => {
                if !connected {
                    break;
                }
            }
            Ok(_) => {}
            Err(err) => panic!("event channel closed: {err}"),
        }
    }
}
