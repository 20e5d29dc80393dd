// Integration tests for the scan controller lifecycle
//
// Drives the controller through full discovery sessions against a simulated
// radio, with tokio's paused clock standing in for real time.

mod common;

use common::{peer, RadioCall, SimRadio};
use mockall::mock;
use nearlink_core::ble::{
    Admission, CloseReason, ConnectFailure, ConnectionState, RadioState, ScanController,
    ScanEvent, ScanFilter, ScanMode, DISCOVERY_CHARACTERISTIC_UUID, SERVICE_UUID,
};
use nearlink_core::discovery::{DiscoveredDevice, DiscoveryDelegate, DiscoveryPipeline, TaggedIdDecoder};
use nearlink_core::{LinkError, ScanConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

mock! {
    pub Delegate {}

    impl DiscoveryDelegate for Delegate {
        fn on_peer_discovered(&self, device: DiscoveredDevice);
        fn on_peer_removed(&self, device_id: &str);
        fn on_radio_state_changed(&self, state: RadioState);
        fn on_session_failed(&self, error: &LinkError);
    }
}

#[derive(Default)]
struct Collector {
    ids: Mutex<Vec<String>>,
}

impl DiscoveryDelegate for Collector {
    fn on_peer_discovered(&self, device: DiscoveredDevice) {
        self.ids.lock().push(device.info.id);
    }
}

fn scanner_with(
    config: ScanConfig,
    delegate: Arc<dyn DiscoveryDelegate>,
) -> (ScanController, Arc<SimRadio>) {
    let radio = SimRadio::new();
    let pipeline = Arc::new(DiscoveryPipeline::new(
        Box::new(TaggedIdDecoder::default()),
        delegate,
    ));
    let scanner = ScanController::new(radio.clone(), config, pipeline).unwrap();
    (scanner, radio)
}

fn walk_to_payload(scanner: &ScanController, handle: &nearlink_core::PeerHandle) {
    scanner.handle_event(ScanEvent::Connected {
        handle: handle.clone(),
    });
    scanner.handle_event(ScanEvent::ServicesDiscovered {
        handle: handle.clone(),
        services: vec![SERVICE_UUID],
    });
    scanner.handle_event(ScanEvent::CharacteristicsDiscovered {
        handle: handle.clone(),
        characteristics: vec![DISCOVERY_CHARACTERISTIC_UUID],
    });
}

#[tokio::test(start_paused = true)]
async fn test_quick_retry_then_identity_read() {
    let mut delegate = MockDelegate::new();
    delegate
        .expect_on_peer_discovered()
        .withf(|device| device.info.id == "42")
        .times(1)
        .return_const(());

    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(delegate));
    let p = peer(1);
    scanner.start().unwrap();

    // t = 0: first sighting is admitted
    let verdict = scanner.on_peer_sighted(&p, &[SERVICE_UUID]);
    assert_eq!(verdict, Some(Admission::Admit));
    assert_eq!(radio.connects_to(&p), 1);

    // t = 0.1: encryption timeout is transient
    tokio::time::sleep(Duration::from_millis(100)).await;
    scanner.handle_event(ScanEvent::ConnectFailed {
        handle: p.clone(),
        reason: ConnectFailure::EncryptionTimeout,
    });
    assert_eq!(scanner.peer_state(&p), Some(ConnectionState::Attempting));

    // retried at t = 0.7
    tokio::time::sleep(Duration::from_millis(599)).await;
    assert_eq!(radio.connects_to(&p), 1);
    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(radio.connects_to(&p), 2);

    walk_to_payload(&scanner, &p);
    assert!(radio
        .calls()
        .contains(&RadioCall::ReadCharacteristic(p.clone(), DISCOVERY_CHARACTERISTIC_UUID)));

    scanner.handle_event(ScanEvent::PayloadRead {
        handle: p.clone(),
        result: Ok(b"ID:42".to_vec()),
    });
    assert_eq!(scanner.peer_state(&p), Some(ConnectionState::Draining));
    assert_eq!(radio.calls().last(), Some(&RadioCall::Disconnect(p.clone())));

    scanner.handle_event(ScanEvent::Disconnected { handle: p.clone() });
    assert_eq!(
        scanner.peer_state(&p),
        Some(ConnectionState::Closed(CloseReason::Completed))
    );
    assert_eq!(scanner.active_count(), 0);
    assert!(scanner.is_scanning());
    assert_eq!(scanner.devices().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_refuses_second_peer_in_same_tick() {
    let config = ScanConfig {
        max_concurrent_connections: 1,
        ..ScanConfig::default()
    };
    let (scanner, radio) = scanner_with(config, Arc::new(Collector::default()));
    let (a, b) = (peer(0xA), peer(0xB));
    scanner.start().unwrap();

    assert_eq!(scanner.on_peer_sighted(&a, &[]), Some(Admission::Admit));
    assert_eq!(scanner.on_peer_sighted(&b, &[]), Some(Admission::SkipCeiling));

    let record = scanner.peer_record(&b).unwrap();
    assert!(record.last_connect_attempt.is_none());
    assert_eq!(record.skip_count, 0);
    assert_eq!(record.state, ConnectionState::Idle);
    assert_eq!(radio.connects_to(&b), 0);
    assert_eq!(scanner.active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_then_start_resets_session() {
    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    scanner.start().unwrap();

    // Nothing sighted: escalate to broad scanning
    tokio::time::sleep(Duration::from_millis(10_001)).await;
    assert_eq!(scanner.mode(), ScanMode::BroadFallback);
    scanner.on_peer_sighted(&peer(1), &[SERVICE_UUID]);
    assert_eq!(scanner.peer_count(), 1);

    scanner.stop();
    scanner.stop();
    scanner.start().unwrap();

    assert_eq!(scanner.peer_count(), 0);
    assert_eq!(scanner.mode(), ScanMode::Targeted);
    assert_eq!(
        radio.calls().last(),
        Some(&RadioCall::StartScan(ScanFilter::Service(SERVICE_UUID)))
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_timer_fires_after_stop() {
    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    let p = peer(2);
    scanner.start().unwrap();
    scanner.on_peer_sighted(&p, &[]);
    scanner.on_connect_failed(&p, ConnectFailure::Timeout);
    scanner.stop();

    let calls_at_stop = radio.calls().len();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(radio.calls().len(), calls_at_stop);
    assert_eq!(radio.connects_to(&p), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_override_after_threshold() {
    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    let p = peer(3);
    scanner.start().unwrap();

    scanner.on_peer_sighted(&p, &[]);
    walk_to_payload(&scanner, &p);
    scanner.on_payload_read(&p, Ok(b"ID:3".to_vec()));
    scanner.on_disconnected(&p);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(scanner.on_peer_sighted(&p, &[]), Some(Admission::SkipCooldown));
    assert_eq!(scanner.on_peer_sighted(&p, &[]), Some(Admission::SkipCooldown));
    assert_eq!(scanner.on_peer_sighted(&p, &[]), Some(Admission::Admit));

    assert_eq!(scanner.peer_record(&p).unwrap().skip_count, 0);
    assert_eq!(radio.connects_to(&p), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_expiry_admits_without_override() {
    let (scanner, _) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    let p = peer(4);
    scanner.start().unwrap();

    scanner.on_peer_sighted(&p, &[]);
    scanner.on_connect_failed(&p, ConnectFailure::Rejected);

    tokio::time::sleep(Duration::from_millis(3_001)).await;
    assert_eq!(scanner.on_peer_sighted(&p, &[]), Some(Admission::Admit));
    assert_eq!(scanner.peer_record(&p).unwrap().override_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_ceiling_holds_across_many_peers() {
    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    scanner.start().unwrap();

    for n in 0..20 {
        scanner.on_peer_sighted(&peer(n), &[]);
        assert!(scanner.active_count() <= 5);
    }
    assert_eq!(scanner.active_count(), 5);
    assert_eq!(radio.count(|c| matches!(c, RadioCall::Connect(_))), 5);

    // A finished peer frees its slot for the next sighting
    scanner.on_connect_failed(&peer(0), ConnectFailure::Rejected);
    assert_eq!(scanner.on_peer_sighted(&peer(10), &[]), Some(Admission::Admit));
    assert_eq!(scanner.active_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_scan_resumes_only_when_no_attempt_in_flight() {
    let (scanner, _) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    scanner.start().unwrap();

    scanner.on_peer_sighted(&peer(1), &[]);
    assert!(!scanner.is_scanning());
    scanner.on_connected(&peer(1));
    assert!(scanner.is_scanning());

    scanner.on_peer_sighted(&peer(2), &[]);
    scanner.on_peer_sighted(&peer(3), &[]);
    assert!(!scanner.is_scanning());

    scanner.on_connect_failed(&peer(2), ConnectFailure::Rejected);
    assert!(!scanner.is_scanning());
    scanner.on_connect_failed(&peer(3), ConnectFailure::Rejected);
    assert!(scanner.is_scanning());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_payload_is_peer_scoped() {
    let collector = Arc::new(Collector::default());
    let (scanner, _) = scanner_with(ScanConfig::default(), collector.clone());
    let (good, bad) = (peer(1), peer(2));
    scanner.start().unwrap();

    scanner.on_peer_sighted(&good, &[]);
    scanner.on_peer_sighted(&bad, &[]);
    walk_to_payload(&scanner, &bad);
    walk_to_payload(&scanner, &good);

    scanner.on_payload_read(&bad, Ok(vec![0xFF, 0x00, 0x13]));
    scanner.on_payload_read(&good, Ok(b"ID:good".to_vec()));

    assert_eq!(*collector.ids.lock(), vec!["good".to_string()]);
    assert_eq!(scanner.peer_state(&bad), Some(ConnectionState::Draining));
    assert_eq!(scanner.peer_state(&good), Some(ConnectionState::Draining));
}

#[tokio::test(start_paused = true)]
async fn test_radio_loss_reported_through_delegate() {
    let mut delegate = MockDelegate::new();
    delegate
        .expect_on_radio_state_changed()
        .withf(|state| *state == RadioState::Unauthorized)
        .times(1)
        .return_const(());
    delegate
        .expect_on_session_failed()
        .withf(|error| error.class().is_session_fatal())
        .times(1)
        .return_const(());

    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(delegate));
    scanner.start().unwrap();
    scanner.on_peer_sighted(&peer(1), &[]);

    radio.set_state(RadioState::Unauthorized);
    scanner.handle_event(ScanEvent::RadioStateChanged(RadioState::Unauthorized));

    assert!(!scanner.is_running());
    assert!(radio.calls().contains(&RadioCall::Disconnect(peer(1))));
    assert!(scanner.start().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_broad_fallback_filters_in_software() {
    let (scanner, _) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    scanner.start().unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(scanner.on_peer_sighted(&peer(1), &[]), None);
    assert_eq!(scanner.on_peer_sighted(&peer(2), &[Uuid::nil()]), None);
    assert_eq!(
        scanner.on_peer_sighted(&peer(3), &[Uuid::nil(), SERVICE_UUID]),
        Some(Admission::Admit)
    );

    // Still broad after more sightings; only stop/start resets it
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(scanner.mode(), ScanMode::BroadFallback);
}

#[tokio::test]
async fn test_radio_answering_inside_requests() {
    let (scanner, radio) = scanner_with(ScanConfig::default(), Arc::new(Collector::default()));
    let echo = scanner.clone();
    let next = AtomicU8::new(0x50);
    radio.set_hook(move |call| match call {
        // Cached advertisements reported from inside start_scan
        RadioCall::StartScan(_) => {
            let n = next.fetch_add(1, Ordering::SeqCst);
            if n < 0x53 {
                echo.on_peer_sighted(&peer(n), &[SERVICE_UUID]);
            }
        }
        RadioCall::Connect(handle) => echo.on_connect_failed(handle, ConnectFailure::Rejected),
        _ => {}
    });

    let (tx, rx) = mpsc::channel();
    let starter = scanner.clone();
    thread::spawn(move || {
        let _ = tx.send(starter.start());
    });
    let started = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("start() did not return");
    assert!(started.is_ok());

    for n in 0x50..0x53 {
        assert_eq!(
            scanner.peer_state(&peer(n)),
            Some(ConnectionState::Closed(CloseReason::ConnectFailed(
                ConnectFailure::Rejected
            )))
        );
    }
    assert_eq!(radio.count(|c| matches!(c, RadioCall::Connect(_))), 3);
    assert_eq!(scanner.active_count(), 0);
    assert!(scanner.is_scanning());
}
