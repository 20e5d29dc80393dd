// Byte-stream channel tests: broker correlation, blocking reads and writes
// over loopback streams, close semantics and the facade's connect path.

mod common;

use common::{peer, SimRadio};
use nearlink_core::ble::{loopback_pair, ByteStreamChannel, ChannelBroker, ChannelError};
use nearlink_core::discovery::{DeviceAnnouncementProvider, DiscoveryPipeline};
use nearlink_core::{
    AdvertisementDataProvider, ChannelConfig, DeviceInfo, DiscoveredDevice, DiscoveryDelegate,
    IncomingConnectionHandler, LinkConfig, LinkError, NearLink,
};
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

const PSM: u16 = 0x0091;
const POLL: Duration = Duration::from_millis(10);

struct Quiet;

impl DiscoveryDelegate for Quiet {
    fn on_peer_discovered(&self, _device: DiscoveredDevice) {}
}

struct Discard;

impl IncomingConnectionHandler for Discard {
    fn on_stream(&self, channel: ByteStreamChannel) {
        channel.close();
    }
}

#[tokio::test]
async fn test_open_and_exchange_over_loopback() {
    let radio = SimRadio::new();
    let broker = Arc::new(ChannelBroker::new(radio.clone(), ChannelConfig::default()));

    let opener = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.open(&peer(1), PSM).await })
    };
    while radio.channel_requests().is_empty() {
        tokio::task::yield_now().await;
    }
    let request = radio.channel_requests()[0];
    let (local, remote) = loopback_pair(32);
    assert!(broker.fulfil(request, Box::new(local)));

    let channel = opener.await.unwrap().unwrap();
    assert_eq!(channel.peer(), Some(&peer(1)));
    assert_eq!(broker.pending_count(), 0);

    // Larger than the pipe, so the writer has to wait for the reader
    let payload: Vec<u8> = (0..=255u8).cycle().take(4_096).collect();
    let expected = payload.clone();
    let remote = ByteStreamChannel::new(None, Box::new(remote), POLL);

    let writer = tokio::task::spawn_blocking(move || {
        let written = channel.write(&payload).unwrap();
        drop(channel);
        written
    });
    let reader = tokio::task::spawn_blocking(move || {
        let mut received = Vec::new();
        loop {
            let chunk = remote.read(100).unwrap();
            if chunk.is_empty() {
                break received;
            }
            received.extend(chunk);
        }
    });

    assert_eq!(writer.await.unwrap(), 4_096);
    assert_eq!(reader.await.unwrap(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_open_times_out_and_late_stream_is_closed() {
    let radio = SimRadio::new();
    let broker = ChannelBroker::new(radio.clone(), ChannelConfig::default());

    let result = broker.open(&peer(2), PSM).await;
    assert_eq!(result.unwrap_err(), ChannelError::OpenTimeout);
    assert_eq!(broker.pending_count(), 0);

    let request = radio.channel_requests()[0];
    let (local, remote) = loopback_pair(8);
    assert!(!broker.fulfil(request, Box::new(local)));

    let remote = ByteStreamChannel::new(None, Box::new(remote), POLL);
    assert_eq!(remote.read(8).unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn test_failed_request_resolves_open() {
    let radio = SimRadio::new();
    let broker = ChannelBroker::new(radio.clone(), ChannelConfig::default());
    let target = peer(3);

    let mut open = tokio_test::task::spawn(broker.open(&target, PSM));
    assert_pending!(open.poll());

    let request = radio.channel_requests()[0];
    assert!(broker.fail(request));
    assert!(open.is_woken());
    assert!(matches!(
        assert_ready!(open.poll()),
        Err(ChannelError::RequestFailed(_))
    ));
    assert!(!broker.fail(request));
}

#[tokio::test]
async fn test_dropped_open_withdraws_request() {
    let radio = SimRadio::new();
    let broker = ChannelBroker::new(radio.clone(), ChannelConfig::default());
    let target = peer(4);

    let mut opens: Vec<_> = (0..3)
        .map(|_| tokio_test::task::spawn(broker.open(&target, PSM)))
        .collect();
    for open in opens.iter_mut() {
        assert_pending!(open.poll());
    }
    assert_eq!(broker.pending_count(), 3);

    drop(opens);
    assert_eq!(broker.pending_count(), 0);

    let (local, remote) = loopback_pair(16);
    let request = radio.channel_requests()[1];
    assert!(!broker.fulfil(request, Box::new(local)));
    let remote = ByteStreamChannel::new(None, Box::new(remote), POLL);
    assert_eq!(remote.read(8).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_close_is_idempotent_and_never_blocks() {
    let (a, b) = loopback_pair(8);
    let a = ByteStreamChannel::new(None, Box::new(a), POLL);
    let b = ByteStreamChannel::new(None, Box::new(b), POLL);

    a.close();
    a.close();
    assert!(a.is_closed());
    assert_eq!(a.read(4), Err(ChannelError::ChannelClosed));
    assert_eq!(a.write(b"late"), Err(ChannelError::ChannelClosed));
    assert_eq!(a.flush(), Err(ChannelError::ChannelClosed));
    assert_eq!(b.read(4).unwrap(), Vec::<u8>::new());
}

#[test]
fn test_close_wakes_blocked_reader() {
    let (a, _b) = loopback_pair(8);
    let a = ByteStreamChannel::new(None, Box::new(a), Duration::from_secs(30));
    let closer = a.closer();

    let reader = thread::spawn(move || a.read(16));
    thread::sleep(Duration::from_millis(50));
    assert!(closer.close());

    assert_eq!(reader.join().unwrap(), Err(ChannelError::ChannelClosed));
    assert!(!closer.is_alive());
}

#[test]
fn test_std_io_adapters() {
    let (a, b) = loopback_pair(64);
    let mut a = ByteStreamChannel::new(None, Box::new(a), POLL);
    let b = ByteStreamChannel::new(None, Box::new(b), POLL);

    writeln!(a, "alpha").unwrap();
    writeln!(a, "beta").unwrap();
    a.flush().unwrap();
    drop(a);

    let lines: Vec<String> = BufReader::new(b).lines().map(|line| line.unwrap()).collect();
    assert_eq!(lines, vec!["alpha".to_string(), "beta".to_string()]);
}

#[tokio::test]
async fn test_connect_stream_to_discovered_device() {
    let radio = SimRadio::new();
    let pipeline = Arc::new(DiscoveryPipeline::with_announcements(Arc::new(Quiet)));
    let link = NearLink::with_pipeline(
        radio.clone(),
        LinkConfig::default(),
        pipeline.clone(),
        Arc::new(DeviceAnnouncementProvider::new(DeviceInfo::new("me", "Me"))),
        Arc::new(Discard),
    )
    .unwrap();

    // What a remote device would serve from its discovery characteristic
    let remote_device = DeviceAnnouncementProvider::new(DeviceInfo::new("d-7", "Desk"));
    remote_device.on_channel_published(PSM);
    pipeline.process(&peer(7), &remote_device.encode().unwrap()).unwrap();

    let (local, remote) = loopback_pair(64);
    let (channel, ()) = tokio::join!(link.connect_stream("d-7"), async {
        let request = loop {
            if let Some(request) = radio.channel_requests().first().copied() {
                break request;
            }
            tokio::task::yield_now().await;
        };
        assert!(link.broker().fulfil(request, Box::new(local)));
    });

    let channel = channel.unwrap();
    assert_eq!(channel.peer(), Some(&peer(7)));
    let remote = ByteStreamChannel::new(None, Box::new(remote), POLL);
    channel.write(b"ping").unwrap();
    assert_eq!(remote.read(16).unwrap(), b"ping".to_vec());
}

#[tokio::test]
async fn test_connect_stream_requires_known_device_with_channel() {
    let radio = SimRadio::new();
    let pipeline = Arc::new(DiscoveryPipeline::with_announcements(Arc::new(Quiet)));
    let link = NearLink::with_pipeline(
        radio.clone(),
        LinkConfig::default(),
        pipeline.clone(),
        Arc::new(DeviceAnnouncementProvider::new(DeviceInfo::new("me", "Me"))),
        Arc::new(Discard),
    )
    .unwrap();

    assert_eq!(
        link.connect_stream("nobody").await.unwrap_err(),
        LinkError::UnknownDevice("nobody".to_string())
    );

    let silent = DeviceAnnouncementProvider::new(DeviceInfo::new("d-8", "Lamp"));
    pipeline.process(&peer(8), &silent.encode().unwrap()).unwrap();
    assert_eq!(
        link.connect_stream("d-8").await.unwrap_err(),
        LinkError::NoChannel("d-8".to_string())
    );
    assert!(radio.channel_requests().is_empty());
}
