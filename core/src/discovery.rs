/// Discovery message pipeline
///
/// Turns the identity payload read from a peer's discovery characteristic into
/// structured discovery events. Decoding is pluggable; the pipeline keeps a
/// registry of known devices so repeated reads of an unchanged peer stay
/// silent. A payload that fails to decode affects only the peer it came from.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ble::channel::ByteStreamChannel;
use crate::ble::gatt::MAX_CHARACTERISTIC_SIZE;
use crate::ble::radio::{PeerHandle, RadioState};
use crate::LinkError;

/// Wire protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 0;

/// Length prefix of an encoded announcement
const LENGTH_PREFIX: usize = 4;

/// Payload decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Empty payload")]
    Empty,
    #[error("Payload too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },
    #[error("Truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Payload decode failed: {0}")]
    Decode(String),
    #[error("Payload carries no device identity")]
    MissingIdentity,
}

/// BLE reachability of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BleDetails {
    /// Radio handle the identity was read from
    pub peer: Option<PeerHandle>,
    /// Channel identifier of the device's byte-stream channel
    pub psm: Option<u16>,
}

/// Identity a device announces about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub protocol_version: Option<u32>,
    pub ble: Option<BleDetails>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            protocol_version: Some(PROTOCOL_VERSION),
            ble: None,
        }
    }
}

/// Message carried by the discovery characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    Announce(DeviceInfo),
    Offline { device_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionCompatibility {
    Compatible,
    /// Remote speaks an older protocol (or did not say)
    OutdatedVersion,
    /// Remote speaks a newer protocol than this build understands
    IncompatibleNewVersion,
}

pub fn is_compatible(device: &DeviceInfo) -> VersionCompatibility {
    match device.protocol_version {
        None => VersionCompatibility::OutdatedVersion,
        Some(v) if v < PROTOCOL_VERSION => VersionCompatibility::OutdatedVersion,
        Some(v) if v > PROTOCOL_VERSION => VersionCompatibility::IncompatibleNewVersion,
        Some(_) => VersionCompatibility::Compatible,
    }
}

/// A device known to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub info: DeviceInfo,
    pub handle: PeerHandle,
    pub compatibility: VersionCompatibility,
}

/// Decodes a raw identity payload
pub trait PayloadDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<DiscoveryMessage, PayloadError>;
}

/// Length-prefixed bincode encoding of [`DiscoveryMessage`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnouncementCodec;

impl AnnouncementCodec {
    pub fn encode(&self, message: &DiscoveryMessage) -> Result<Vec<u8>, PayloadError> {
        let body = bincode::serialize(message).map_err(|e| PayloadError::Decode(e.to_string()))?;
        let total = LENGTH_PREFIX + body.len();
        if total > MAX_CHARACTERISTIC_SIZE {
            return Err(PayloadError::TooLarge {
                len: total,
                max: MAX_CHARACTERISTIC_SIZE,
            });
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

impl PayloadDecoder for AnnouncementCodec {
    fn decode(&self, bytes: &[u8]) -> Result<DiscoveryMessage, PayloadError> {
        if bytes.is_empty() {
            return Err(PayloadError::Empty);
        }
        if bytes.len() > MAX_CHARACTERISTIC_SIZE {
            return Err(PayloadError::TooLarge {
                len: bytes.len(),
                max: MAX_CHARACTERISTIC_SIZE,
            });
        }
        if bytes.len() < LENGTH_PREFIX {
            return Err(PayloadError::Truncated {
                expected: LENGTH_PREFIX,
                actual: bytes.len(),
            });
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&bytes[..LENGTH_PREFIX]);
        let declared = u32::from_le_bytes(prefix) as usize;
        let body = &bytes[LENGTH_PREFIX..];
        if body.len() < declared {
            return Err(PayloadError::Truncated {
                expected: declared,
                actual: body.len(),
            });
        }

        let message: DiscoveryMessage = bincode::deserialize(&body[..declared])
            .map_err(|e| PayloadError::Decode(e.to_string()))?;
        match &message {
            DiscoveryMessage::Announce(info) if info.id.is_empty() => {
                Err(PayloadError::MissingIdentity)
            }
            DiscoveryMessage::Offline { device_id } if device_id.is_empty() => {
                Err(PayloadError::MissingIdentity)
            }
            _ => Ok(message),
        }
    }
}

/// Plain-text identity payloads of the form `ID:<id>`
#[derive(Debug, Clone)]
pub struct TaggedIdDecoder {
    prefix: String,
}

impl TaggedIdDecoder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for TaggedIdDecoder {
    fn default() -> Self {
        Self::new("ID:")
    }
}

impl PayloadDecoder for TaggedIdDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<DiscoveryMessage, PayloadError> {
        if bytes.is_empty() {
            return Err(PayloadError::Empty);
        }
        let text = std::str::from_utf8(bytes).map_err(|e| PayloadError::Decode(e.to_string()))?;
        let id = text
            .trim()
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| PayloadError::Decode(format!("missing {:?} prefix", self.prefix)))?
            .trim();
        if id.is_empty() {
            return Err(PayloadError::MissingIdentity);
        }

        Ok(DiscoveryMessage::Announce(DeviceInfo {
            id: id.to_string(),
            name: id.to_string(),
            protocol_version: None,
            ble: None,
        }))
    }
}

/// Receives discovery results
pub trait DiscoveryDelegate: Send + Sync {
    fn on_peer_discovered(&self, device: DiscoveredDevice);

    fn on_peer_removed(&self, _device_id: &str) {}

    fn on_radio_state_changed(&self, _state: RadioState) {}

    /// The scan session ended on its own and needs an explicit restart
    fn on_session_failed(&self, _error: &LinkError) {}
}

/// Receives byte-stream channels opened by remote peers
pub trait IncomingConnectionHandler: Send + Sync {
    fn on_stream(&self, channel: ByteStreamChannel);
}

/// Supplies the identity payload served from the discovery characteristic
#[async_trait]
pub trait AdvertisementDataProvider: Send + Sync {
    /// Current payload; may suspend while it is assembled
    async fn current_payload(&self) -> Vec<u8>;

    /// The byte-stream channel was published under `psm`
    fn on_channel_published(&self, _psm: u16) {}

    /// Advertising started (`true`) or stopped (`false`)
    fn on_advertising_changed(&self, _active: bool) {}
}

/// What a processed payload did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Added(DiscoveredDevice),
    Updated(DiscoveredDevice),
    Unchanged,
    Removed(String),
    /// `Offline` for a device that was never seen
    NotFound,
}

/// Decodes payloads and maintains the discovered-device registry
pub struct DiscoveryPipeline {
    decoder: Box<dyn PayloadDecoder>,
    delegate: Arc<dyn DiscoveryDelegate>,
    devices: RwLock<HashMap<String, DiscoveredDevice>>,
}

impl DiscoveryPipeline {
    pub fn new(decoder: Box<dyn PayloadDecoder>, delegate: Arc<dyn DiscoveryDelegate>) -> Self {
        Self {
            decoder,
            delegate,
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Pipeline with the bincode announcement decoder
    pub fn with_announcements(delegate: Arc<dyn DiscoveryDelegate>) -> Self {
        Self::new(Box::new(AnnouncementCodec), delegate)
    }

    pub fn delegate(&self) -> &Arc<dyn DiscoveryDelegate> {
        &self.delegate
    }

    /// Handle a payload read from `handle`
    pub fn process(&self, handle: &PeerHandle, bytes: &[u8]) -> Result<RegistryChange, PayloadError> {
        let message = self.decoder.decode(bytes).map_err(|e| {
            warn!("[{}] Malformed discovery payload: {}", handle, e);
            e
        })?;

        let change = match message {
            DiscoveryMessage::Announce(mut info) => {
                let ble = info.ble.get_or_insert_with(BleDetails::default);
                ble.peer = Some(handle.clone());

                let device = DiscoveredDevice {
                    compatibility: is_compatible(&info),
                    info,
                    handle: handle.clone(),
                };

                let mut devices = self.devices.write();
                match devices.insert(device.info.id.clone(), device.clone()) {
                    None => {
                        info!("Device {} ({}) discovered via {}", device.info.name, device.info.id, handle);
                        RegistryChange::Added(device)
                    }
                    Some(previous) if previous != device => {
                        info!("Device {} already known, updating", device.info.name);
                        RegistryChange::Updated(device)
                    }
                    Some(_) => RegistryChange::Unchanged,
                }
            }
            DiscoveryMessage::Offline { device_id } => {
                if self.devices.write().remove(&device_id).is_some() {
                    info!("Device {} went offline", device_id);
                    RegistryChange::Removed(device_id)
                } else {
                    debug!("Offline notice for unknown device {}", device_id);
                    RegistryChange::NotFound
                }
            }
        };

        match &change {
            RegistryChange::Added(device) | RegistryChange::Updated(device) => {
                self.delegate.on_peer_discovered(device.clone());
            }
            RegistryChange::Removed(device_id) => self.delegate.on_peer_removed(device_id),
            RegistryChange::Unchanged | RegistryChange::NotFound => {}
        }

        Ok(change)
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.devices.read().values().cloned().collect()
    }

    pub fn device(&self, id: &str) -> Option<DiscoveredDevice> {
        self.devices.read().get(id).cloned()
    }

    pub fn clear(&self) {
        self.devices.write().clear();
    }
}

/// Serves the local device's announcement while advertising
pub struct DeviceAnnouncementProvider {
    device: RwLock<DeviceInfo>,
    advertising: AtomicBool,
    codec: AnnouncementCodec,
}

impl DeviceAnnouncementProvider {
    pub fn new(device: DeviceInfo) -> Self {
        Self {
            device: RwLock::new(device),
            advertising: AtomicBool::new(false),
            codec: AnnouncementCodec,
        }
    }

    pub fn device(&self) -> DeviceInfo {
        self.device.read().clone()
    }

    /// Replace the announced identity, keeping the published channel
    pub fn update_device(&self, mut device: DeviceInfo) {
        let mut current = self.device.write();
        if device.ble.is_none() {
            device.ble = current.ble.clone();
        }
        *current = device;
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    /// Encoded announcement regardless of advertising state
    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut device = self.device.read().clone();
        device.protocol_version = Some(PROTOCOL_VERSION);
        self.codec.encode(&DiscoveryMessage::Announce(device))
    }
}

#[async_trait]
impl AdvertisementDataProvider for DeviceAnnouncementProvider {
    async fn current_payload(&self) -> Vec<u8> {
        if !self.is_advertising() {
            return Vec::new();
        }
        match self.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot encode local announcement: {}", e);
                Vec::new()
            }
        }
    }

    fn on_channel_published(&self, psm: u16) {
        let mut device = self.device.write();
        device.ble.get_or_insert_with(BleDetails::default).psm = Some(psm);
        debug!("Announcing channel PSM {:#06x}", psm);
    }

    fn on_advertising_changed(&self, active: bool) {
        self.advertising.store(active, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        discovered: Mutex<Vec<DiscoveredDevice>>,
        removed: Mutex<Vec<String>>,
    }

    impl DiscoveryDelegate for Recorder {
        fn on_peer_discovered(&self, device: DiscoveredDevice) {
            self.discovered.lock().push(device);
        }

        fn on_peer_removed(&self, device_id: &str) {
            self.removed.lock().push(device_id.to_string());
        }
    }

    fn handle(n: u8) -> PeerHandle {
        PeerHandle::Address([0xAA, 0, 0, 0, 0, n])
    }

    fn announcement(id: &str, name: &str) -> Vec<u8> {
        AnnouncementCodec
            .encode(&DiscoveryMessage::Announce(DeviceInfo::new(id, name)))
            .unwrap()
    }

    #[test]
    fn test_version_compatibility() {
        let mut info = DeviceInfo::new("a", "A");
        assert_eq!(is_compatible(&info), VersionCompatibility::Compatible);

        info.protocol_version = None;
        assert_eq!(is_compatible(&info), VersionCompatibility::OutdatedVersion);

        info.protocol_version = Some(PROTOCOL_VERSION + 1);
        assert_eq!(is_compatible(&info), VersionCompatibility::IncompatibleNewVersion);
    }

    #[test]
    fn test_codec_round_trip_preserves_offline() {
        let message = DiscoveryMessage::Offline {
            device_id: "dev-1".to_string(),
        };
        let bytes = AnnouncementCodec.encode(&message).unwrap();
        assert_eq!(AnnouncementCodec.decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_codec_rejects_truncated_and_empty() {
        let bytes = announcement("dev-1", "Desk");
        assert!(matches!(
            AnnouncementCodec.decode(&bytes[..bytes.len() - 1]),
            Err(PayloadError::Truncated { .. })
        ));
        assert!(matches!(
            AnnouncementCodec.decode(&[1, 0]),
            Err(PayloadError::Truncated { .. })
        ));
        assert_eq!(AnnouncementCodec.decode(&[]), Err(PayloadError::Empty));
    }

    #[test]
    fn test_codec_rejects_oversized_announcement() {
        let info = DeviceInfo::new("dev-1", "x".repeat(MAX_CHARACTERISTIC_SIZE));
        let result = AnnouncementCodec.encode(&DiscoveryMessage::Announce(info));
        assert!(matches!(result, Err(PayloadError::TooLarge { .. })));
    }

    #[test]
    fn test_tagged_id_decoder() {
        let decoder = TaggedIdDecoder::default();
        match decoder.decode(b"ID:42").unwrap() {
            DiscoveryMessage::Announce(info) => assert_eq!(info.id, "42"),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(decoder.decode(b"ID:"), Err(PayloadError::MissingIdentity));
        assert!(matches!(decoder.decode(b"42"), Err(PayloadError::Decode(_))));
        assert!(matches!(decoder.decode(&[0xFF, 0xFE]), Err(PayloadError::Decode(_))));
    }

    #[test]
    fn test_registry_add_repeat_update() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = DiscoveryPipeline::with_announcements(recorder.clone());

        let change = pipeline.process(&handle(1), &announcement("dev-1", "Desk")).unwrap();
        assert!(matches!(change, RegistryChange::Added(_)));

        let change = pipeline.process(&handle(1), &announcement("dev-1", "Desk")).unwrap();
        assert_eq!(change, RegistryChange::Unchanged);

        let change = pipeline.process(&handle(1), &announcement("dev-1", "Laptop")).unwrap();
        assert!(matches!(change, RegistryChange::Updated(_)));

        let discovered = recorder.discovered.lock();
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[1].info.name, "Laptop");
        assert_eq!(
            discovered[0].info.ble.as_ref().and_then(|b| b.peer.clone()),
            Some(handle(1))
        );
    }

    #[test]
    fn test_offline_removes_device() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = DiscoveryPipeline::with_announcements(recorder.clone());
        pipeline.process(&handle(1), &announcement("dev-1", "Desk")).unwrap();

        let offline = AnnouncementCodec
            .encode(&DiscoveryMessage::Offline {
                device_id: "dev-1".to_string(),
            })
            .unwrap();
        let change = pipeline.process(&handle(1), &offline).unwrap();
        assert_eq!(change, RegistryChange::Removed("dev-1".to_string()));
        assert!(pipeline.devices().is_empty());
        assert_eq!(*recorder.removed.lock(), vec!["dev-1".to_string()]);

        assert_eq!(pipeline.process(&handle(1), &offline).unwrap(), RegistryChange::NotFound);
    }

    #[test]
    fn test_malformed_payload_leaves_registry_untouched() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = DiscoveryPipeline::with_announcements(recorder.clone());
        pipeline.process(&handle(1), &announcement("dev-1", "Desk")).unwrap();

        assert!(pipeline.process(&handle(2), &[9, 9, 9, 9, 9]).is_err());
        assert_eq!(pipeline.devices().len(), 1);
        assert_eq!(recorder.discovered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_serves_only_while_advertising() {
        let provider = DeviceAnnouncementProvider::new(DeviceInfo::new("me", "Phone"));
        assert!(provider.current_payload().await.is_empty());

        provider.on_advertising_changed(true);
        provider.on_channel_published(0x0081);
        let payload = provider.current_payload().await;

        match AnnouncementCodec.decode(&payload).unwrap() {
            DiscoveryMessage::Announce(info) => {
                assert_eq!(info.id, "me");
                assert_eq!(info.ble.and_then(|b| b.psm), Some(0x0081));
            }
            other => panic!("unexpected message {:?}", other),
        }

        provider.on_advertising_changed(false);
        assert!(provider.current_payload().await.is_empty());
    }

    #[test]
    fn test_update_device_keeps_channel() {
        let provider = DeviceAnnouncementProvider::new(DeviceInfo::new("me", "Phone"));
        provider.on_channel_published(0x0085);
        provider.update_device(DeviceInfo::new("me", "Renamed"));

        let device = provider.device();
        assert_eq!(device.name, "Renamed");
        assert_eq!(device.ble.and_then(|b| b.psm), Some(0x0085));
    }
}
