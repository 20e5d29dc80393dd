/// Radio stack collaborator
///
/// The platform (CoreBluetooth, BlueZ, WinRT, Android) owns the actual radio.
/// Controllers in this crate only issue requests through [`RadioStack`]; every
/// completion or failure comes back later as an event on the owning
/// controller (`ScanEvent` / `AdvertiseEvent`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use super::gatt::{AdvertisementDescriptor, ServiceDescriptor};

/// Opaque identifier of a remote radio endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerHandle {
    /// A 6-byte BLE device address (Linux, Windows, Android)
    Address([u8; 6]),
    /// A platform-assigned identifier (Apple platforms)
    Uuid(Uuid),
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerHandle::Address(bytes) => write!(f, "{}", hex::encode_upper(bytes)),
            PeerHandle::Uuid(uuid) => write!(f, "{}", uuid.hyphenated()),
        }
    }
}

/// Power/authorization state reported by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_powered_on(&self) -> bool {
        *self == RadioState::PoweredOn
    }
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RadioState::Unknown => write!(f, "Unknown"),
            RadioState::Resetting => write!(f, "Resetting"),
            RadioState::Unsupported => write!(f, "Unsupported"),
            RadioState::Unauthorized => write!(f, "Unauthorized"),
            RadioState::PoweredOff => write!(f, "PoweredOff"),
            RadioState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Scan filter handed to the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanFilter {
    /// Only report advertisements carrying this service identifier
    Service(Uuid),
    /// Report everything; filtering happens in software
    Unfiltered,
}

/// Reason code attached to a failed connection attempt
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectFailure {
    /// Link encryption did not complete in time
    EncryptionTimeout,
    /// The connection attempt timed out
    Timeout,
    /// The link dropped while it was still being set up
    ConnectionDropped,
    /// The remote side or the OS refused the connection
    Rejected,
    /// The radio refused to issue the request
    RequestFailed(String),
    /// Any other platform status code
    Other(i32),
}

impl ConnectFailure {
    /// Failures worth a quick local retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectFailure::EncryptionTimeout
                | ConnectFailure::Timeout
                | ConnectFailure::ConnectionDropped
        )
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::EncryptionTimeout => write!(f, "encryption timeout"),
            ConnectFailure::Timeout => write!(f, "timeout"),
            ConnectFailure::ConnectionDropped => write!(f, "connection dropped"),
            ConnectFailure::Rejected => write!(f, "rejected"),
            ConnectFailure::RequestFailed(reason) => write!(f, "request failed: {}", reason),
            ConnectFailure::Other(code) => write!(f, "status {}", code),
        }
    }
}

/// Identifier of a pending characteristic read served by the advertiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadRequestId(pub u64);

/// Identifier correlating an outbound byte-stream request with its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRequestId(pub Uuid);

impl ChannelRequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Errors returned synchronously when the radio refuses a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("Radio not available: {0}")]
    NotAvailable(RadioState),
    #[error("Radio busy")]
    Busy,
    #[error("Operation not supported by this radio")]
    Unsupported,
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerHandle),
    #[error("Radio request failed: {0}")]
    Failed(String),
}

/// Primitives consumed from the platform radio stack
///
/// Requests must not block. Controllers never hold their own locks across a
/// request, so completions may be delivered as controller events from any
/// thread, including synchronously from inside the request.
pub trait RadioStack: Send + Sync {
    /// Current power state
    fn state(&self) -> RadioState;

    // Central role
    fn start_scan(&self, filter: ScanFilter) -> Result<(), RadioError>;
    fn stop_scan(&self);
    fn connect(&self, peer: &PeerHandle) -> Result<(), RadioError>;
    fn disconnect(&self, peer: &PeerHandle);
    fn discover_services(&self, peer: &PeerHandle) -> Result<(), RadioError>;
    fn discover_characteristics(&self, peer: &PeerHandle, service: Uuid)
        -> Result<(), RadioError>;
    fn read_characteristic(&self, peer: &PeerHandle, characteristic: Uuid)
        -> Result<(), RadioError>;

    /// Characteristic writes are not needed for discovery; platforms without
    /// write support keep the default.
    fn write_characteristic(
        &self,
        _peer: &PeerHandle,
        _characteristic: Uuid,
        _value: &[u8],
    ) -> Result<(), RadioError> {
        Err(RadioError::Unsupported)
    }

    /// Ask for a byte stream to `peer` on channel `psm`; the stream arrives
    /// through `ChannelBroker::fulfil` tagged with `request`.
    fn open_channel(
        &self,
        request: ChannelRequestId,
        peer: &PeerHandle,
        psm: u16,
    ) -> Result<(), RadioError>;

    // Peripheral role
    fn publish_channel(&self) -> Result<(), RadioError>;
    fn unpublish_channel(&self, psm: u16);
    fn add_service(&self, descriptor: &ServiceDescriptor) -> Result<(), RadioError>;
    fn remove_services(&self);
    fn start_advertising(&self, descriptor: &AdvertisementDescriptor) -> Result<(), RadioError>;
    fn stop_advertising(&self);
    fn respond_to_read(&self, request: ReadRequestId, value: Vec<u8>) -> Result<(), RadioError>;
}
