// nearlink core: BLE peer discovery, connection admission and byte-stream channels
#![allow(clippy::empty_line_after_doc_comments)]
//
// Platform glue owns the radio; everything that decides what the radio
// should do next lives here.

pub mod ble;
pub mod config;
pub mod discovery;

use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub use ble::{
    AdvertiseController, AdvertiseError, AdvertiseEvent, AdvertisePhase, ByteStreamChannel,
    ChannelBroker, ChannelError, ConnectFailure, ConnectionState, PeerHandle, RadioError,
    RadioStack, RadioState, ScanController, ScanError, ScanEvent, ScanMode,
};
pub use config::{AdvertiseConfig, ChannelConfig, ConfigError, LinkConfig, ScanConfig};
pub use discovery::{
    is_compatible, AdvertisementDataProvider, DeviceAnnouncementProvider, DeviceInfo,
    DiscoveredDevice, DiscoveryDelegate, DiscoveryMessage, DiscoveryPipeline,
    IncomingConnectionHandler, PayloadDecoder, PayloadError, VersionCompatibility,
    PROTOCOL_VERSION,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// How an error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Radio off, unauthorized or gone; the session stops and must be restarted
    RadioUnavailable,
    /// Worth retrying locally
    Transient,
    /// Peer lacks the expected service or characteristic; abandon that peer
    ProtocolMismatch,
    /// Undecodable payload; abandon that payload
    MalformedPayload,
    /// No capacity right now
    ResourceExhausted,
    /// The channel or request is finished; open a new one
    Terminated,
    /// Caller error (bad config, wrong state)
    Misuse,
}

impl ErrorClass {
    /// Errors that end a whole session rather than one peer or payload
    pub fn is_session_fatal(&self) -> bool {
        *self == ErrorClass::RadioUnavailable
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Advertise(#[from] AdvertiseError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Device {0} advertises no byte-stream channel")]
    NoChannel(String),
}

fn radio_class(err: &RadioError) -> ErrorClass {
    match err {
        RadioError::NotAvailable(_) | RadioError::Unsupported => ErrorClass::RadioUnavailable,
        RadioError::Busy => ErrorClass::ResourceExhausted,
        RadioError::UnknownPeer(_) | RadioError::Failed(_) => ErrorClass::Transient,
    }
}

impl LinkError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LinkError::Scan(err) => match err {
                ScanError::InvalidRadioState(_) => ErrorClass::RadioUnavailable,
                ScanError::Radio(e) => radio_class(e),
                // Constructed outside a tokio runtime
                ScanError::NoRuntime | ScanError::AlreadyRunning | ScanError::Config(_) => {
                    ErrorClass::Misuse
                }
            },
            LinkError::Advertise(err) => match err {
                AdvertiseError::InvalidRadioState(_)
                | AdvertiseError::ChannelPublishFailed(_)
                | AdvertiseError::ServiceAddFailed(_)
                | AdvertiseError::AdvertisingUnavailable { .. } => ErrorClass::RadioUnavailable,
                AdvertiseError::Radio(e) => radio_class(e),
                AdvertiseError::NoRuntime
                | AdvertiseError::AlreadyRunning
                | AdvertiseError::Config(_) => ErrorClass::Misuse,
            },
            LinkError::Channel(err) => match err {
                ChannelError::ChannelClosed | ChannelError::Io(_) => ErrorClass::Terminated,
                ChannelError::OpenTimeout | ChannelError::RequestFailed(_) => ErrorClass::Transient,
                ChannelError::InvalidLength => ErrorClass::Misuse,
            },
            LinkError::Payload(_) => ErrorClass::MalformedPayload,
            LinkError::Radio(err) => radio_class(err),
            LinkError::Config(_) => ErrorClass::Misuse,
            LinkError::UnknownDevice(_) => ErrorClass::Misuse,
            LinkError::NoChannel(_) => ErrorClass::ProtocolMismatch,
        }
    }
}

// ============================================================================
// LOGGING
// ============================================================================

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`); idempotent
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init();
}

/// Same as [`init_tracing`] with JSON output, for log collectors
pub fn init_tracing_json() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter())
        .try_init();
}

// ============================================================================
// FACADE
// ============================================================================

/// Both radio roles plus outbound channels, wired from one [`LinkConfig`]
pub struct NearLink {
    config: LinkConfig,
    pipeline: Arc<DiscoveryPipeline>,
    scanner: ScanController,
    advertiser: AdvertiseController,
    broker: ChannelBroker,
}

impl NearLink {
    /// Wire a link decoding announcements with the bincode codec
    ///
    /// Must be called inside a tokio runtime; timers run on it.
    pub fn new(
        radio: Arc<dyn RadioStack>,
        config: LinkConfig,
        delegate: Arc<dyn DiscoveryDelegate>,
        provider: Arc<dyn AdvertisementDataProvider>,
        incoming: Arc<dyn IncomingConnectionHandler>,
    ) -> Result<Self, LinkError> {
        let pipeline = Arc::new(DiscoveryPipeline::with_announcements(delegate));
        Self::with_pipeline(radio, config, pipeline, provider, incoming)
    }

    pub fn with_pipeline(
        radio: Arc<dyn RadioStack>,
        config: LinkConfig,
        pipeline: Arc<DiscoveryPipeline>,
        provider: Arc<dyn AdvertisementDataProvider>,
        incoming: Arc<dyn IncomingConnectionHandler>,
    ) -> Result<Self, LinkError> {
        config.validate()?;

        let scanner = ScanController::new(radio.clone(), config.scan.clone(), pipeline.clone())?;
        let advertiser = AdvertiseController::new(
            radio.clone(),
            config.advertise.clone(),
            config.channel.clone(),
            provider,
            incoming,
        )?;
        let broker = ChannelBroker::new(radio, config.channel.clone());

        tracing::info!(
            "Link ready (ceiling {}, cooldown {:?})",
            config.scan.max_concurrent_connections,
            config.scan.cooldown()
        );
        Ok(Self {
            config,
            pipeline,
            scanner,
            advertiser,
            broker,
        })
    }

    pub fn start_discovery(&self) -> Result<(), LinkError> {
        Ok(self.scanner.start()?)
    }

    pub fn stop_discovery(&self) {
        self.scanner.stop();
    }

    pub fn start_advertising(&self) -> Result<(), LinkError> {
        Ok(self.advertiser.start()?)
    }

    pub fn stop_advertising(&self) {
        self.advertiser.stop();
    }

    /// Stop both roles and abandon outstanding channel requests
    pub fn shutdown(&self) {
        self.scanner.stop();
        self.advertiser.stop();
        let abandoned = self.broker.cancel_all();
        if abandoned > 0 {
            tracing::debug!("Abandoned {} channel requests", abandoned);
        }
    }

    /// Radio state changes concern both roles
    pub fn on_radio_state_changed(&self, state: RadioState) {
        self.scanner.on_radio_state_changed(state);
        self.advertiser.on_radio_state_changed(state);
    }

    /// Open a byte stream to a discovered device over its published channel
    pub async fn connect_stream(&self, device_id: &str) -> Result<ByteStreamChannel, LinkError> {
        let device = self
            .pipeline
            .device(device_id)
            .ok_or_else(|| LinkError::UnknownDevice(device_id.to_string()))?;
        let ble = device.info.ble.unwrap_or_default();
        let psm = ble
            .psm
            .ok_or_else(|| LinkError::NoChannel(device_id.to_string()))?;
        let peer = ble.peer.unwrap_or(device.handle);

        Ok(self.broker.open(&peer, psm).await?)
    }

    pub fn scanner(&self) -> &ScanController {
        &self.scanner
    }

    pub fn advertiser(&self) -> &AdvertiseController {
        &self.advertiser
    }

    pub fn broker(&self) -> &ChannelBroker {
        &self.broker
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.pipeline.devices()
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }
}
