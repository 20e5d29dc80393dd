/// Advertise controller (peripheral role)
///
/// Publishes the byte-stream channel, registers the discovery service and
/// only then starts advertising. Identity reads are answered asynchronously
/// from the [`AdvertisementDataProvider`]; incoming streams are wrapped and
/// handed to the [`IncomingConnectionHandler`].
///
/// Phases: Idle -> PublishingChannel -> AddingService -> Advertising, with
/// Advertising <-> RetryBackoff on start failures and Failed once the retry
/// ceiling is exceeded.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::channel::{ByteStreamChannel, ChannelCloser, RawStream};
use super::gatt::{fits_characteristic, AdvertisementDescriptor, ServiceDescriptor, MAX_CHARACTERISTIC_SIZE};
use super::radio::{PeerHandle, RadioError, RadioStack, RadioState, ReadRequestId};
use super::timer::{TimerSet, TimerToken};
use crate::config::{AdvertiseConfig, ChannelConfig, ConfigError};
use crate::discovery::{AdvertisementDataProvider, IncomingConnectionHandler};
use crate::LinkError;

/// Advertise controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseError {
    #[error("Radio not powered on: {0}")]
    InvalidRadioState(RadioState),
    #[error("Advertising already running")]
    AlreadyRunning,
    #[error("No tokio runtime available for timers")]
    NoRuntime,
    #[error("Invalid advertise configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Radio refused request: {0}")]
    Radio(#[from] RadioError),
    #[error("Channel publishing failed: {0}")]
    ChannelPublishFailed(String),
    #[error("Service registration failed: {0}")]
    ServiceAddFailed(String),
    #[error("Advertising unavailable after {attempts} retries: {reason}")]
    AdvertisingUnavailable { attempts: u32, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisePhase {
    Idle,
    PublishingChannel,
    AddingService,
    /// Advertising requested or running
    Advertising,
    /// Waiting to retry a failed advertising start
    RetryBackoff,
    /// Retry ceiling exceeded; needs stop/start
    Failed,
}

impl fmt::Display for AdvertisePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertisePhase::Idle => write!(f, "Idle"),
            AdvertisePhase::PublishingChannel => write!(f, "PublishingChannel"),
            AdvertisePhase::AddingService => write!(f, "AddingService"),
            AdvertisePhase::Advertising => write!(f, "Advertising"),
            AdvertisePhase::RetryBackoff => write!(f, "RetryBackoff"),
            AdvertisePhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Inbound radio events for the peripheral role
pub enum AdvertiseEvent {
    ChannelPublished { psm: u16 },
    ChannelPublishFailed(String),
    ServiceAdded,
    ServiceAddFailed(String),
    AdvertiseStarted,
    AdvertiseFailed(String),
    ReadRequested(ReadRequestId),
    IncomingChannelOpened {
        peer: Option<PeerHandle>,
        stream: Box<dyn RawStream>,
    },
    RadioStateChanged(RadioState),
}

impl fmt::Debug for AdvertiseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertiseEvent::ChannelPublished { psm } => write!(f, "ChannelPublished({:#06x})", psm),
            AdvertiseEvent::ChannelPublishFailed(r) => write!(f, "ChannelPublishFailed({})", r),
            AdvertiseEvent::ServiceAdded => write!(f, "ServiceAdded"),
            AdvertiseEvent::ServiceAddFailed(r) => write!(f, "ServiceAddFailed({})", r),
            AdvertiseEvent::AdvertiseStarted => write!(f, "AdvertiseStarted"),
            AdvertiseEvent::AdvertiseFailed(r) => write!(f, "AdvertiseFailed({})", r),
            AdvertiseEvent::ReadRequested(id) => write!(f, "ReadRequested({})", id.0),
            AdvertiseEvent::IncomingChannelOpened { peer, .. } => {
                write!(f, "IncomingChannelOpened({:?})", peer)
            }
            AdvertiseEvent::RadioStateChanged(state) => write!(f, "RadioStateChanged({})", state),
        }
    }
}

/// Notified about advertising outcomes
pub trait AdvertiseObserver: Send + Sync {
    /// Advertising stopped for good; a stop/start cycle is required
    fn on_advertising_failed(&self, error: &LinkError);

    fn on_advertising_started(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AdvertiseTimer {
    Retry,
}

/// Radio registrations left over from a session, released outside the lock
#[derive(Debug, Default)]
struct Teardown {
    service_added: bool,
    psm: Option<u16>,
}

impl Teardown {
    fn take(session: &mut Session) -> Self {
        Self {
            service_added: std::mem::replace(&mut session.service_added, false),
            psm: session.psm.take(),
        }
    }

    fn release(self, radio: &dyn RadioStack) {
        // Advertising is only ever requested once the service is in place
        if self.service_added {
            radio.stop_advertising();
            radio.remove_services();
        }
        if let Some(psm) = self.psm {
            radio.unpublish_channel(psm);
        }
    }
}

struct Session {
    phase: AdvertisePhase,
    epoch: u64,
    retry_count: u32,
    psm: Option<u16>,
    /// The radio confirmed advertising is on air
    on_air: bool,
    service_added: bool,
    timers: TimerSet<AdvertiseTimer>,
    reads: Vec<JoinHandle<()>>,
    channels: Vec<ChannelCloser>,
}

struct AdvertiseInner {
    this: Weak<AdvertiseInner>,
    radio: Arc<dyn RadioStack>,
    config: AdvertiseConfig,
    channel_config: ChannelConfig,
    provider: Arc<dyn AdvertisementDataProvider>,
    incoming: Arc<dyn IncomingConnectionHandler>,
    observer: Mutex<Option<Arc<dyn AdvertiseObserver>>>,
    runtime: Handle,
    session: Mutex<Session>,
}

/// Peripheral-role lifecycle engine
#[derive(Clone)]
pub struct AdvertiseController {
    inner: Arc<AdvertiseInner>,
}

impl AdvertiseController {
    pub fn new(
        radio: Arc<dyn RadioStack>,
        config: AdvertiseConfig,
        channel_config: ChannelConfig,
        provider: Arc<dyn AdvertisementDataProvider>,
        incoming: Arc<dyn IncomingConnectionHandler>,
    ) -> Result<Self, AdvertiseError> {
        let runtime = Handle::try_current().map_err(|_| AdvertiseError::NoRuntime)?;
        config.validate()?;
        channel_config.validate()?;

        let inner = Arc::new_cyclic(|this| AdvertiseInner {
            this: this.clone(),
            radio,
            config,
            channel_config,
            provider,
            incoming,
            observer: Mutex::new(None),
            runtime: runtime.clone(),
            session: Mutex::new(Session {
                phase: AdvertisePhase::Idle,
                epoch: 0,
                retry_count: 0,
                psm: None,
                on_air: false,
                service_added: false,
                timers: TimerSet::new(runtime),
                reads: Vec::new(),
                channels: Vec::new(),
            }),
        });
        Ok(Self { inner })
    }

    pub fn set_observer(&self, observer: Arc<dyn AdvertiseObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    /// Publish the channel; service registration and advertising follow
    /// from the radio's confirmations
    pub fn start(&self) -> Result<(), AdvertiseError> {
        self.inner.start()
    }

    /// Tear everything down; idempotent
    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn handle_event(&self, event: AdvertiseEvent) {
        debug!("Advertise event {:?}", event);
        match event {
            AdvertiseEvent::ChannelPublished { psm } => self.on_channel_published(psm),
            AdvertiseEvent::ChannelPublishFailed(reason) => self.on_channel_publish_failed(reason),
            AdvertiseEvent::ServiceAdded => self.on_service_added(),
            AdvertiseEvent::ServiceAddFailed(reason) => self.on_service_add_failed(reason),
            AdvertiseEvent::AdvertiseStarted => self.on_advertise_started(),
            AdvertiseEvent::AdvertiseFailed(reason) => self.on_advertise_failed(reason),
            AdvertiseEvent::ReadRequested(request) => self.on_read_request(request),
            AdvertiseEvent::IncomingChannelOpened { peer, stream } => {
                self.on_incoming_channel_opened(peer, stream)
            }
            AdvertiseEvent::RadioStateChanged(state) => self.on_radio_state_changed(state),
        }
    }

    pub fn on_channel_published(&self, psm: u16) {
        self.inner.channel_published(psm);
    }

    pub fn on_channel_publish_failed(&self, reason: String) {
        self.inner
            .setup_failed(AdvertisePhase::PublishingChannel, AdvertiseError::ChannelPublishFailed(reason));
    }

    pub fn on_service_added(&self) {
        self.inner.service_added();
    }

    pub fn on_service_add_failed(&self, reason: String) {
        self.inner
            .setup_failed(AdvertisePhase::AddingService, AdvertiseError::ServiceAddFailed(reason));
    }

    pub fn on_advertise_started(&self) {
        self.inner.advertise_started();
    }

    pub fn on_advertise_failed(&self, reason: String) {
        self.inner.advertise_failed(reason);
    }

    /// Answer a read of the discovery characteristic without blocking
    pub fn on_read_request(&self, request: ReadRequestId) {
        self.inner.read_requested(request);
    }

    pub fn on_incoming_channel_opened(&self, peer: Option<PeerHandle>, stream: Box<dyn RawStream>) {
        self.inner.incoming_channel(peer, stream);
    }

    pub fn on_radio_state_changed(&self, state: RadioState) {
        self.inner.radio_state_changed(state);
    }

    pub fn phase(&self) -> AdvertisePhase {
        self.inner.session.lock().phase
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.session.lock().retry_count
    }

    pub fn psm(&self) -> Option<u16> {
        self.inner.session.lock().psm
    }

    /// Advertising confirmed on air
    pub fn is_advertising(&self) -> bool {
        self.inner.session.lock().on_air
    }

    /// Incoming channels still open
    pub fn open_channels(&self) -> usize {
        let mut session = self.inner.session.lock();
        session.channels.retain(ChannelCloser::is_alive);
        session.channels.len()
    }
}

impl AdvertiseInner {
    fn descriptor(&self) -> AdvertisementDescriptor {
        AdvertisementDescriptor::new(self.config.service_uuid, self.config.local_name.clone())
    }

    fn observer(&self) -> Option<Arc<dyn AdvertiseObserver>> {
        self.observer.lock().clone()
    }

    fn surface(&self, error: AdvertiseError) {
        let error = LinkError::Advertise(error);
        error!("Advertising failed: {}", error);
        if let Some(observer) = self.observer() {
            observer.on_advertising_failed(&error);
        }
    }

    fn start(&self) -> Result<(), AdvertiseError> {
        let radio_state = self.radio.state();
        if !radio_state.is_powered_on() {
            warn!("Cannot advertise, radio is {}", radio_state);
            return Err(AdvertiseError::InvalidRadioState(radio_state));
        }

        let (epoch, leftover) = {
            let mut session = self.session.lock();
            let leftover = match session.phase {
                AdvertisePhase::Idle => Teardown::default(),
                AdvertisePhase::Failed => {
                    debug!("Restarting advertising after failure");
                    session.timers.cancel_all();
                    Teardown::take(&mut session)
                }
                _ => return Err(AdvertiseError::AlreadyRunning),
            };
            session.epoch += 1;
            session.retry_count = 0;
            session.on_air = false;
            session.phase = AdvertisePhase::PublishingChannel;
            (session.epoch, leftover)
        };

        leftover.release(self.radio.as_ref());
        info!("Publishing byte-stream channel");
        if let Err(e) = self.radio.publish_channel() {
            let mut session = self.session.lock();
            if session.epoch == epoch && session.phase == AdvertisePhase::PublishingChannel {
                session.phase = AdvertisePhase::Idle;
            }
            return Err(e.into());
        }
        Ok(())
    }

    fn stop(&self) {
        let (channels, teardown, was_idle) = {
            let mut session = self.session.lock();
            session.timers.cancel_all();
            for read in session.reads.drain(..) {
                read.abort();
            }
            let channels: Vec<ChannelCloser> = session.channels.drain(..).collect();
            let was_idle = session.phase == AdvertisePhase::Idle;
            if !was_idle {
                session.epoch += 1;
            }
            let teardown = Teardown::take(&mut session);
            session.phase = AdvertisePhase::Idle;
            session.on_air = false;
            session.retry_count = 0;
            (channels, teardown, was_idle)
        };

        teardown.release(self.radio.as_ref());
        let closed = channels.iter().filter(|closer| closer.close()).count();
        if !was_idle {
            self.provider.on_advertising_changed(false);
            info!("Advertising stopped ({} channels closed)", closed);
        }
    }

    fn channel_published(&self, psm: u16) {
        {
            let mut session = self.session.lock();
            if session.phase != AdvertisePhase::PublishingChannel {
                debug!("Channel publication in phase {} ignored", session.phase);
                return;
            }
            session.psm = Some(psm);
            session.phase = AdvertisePhase::AddingService;
        }
        info!("Channel published on PSM {:#06x}", psm);
        self.provider.on_channel_published(psm);

        let service = ServiceDescriptor::new(
            self.config.service_uuid,
            self.config.characteristic_uuid,
            psm,
        );
        if let Err(e) = self.radio.add_service(&service) {
            self.setup_failed(
                AdvertisePhase::AddingService,
                AdvertiseError::ServiceAddFailed(e.to_string()),
            );
        }
    }

    fn service_added(&self) {
        {
            let mut session = self.session.lock();
            if session.phase != AdvertisePhase::AddingService {
                debug!("Service confirmation in phase {} ignored", session.phase);
                return;
            }
            session.service_added = true;
            session.phase = AdvertisePhase::Advertising;
        }
        debug!("Discovery service registered, starting advertising");
        self.request_advertising();
    }

    fn request_advertising(&self) {
        if let Err(e) = self.radio.start_advertising(&self.descriptor()) {
            self.advertise_failed(e.to_string());
        }
    }

    /// Channel publication or service registration failed; the published
    /// channel (if any) is released on stop
    fn setup_failed(&self, expected: AdvertisePhase, error: AdvertiseError) {
        {
            let mut session = self.session.lock();
            if session.phase != expected {
                debug!("{} in phase {} ignored", error, session.phase);
                return;
            }
            session.phase = AdvertisePhase::Failed;
        }
        self.surface(error);
    }

    fn advertise_started(&self) {
        {
            let mut session = self.session.lock();
            if session.phase != AdvertisePhase::Advertising {
                debug!("Advertising confirmation in phase {} ignored", session.phase);
                return;
            }
            session.retry_count = 0;
            session.on_air = true;
        }
        info!("Advertising {}", self.config.service_uuid);
        self.provider.on_advertising_changed(true);
        if let Some(observer) = self.observer() {
            observer.on_advertising_started();
        }
    }

    fn advertise_failed(&self, reason: String) {
        let mut session = self.session.lock();
        if session.phase != AdvertisePhase::Advertising {
            debug!("Advertising failure in phase {} ignored", session.phase);
            return;
        }
        let was_on_air = session.on_air;
        session.on_air = false;

        if session.retry_count >= self.config.max_retries {
            session.phase = AdvertisePhase::Failed;
            let attempts = session.retry_count;
            drop(session);
            if was_on_air {
                self.provider.on_advertising_changed(false);
            }
            self.surface(AdvertiseError::AdvertisingUnavailable { attempts, reason });
            return;
        }

        session.retry_count += 1;
        session.phase = AdvertisePhase::RetryBackoff;
        let delay = self.config.retry_delay(session.retry_count);
        warn!(
            "Advertising failed ({}), retry {} of {} in {:?}",
            reason, session.retry_count, self.config.max_retries, delay
        );

        let epoch = session.epoch;
        let this = self.this.clone();
        session
            .timers
            .schedule(AdvertiseTimer::Retry, delay, move |token| {
                if let Some(inner) = this.upgrade() {
                    inner.retry_fired(epoch, token);
                }
            });
        drop(session);

        if was_on_air {
            self.provider.on_advertising_changed(false);
        }
    }

    fn retry_fired(&self, epoch: u64, token: TimerToken) {
        {
            let mut session = self.session.lock();
            if session.epoch != epoch
                || session.phase != AdvertisePhase::RetryBackoff
                || !session.timers.complete(&AdvertiseTimer::Retry, token)
            {
                return;
            }
            session.phase = AdvertisePhase::Advertising;
        }
        debug!("Retrying advertising");
        self.request_advertising();
    }

    fn read_requested(&self, request: ReadRequestId) {
        let mut session = self.session.lock();
        if session.phase == AdvertisePhase::Idle {
            debug!("Read request {} while idle ignored", request.0);
            return;
        }

        let provider = self.provider.clone();
        let radio = self.radio.clone();
        let task = self.runtime.spawn(async move {
            let mut payload = provider.current_payload().await;
            if !fits_characteristic(&payload) {
                warn!(
                    "Identity payload of {} bytes exceeds {} bytes, serving empty value",
                    payload.len(),
                    MAX_CHARACTERISTIC_SIZE
                );
                payload.clear();
            }
            if let Err(e) = radio.respond_to_read(request, payload) {
                warn!("Responding to read {} failed: {}", request.0, e);
            }
        });

        session.reads.retain(|read| !read.is_finished());
        session.reads.push(task);
    }

    fn incoming_channel(&self, peer: Option<PeerHandle>, stream: Box<dyn RawStream>) {
        let channel = {
            let mut session = self.session.lock();
            if session.phase == AdvertisePhase::Idle {
                debug!("Incoming stream while idle, closing");
                stream.close();
                return;
            }
            let channel = ByteStreamChannel::new(peer, stream, self.channel_config.poll_interval());
            session.channels.retain(ChannelCloser::is_alive);
            session.channels.push(channel.closer());
            channel
        };
        debug!("Handing incoming channel {} to handler", channel.id().simple());
        self.incoming.on_stream(channel);
    }

    fn radio_state_changed(&self, state: RadioState) {
        if state.is_powered_on() {
            return;
        }
        let active = self.session.lock().phase != AdvertisePhase::Idle;
        if active {
            warn!("Radio went {} while advertising", state);
            self.stop();
            self.surface(AdvertiseError::InvalidRadioState(state));
        }
    }
}
