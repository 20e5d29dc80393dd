/// Scan controller (central role)
///
/// Scans for the discovery service, admits sighted peers through the
/// admission policy and walks each admitted peer through connect, service
/// discovery, characteristic discovery and the identity read. Radio
/// completions arrive as [`ScanEvent`]s from any thread.
///
/// Handlers decide under the peer's lock and emit [`Command`]s; commands run
/// after every lock is released, so a radio that answers or fails a request
/// synchronously simply feeds another event back in. Lock order is session,
/// then peer table, then peer; the radio is never called with any of them held.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::admission::{
    Admission, AdmissionPolicy, CloseReason, ConnectionState, PeerRecord, PeerTable,
};
use super::radio::{ConnectFailure, PeerHandle, RadioError, RadioStack, RadioState, ScanFilter};
use super::timer::{TimerSet, TimerToken};
use crate::config::{ConfigError, ScanConfig};
use crate::discovery::{DiscoveredDevice, DiscoveryPipeline};
use crate::LinkError;

/// Scan controller errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("Radio not powered on: {0}")]
    InvalidRadioState(RadioState),
    #[error("Scan session already running")]
    AlreadyRunning,
    #[error("No tokio runtime available for timers")]
    NoRuntime,
    #[error("Invalid scan configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Radio refused to scan: {0}")]
    Radio(#[from] RadioError),
}

/// How the radio is asked to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Filtered to the discovery service by the radio
    Targeted,
    /// Unfiltered, filtered here against advertised service ids
    BroadFallback,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Targeted => write!(f, "Targeted"),
            ScanMode::BroadFallback => write!(f, "BroadFallback"),
        }
    }
}

/// Inbound radio events for the central role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    PeerSighted {
        handle: PeerHandle,
        service_ids: Vec<Uuid>,
    },
    ConnectFailed {
        handle: PeerHandle,
        reason: ConnectFailure,
    },
    Connected {
        handle: PeerHandle,
    },
    ServicesDiscovered {
        handle: PeerHandle,
        services: Vec<Uuid>,
    },
    CharacteristicsDiscovered {
        handle: PeerHandle,
        characteristics: Vec<Uuid>,
    },
    PayloadRead {
        handle: PeerHandle,
        result: Result<Vec<u8>, String>,
    },
    Disconnected {
        handle: PeerHandle,
    },
    ServicesInvalidated {
        handle: PeerHandle,
    },
    RadioStateChanged(RadioState),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ScanTimer {
    Restart,
    Fallback,
    QuickRetry(PeerHandle),
    ConnectTimeout(PeerHandle),
}

/// Side effects decided by a handler, run after locks are released
#[derive(Debug)]
enum Command {
    Connect(PeerHandle),
    Disconnect(PeerHandle),
    DiscoverServices(PeerHandle),
    DiscoverCharacteristics(PeerHandle),
    ReadPayload(PeerHandle),
    Deliver(PeerHandle, Vec<u8>),
    ScheduleRetry(PeerHandle),
    CancelConnectTimeout(PeerHandle),
    CancelPeerTimers(PeerHandle),
    PauseScan,
    ResumeScan,
}

struct Session {
    running: bool,
    /// Bumped on every start/stop; timer callbacks from older sessions are void
    epoch: u64,
    mode: ScanMode,
    /// The radio is currently scanning on our behalf
    scanning: bool,
    /// Scanning suspended while a connect is outstanding
    paused: bool,
    sightings: u64,
    timers: TimerSet<ScanTimer>,
}

struct ScanInner {
    this: Weak<ScanInner>,
    radio: Arc<dyn RadioStack>,
    config: ScanConfig,
    policy: AdmissionPolicy,
    table: PeerTable,
    pipeline: Arc<DiscoveryPipeline>,
    session: Mutex<Session>,
}

/// Central-role lifecycle and admission engine
#[derive(Clone)]
pub struct ScanController {
    inner: Arc<ScanInner>,
}

impl ScanController {
    /// Create a controller bound to the current tokio runtime
    pub fn new(
        radio: Arc<dyn RadioStack>,
        config: ScanConfig,
        pipeline: Arc<DiscoveryPipeline>,
    ) -> Result<Self, ScanError> {
        let runtime = Handle::try_current().map_err(|_| ScanError::NoRuntime)?;
        Self::with_runtime(radio, config, pipeline, runtime)
    }

    /// Create a controller whose timers run on `runtime`
    pub fn with_runtime(
        radio: Arc<dyn RadioStack>,
        config: ScanConfig,
        pipeline: Arc<DiscoveryPipeline>,
        runtime: Handle,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        let policy = AdmissionPolicy::from_config(&config);
        let inner = Arc::new_cyclic(|this| ScanInner {
            this: this.clone(),
            radio,
            config,
            policy,
            table: PeerTable::new(),
            pipeline,
            session: Mutex::new(Session {
                running: false,
                epoch: 0,
                mode: ScanMode::Targeted,
                scanning: false,
                paused: false,
                sightings: 0,
                timers: TimerSet::new(runtime),
            }),
        });
        Ok(Self { inner })
    }

    /// Begin a fresh scan session
    pub fn start(&self) -> Result<(), ScanError> {
        self.inner.start()
    }

    /// End the session; idempotent
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Dispatch one radio event
    pub fn handle_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::PeerSighted {
                handle,
                service_ids,
            } => {
                self.on_peer_sighted(&handle, &service_ids);
            }
            ScanEvent::ConnectFailed { handle, reason } => self.on_connect_failed(&handle, reason),
            ScanEvent::Connected { handle } => self.on_connected(&handle),
            ScanEvent::ServicesDiscovered { handle, services } => {
                self.on_services_discovered(&handle, &services)
            }
            ScanEvent::CharacteristicsDiscovered {
                handle,
                characteristics,
            } => self.on_characteristics_discovered(&handle, &characteristics),
            ScanEvent::PayloadRead { handle, result } => self.on_payload_read(&handle, result),
            ScanEvent::Disconnected { handle } => self.on_disconnected(&handle),
            ScanEvent::ServicesInvalidated { handle } => self.on_services_invalidated(&handle),
            ScanEvent::RadioStateChanged(state) => self.on_radio_state_changed(state),
        }
    }

    /// Returns the admission verdict, or `None` if the sighting was discarded
    /// before admission (no session, or filtered out in fallback mode)
    pub fn on_peer_sighted(&self, handle: &PeerHandle, service_ids: &[Uuid]) -> Option<Admission> {
        let (verdict, commands) = self.inner.peer_sighted(handle, service_ids)?;
        self.inner.run(commands);
        Some(verdict)
    }

    pub fn on_connect_failed(&self, handle: &PeerHandle, reason: ConnectFailure) {
        let commands = self.inner.connect_failed(handle, reason);
        self.inner.run(commands);
    }

    pub fn on_connected(&self, handle: &PeerHandle) {
        let commands = self.inner.connected(handle);
        self.inner.run(commands);
    }

    pub fn on_services_discovered(&self, handle: &PeerHandle, services: &[Uuid]) {
        let commands = self.inner.services_discovered(handle, services);
        self.inner.run(commands);
    }

    pub fn on_characteristics_discovered(&self, handle: &PeerHandle, characteristics: &[Uuid]) {
        let commands = self.inner.characteristics_discovered(handle, characteristics);
        self.inner.run(commands);
    }

    pub fn on_payload_read(&self, handle: &PeerHandle, result: Result<Vec<u8>, String>) {
        let commands = self.inner.payload_read(handle, result);
        self.inner.run(commands);
    }

    pub fn on_disconnected(&self, handle: &PeerHandle) {
        let commands = self.inner.disconnected(handle);
        self.inner.run(commands);
    }

    pub fn on_services_invalidated(&self, handle: &PeerHandle) {
        let commands = self.inner.services_invalidated(handle);
        self.inner.run(commands);
    }

    pub fn on_radio_state_changed(&self, state: RadioState) {
        self.inner.radio_state_changed(state);
    }

    pub fn is_running(&self) -> bool {
        self.inner.session.lock().running
    }

    /// Whether the radio is scanning right now (false while paused)
    pub fn is_scanning(&self) -> bool {
        self.inner.session.lock().scanning
    }

    pub fn mode(&self) -> ScanMode {
        self.inner.session.lock().mode
    }

    pub fn peer_state(&self, handle: &PeerHandle) -> Option<ConnectionState> {
        self.inner.table.state_of(handle)
    }

    pub fn peer_record(&self, handle: &PeerHandle) -> Option<PeerRecord> {
        self.inner.table.snapshot(handle)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.table.active_count()
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.inner.pipeline.devices()
    }

    pub fn config(&self) -> &ScanConfig {
        &self.inner.config
    }
}

impl ScanInner {
    fn filter_for(&self, mode: ScanMode) -> ScanFilter {
        match mode {
            ScanMode::Targeted => ScanFilter::Service(self.config.service_uuid),
            ScanMode::BroadFallback => ScanFilter::Unfiltered,
        }
    }

    fn start(&self) -> Result<(), ScanError> {
        let radio_state = self.radio.state();
        if !radio_state.is_powered_on() {
            warn!("Cannot start scanning, radio is {}", radio_state);
            return Err(ScanError::InvalidRadioState(radio_state));
        }

        let (epoch, stale) = {
            let mut session = self.session.lock();
            if session.running {
                return Err(ScanError::AlreadyRunning);
            }

            session.epoch += 1;
            session.timers.cancel_all();
            session.mode = ScanMode::Targeted;
            session.paused = false;
            session.sightings = 0;
            session.running = true;
            session.scanning = true;
            let stale = self.table.clear();
            self.pipeline.clear();

            let epoch = session.epoch;
            let this = self.this.clone();
            session.timers.schedule_repeating(
                ScanTimer::Restart,
                self.config.restart_interval(),
                move |token| {
                    if let Some(inner) = this.upgrade() {
                        inner.restart_tick(epoch, token);
                    }
                },
            );
            let this = self.this.clone();
            session
                .timers
                .schedule(ScanTimer::Fallback, self.config.fallback_after(), move |token| {
                    if let Some(inner) = this.upgrade() {
                        inner.fallback_fired(epoch, token);
                    }
                });
            (epoch, stale)
        };

        for handle in &stale {
            self.radio.disconnect(handle);
        }
        if let Err(e) = self.radio.start_scan(self.filter_for(ScanMode::Targeted)) {
            let mut session = self.session.lock();
            if session.epoch == epoch {
                session.epoch += 1;
                session.running = false;
                session.scanning = false;
                session.timers.cancel_all();
            }
            return Err(e.into());
        }

        info!(
            "Scan session {} started for service {}",
            epoch, self.config.service_uuid
        );
        Ok(())
    }

    fn stop(&self) {
        let (engaged, was_scanning) = {
            let mut session = self.session.lock();
            let cancelled = session.timers.cancel_all();
            if !session.running {
                return;
            }
            session.epoch += 1;
            session.running = false;
            session.paused = false;
            let was_scanning = std::mem::replace(&mut session.scanning, false);
            debug!("Cancelled {} scan timers", cancelled);
            (self.table.clear(), was_scanning)
        };

        if was_scanning {
            self.radio.stop_scan();
        }
        for handle in &engaged {
            self.radio.disconnect(handle);
        }
        info!("Scan session stopped ({} peers released)", engaged.len());
    }

    /// A (re)start request issued outside the session lock was refused
    fn scan_refused(&self, epoch: u64, error: RadioError) {
        let mut session = self.session.lock();
        if session.epoch == epoch {
            session.scanning = false;
        }
        warn!("Scan request refused, next restart will retry: {}", error);
    }

    fn restart_tick(&self, epoch: u64, token: TimerToken) {
        let (was_scanning, filter) = {
            let mut session = self.session.lock();
            if !session.running
                || session.epoch != epoch
                || !session.timers.is_current(&ScanTimer::Restart, token)
            {
                return;
            }
            if session.paused {
                trace!("Scan restart skipped while paused");
                return;
            }
            let was_scanning = std::mem::replace(&mut session.scanning, true);
            (was_scanning, self.filter_for(session.mode))
        };

        if was_scanning {
            self.radio.stop_scan();
        }
        match self.radio.start_scan(filter) {
            Ok(()) => debug!("Scan restarted ({:?})", filter),
            Err(e) => self.scan_refused(epoch, e),
        }
    }

    fn fallback_fired(&self, epoch: u64, token: TimerToken) {
        let rescan = {
            let mut session = self.session.lock();
            if !session.running
                || session.epoch != epoch
                || !session.timers.complete(&ScanTimer::Fallback, token)
            {
                return;
            }
            if session.sightings > 0 || session.mode == ScanMode::BroadFallback {
                return;
            }
            session.mode = ScanMode::BroadFallback;
            session.scanning && !session.paused
        };

        info!(
            "No peers sighted after {:?}, falling back to unfiltered scanning",
            self.config.fallback_after()
        );
        if rescan {
            self.radio.stop_scan();
            if let Err(e) = self.radio.start_scan(ScanFilter::Unfiltered) {
                self.scan_refused(epoch, e);
            }
        }
    }

    fn quick_retry_fired(&self, handle: PeerHandle, epoch: u64, token: TimerToken) {
        {
            let mut session = self.session.lock();
            if !session.running
                || session.epoch != epoch
                || !session
                    .timers
                    .complete(&ScanTimer::QuickRetry(handle.clone()), token)
            {
                return;
            }
        }

        let Some(record) = self.table.get(&handle) else {
            return;
        };
        let still_attempting = record.lock().state.is_attempting();
        if still_attempting {
            debug!("Quick retry connecting to {}", handle);
            self.run(vec![Command::Connect(handle)]);
        }
    }

    fn connect_timeout_fired(&self, handle: PeerHandle, epoch: u64, token: TimerToken) {
        {
            let mut session = self.session.lock();
            if !session.running
                || session.epoch != epoch
                || !session
                    .timers
                    .complete(&ScanTimer::ConnectTimeout(handle.clone()), token)
            {
                return;
            }
        }

        let commands = self.attempt_failed(&handle, ConnectFailure::Timeout, true);
        self.run(commands);
    }

    fn peer_sighted(
        &self,
        handle: &PeerHandle,
        service_ids: &[Uuid],
    ) -> Option<(Admission, Vec<Command>)> {
        let outcome = {
            let mut session = self.session.lock();
            if !session.running {
                trace!("Sighting of {} outside a scan session", handle);
                return None;
            }
            if session.mode == ScanMode::BroadFallback
                && !service_ids.contains(&self.config.service_uuid)
            {
                trace!("Discarding {} (service not advertised)", handle);
                return None;
            }
            session.sightings += 1;
            self.table.admit(handle, &self.policy, Instant::now())
        };

        if outcome.first_sighting {
            debug!("New peer {} sighted", handle);
        }

        let commands = match outcome.decision.verdict {
            Admission::Admit => vec![Command::PauseScan, Command::Connect(handle.clone())],
            Admission::SkipCooldown => {
                debug!(
                    "Skipping {} (cooldown, skip {} of {})",
                    handle, outcome.decision.skip_count, self.policy.skip_threshold
                );
                Vec::new()
            }
            Admission::SkipCeiling => {
                trace!("Skipping {} ({})", handle, outcome.previous_state);
                Vec::new()
            }
        };
        Some((outcome.decision.verdict, commands))
    }

    fn connect_failed(&self, handle: &PeerHandle, reason: ConnectFailure) -> Vec<Command> {
        self.attempt_failed(handle, reason, false)
    }

    /// Decide on a failed attempt under the peer lock; a timed-out attempt
    /// is only torn down if the peer is still attempting
    fn attempt_failed(
        &self,
        handle: &PeerHandle,
        reason: ConnectFailure,
        timed_out: bool,
    ) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            debug!("Connect failure for unknown peer {} ignored", handle);
            return Vec::new();
        };
        let mut record = record.lock();
        if !record.state.is_attempting() {
            debug!(
                "Connect failure for {} in state {} ignored",
                handle, record.state
            );
            return Vec::new();
        }

        let mut commands = Vec::new();
        if timed_out {
            warn!(
                "Connect to {} timed out after {:?}",
                handle,
                self.config.connect_timeout()
            );
            commands.push(Command::Disconnect(handle.clone()));
        }

        if reason.is_transient() && record.retry_count < self.config.max_quick_retries {
            record.retry_count += 1;
            info!(
                "Connect to {} failed ({}), quick retry {} of {}",
                handle, reason, record.retry_count, self.config.max_quick_retries
            );
            commands.push(Command::CancelConnectTimeout(handle.clone()));
            commands.push(Command::ScheduleRetry(handle.clone()));
            return commands;
        }

        warn!("Connect to {} failed: {}", handle, reason);
        record.state = ConnectionState::Closed(CloseReason::ConnectFailed(reason));
        commands.push(Command::CancelPeerTimers(handle.clone()));
        commands.push(Command::ResumeScan);
        commands
    }

    fn connected(&self, handle: &PeerHandle) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            warn!("Connected to untracked peer {}, disconnecting", handle);
            return vec![Command::Disconnect(handle.clone())];
        };
        let mut record = record.lock();
        match record.state {
            ConnectionState::Attempting => {}
            ConnectionState::Idle | ConnectionState::Closed(_) => {
                warn!("Stale connection to {}, disconnecting", handle);
                return vec![Command::Disconnect(handle.clone())];
            }
            _ => {
                debug!("Duplicate connect event for {} ignored", handle);
                return Vec::new();
            }
        }

        record.skip_count = 0;
        record.retry_count = 0;
        record.state = ConnectionState::DiscoveringServices;
        debug!("Connected to {}, discovering services", handle);
        vec![
            Command::CancelConnectTimeout(handle.clone()),
            Command::DiscoverServices(handle.clone()),
            Command::ResumeScan,
        ]
    }

    fn services_discovered(&self, handle: &PeerHandle, services: &[Uuid]) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            return Vec::new();
        };
        let mut record = record.lock();
        if record.state != ConnectionState::DiscoveringServices {
            debug!("Unexpected services for {} in state {}", handle, record.state);
            return Vec::new();
        }

        if !services.contains(&self.config.service_uuid) {
            info!("Peer {} does not expose the discovery service", handle);
            record.state = ConnectionState::Closed(CloseReason::ServiceNotFound);
            return vec![Command::Disconnect(handle.clone()), Command::ResumeScan];
        }

        record.state = ConnectionState::DiscoveringCharacteristics;
        vec![Command::DiscoverCharacteristics(handle.clone())]
    }

    fn characteristics_discovered(
        &self,
        handle: &PeerHandle,
        characteristics: &[Uuid],
    ) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            return Vec::new();
        };
        let mut record = record.lock();
        if record.state != ConnectionState::DiscoveringCharacteristics {
            debug!(
                "Unexpected characteristics for {} in state {}",
                handle, record.state
            );
            return Vec::new();
        }

        if !characteristics.contains(&self.config.discovery_characteristic_uuid) {
            info!("Peer {} lacks the discovery characteristic", handle);
            record.state = ConnectionState::Closed(CloseReason::CharacteristicNotFound);
            return vec![Command::Disconnect(handle.clone()), Command::ResumeScan];
        }

        record.state = ConnectionState::ReadingPayload;
        vec![Command::ReadPayload(handle.clone())]
    }

    fn payload_read(&self, handle: &PeerHandle, result: Result<Vec<u8>, String>) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            return Vec::new();
        };
        let mut record = record.lock();
        if record.state != ConnectionState::ReadingPayload {
            debug!("Unexpected payload for {} in state {}", handle, record.state);
            return Vec::new();
        }

        match result {
            Ok(bytes) => {
                debug!("Read {} byte identity payload from {}", bytes.len(), handle);
                record.state = ConnectionState::Draining;
                vec![
                    Command::Deliver(handle.clone(), bytes),
                    Command::Disconnect(handle.clone()),
                    Command::ResumeScan,
                ]
            }
            Err(reason) => {
                warn!("Identity read from {} failed: {}", handle, reason);
                record.state = ConnectionState::Closed(CloseReason::ReadFailed(reason));
                vec![Command::Disconnect(handle.clone()), Command::ResumeScan]
            }
        }
    }

    fn disconnected(&self, handle: &PeerHandle) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            return Vec::new();
        };
        let mut record = record.lock();
        let reason = match record.state {
            ConnectionState::Draining => CloseReason::Completed,
            ConnectionState::Attempting => {
                debug!("Disconnect for {} while a connect is pending ignored", handle);
                return Vec::new();
            }
            ref state if state.is_linked() => {
                info!("Peer {} disconnected during {}", handle, state);
                CloseReason::Disconnected
            }
            _ => return Vec::new(),
        };
        record.state = ConnectionState::Closed(reason);
        vec![Command::CancelPeerTimers(handle.clone()), Command::ResumeScan]
    }

    fn services_invalidated(&self, handle: &PeerHandle) -> Vec<Command> {
        let Some(record) = self.table.evict(handle) else {
            return Vec::new();
        };
        info!("Services of {} invalidated, peer forgotten", handle);

        let mut commands = vec![Command::CancelPeerTimers(handle.clone())];
        if record.state.is_active() {
            commands.push(Command::Disconnect(handle.clone()));
        }
        commands.push(Command::ResumeScan);
        commands
    }

    fn radio_state_changed(&self, state: RadioState) {
        info!("Radio state changed to {}", state);
        self.pipeline.delegate().on_radio_state_changed(state);

        if state.is_powered_on() {
            return;
        }
        let was_running = self.session.lock().running;
        if was_running {
            self.stop();
            let error = LinkError::Scan(ScanError::InvalidRadioState(state));
            warn!("Scan session failed: {}", error);
            self.pipeline.delegate().on_session_failed(&error);
        }
    }

    /// Move any peer out of discovery after a refused follow-up request
    fn abandon(&self, handle: &PeerHandle, error: RadioError) -> Vec<Command> {
        let Some(record) = self.table.get(handle) else {
            return Vec::new();
        };
        let mut record = record.lock();
        if !record.state.is_active() {
            return Vec::new();
        }
        warn!("Abandoning {} during {}: {}", handle, record.state, error);
        record.state = ConnectionState::Closed(CloseReason::ReadFailed(error.to_string()));
        vec![Command::Disconnect(handle.clone()), Command::ResumeScan]
    }

    fn schedule_peer_timer(&self, key: ScanTimer, handle: PeerHandle) {
        let mut session = self.session.lock();
        if !session.running {
            return;
        }
        let epoch = session.epoch;
        let this = self.this.clone();
        match key {
            ScanTimer::QuickRetry(_) => {
                session
                    .timers
                    .schedule(key, self.config.quick_retry_delay(), move |token| {
                        if let Some(inner) = this.upgrade() {
                            inner.quick_retry_fired(handle, epoch, token);
                        }
                    });
            }
            ScanTimer::ConnectTimeout(_) => {
                session
                    .timers
                    .schedule(key, self.config.connect_timeout(), move |token| {
                        if let Some(inner) = this.upgrade() {
                            inner.connect_timeout_fired(handle, epoch, token);
                        }
                    });
            }
            ScanTimer::Restart | ScanTimer::Fallback => {}
        }
    }

    fn pause_scan(&self) {
        if !self.config.pause_scan_while_connecting {
            return;
        }
        {
            let mut session = self.session.lock();
            if !session.running || !session.scanning {
                return;
            }
            session.scanning = false;
            session.paused = true;
        }
        self.radio.stop_scan();
        trace!("Scan paused for connection setup");
    }

    fn resume_scan(&self) {
        let (epoch, filter) = {
            let mut session = self.session.lock();
            if !session.running || !session.paused {
                return;
            }
            if self.table.attempting_count() > 0
                || self.table.active_count() >= self.policy.max_concurrent
            {
                return;
            }
            session.paused = false;
            session.scanning = true;
            (session.epoch, self.filter_for(session.mode))
        };

        match self.radio.start_scan(filter) {
            Ok(()) => trace!("Scan resumed ({:?})", filter),
            Err(e) => self.scan_refused(epoch, e),
        }
    }

    fn run(&self, commands: Vec<Command>) {
        let mut queue: VecDeque<Command> = commands.into();
        while let Some(command) = queue.pop_front() {
            let follow_up = match command {
                Command::Connect(handle) => {
                    self.schedule_peer_timer(ScanTimer::ConnectTimeout(handle.clone()), handle.clone());
                    match self.radio.connect(&handle) {
                        Ok(()) => Vec::new(),
                        Err(e) => self.connect_failed(&handle, ConnectFailure::RequestFailed(e.to_string())),
                    }
                }
                Command::Disconnect(handle) => {
                    self.radio.disconnect(&handle);
                    Vec::new()
                }
                Command::DiscoverServices(handle) => match self.radio.discover_services(&handle) {
                    Ok(()) => Vec::new(),
                    Err(e) => self.abandon(&handle, e),
                },
                Command::DiscoverCharacteristics(handle) => match self
                    .radio
                    .discover_characteristics(&handle, self.config.service_uuid)
                {
                    Ok(()) => Vec::new(),
                    Err(e) => self.abandon(&handle, e),
                },
                Command::ReadPayload(handle) => match self
                    .radio
                    .read_characteristic(&handle, self.config.discovery_characteristic_uuid)
                {
                    Ok(()) => Vec::new(),
                    Err(e) => self.abandon(&handle, e),
                },
                Command::Deliver(handle, bytes) => {
                    match self.pipeline.process(&handle, &bytes) {
                        Ok(_) => {
                            // Only a decoded identity refills the override budget
                            if let Some(record) = self.table.get(&handle) {
                                record.lock().override_count = 0;
                            }
                        }
                        Err(e) => debug!("Payload from {} dropped: {}", handle, e),
                    }
                    Vec::new()
                }
                Command::ScheduleRetry(handle) => {
                    self.schedule_peer_timer(ScanTimer::QuickRetry(handle.clone()), handle);
                    Vec::new()
                }
                Command::CancelConnectTimeout(handle) => {
                    self.session
                        .lock()
                        .timers
                        .cancel(&ScanTimer::ConnectTimeout(handle));
                    Vec::new()
                }
                Command::CancelPeerTimers(handle) => {
                    let mut session = self.session.lock();
                    session.timers.cancel(&ScanTimer::ConnectTimeout(handle.clone()));
                    session.timers.cancel(&ScanTimer::QuickRetry(handle));
                    Vec::new()
                }
                Command::PauseScan => {
                    self.pause_scan();
                    Vec::new()
                }
                Command::ResumeScan => {
                    self.resume_scan();
                    Vec::new()
                }
            };
            queue.extend(follow_up);
        }
    }
}
