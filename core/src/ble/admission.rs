/// Connection admission control
///
/// Decides, per sighting, whether a peer may be connected to right now. The
/// policy itself is a pure function of a peer record, the number of active
/// connections and the current instant. [`PeerTable`] owns the records and
/// applies decisions so that the capacity check and the transition into
/// `Attempting` happen under one write lock.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::radio::{ConnectFailure, PeerHandle};
use crate::config::ScanConfig;

/// Why a peer connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Final connect failure after retries (or a non-transient one)
    ConnectFailed(ConnectFailure),
    /// Connected peer does not expose the discovery service
    ServiceNotFound,
    /// Discovery service lacks the discovery characteristic
    CharacteristicNotFound,
    /// The characteristic read failed or the radio refused a follow-up request
    ReadFailed(String),
    /// Link dropped after connecting
    Disconnected,
    /// Payload was read and handed to the discovery pipeline
    Completed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectFailed(failure) => write!(f, "connect failed ({})", failure),
            CloseReason::ServiceNotFound => write!(f, "service not found"),
            CloseReason::CharacteristicNotFound => write!(f, "characteristic not found"),
            CloseReason::ReadFailed(reason) => write!(f, "read failed ({})", reason),
            CloseReason::Disconnected => write!(f, "disconnected"),
            CloseReason::Completed => write!(f, "completed"),
        }
    }
}

/// Per-peer connection lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Sighted, no attempt in flight
    Idle,
    Attempting,
    Connected,
    DiscoveringServices,
    DiscoveringCharacteristics,
    ReadingPayload,
    /// Work finished, waiting for the link to go down
    Draining,
    Closed(CloseReason),
}

impl ConnectionState {
    /// States that occupy a slot under the connection ceiling
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Attempting
                | ConnectionState::Connected
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
                | ConnectionState::ReadingPayload
        )
    }

    /// A connect request is outstanding
    pub fn is_attempting(&self) -> bool {
        *self == ConnectionState::Attempting
    }

    /// Link is up (or being used) and may be torn down
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::DiscoveringServices
                | ConnectionState::DiscoveringCharacteristics
                | ConnectionState::ReadingPayload
                | ConnectionState::Draining
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Attempting => write!(f, "Attempting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::DiscoveringServices => write!(f, "DiscoveringServices"),
            ConnectionState::DiscoveringCharacteristics => {
                write!(f, "DiscoveringCharacteristics")
            }
            ConnectionState::ReadingPayload => write!(f, "ReadingPayload"),
            ConnectionState::Draining => write!(f, "Draining"),
            ConnectionState::Closed(reason) => write!(f, "Closed({})", reason),
        }
    }
}

/// Per-peer bookkeeping
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub handle: PeerHandle,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub last_connect_attempt: Option<Instant>,
    /// Sightings refused due to cooldown since the last override
    pub skip_count: u32,
    /// Quick retries spent on the current attempt
    pub retry_count: u32,
    /// Cooldown overrides granted since the last successful read
    pub override_count: u32,
    pub state: ConnectionState,
}

impl PeerRecord {
    pub fn new(handle: PeerHandle, now: Instant) -> Self {
        Self {
            handle,
            first_seen: now,
            last_seen: now,
            last_connect_attempt: None,
            skip_count: 0,
            retry_count: 0,
            override_count: 0,
            state: ConnectionState::Idle,
        }
    }

    /// Whether a fresh attempt would still fall inside the cooldown window
    pub fn in_cooldown(&self, cooldown: Duration, now: Instant) -> bool {
        self.last_connect_attempt
            .map(|last| now.saturating_duration_since(last) < cooldown)
            .unwrap_or(false)
    }
}

/// Admission outcome for one sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    SkipCooldown,
    SkipCeiling,
}

/// Decision plus the skip bookkeeping it implies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub verdict: Admission,
    /// Skip count the record should carry afterwards
    pub skip_count: u32,
    /// The attempt goes ahead despite the cooldown
    pub cooldown_override: bool,
}

/// Pure admission policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_concurrent: usize,
    pub cooldown: Duration,
    pub skip_threshold: u32,
    /// Overrides allowed before a successful read; `None` means unbounded
    pub max_cooldown_overrides: Option<u32>,
}

impl AdmissionPolicy {
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_connections,
            cooldown: config.cooldown(),
            skip_threshold: config.skip_threshold,
            max_cooldown_overrides: config.max_cooldown_overrides,
        }
    }

    /// Evaluate one sighting of `record` with `active` slots in use
    ///
    /// Cooldown is checked first. A sighting inside the cooldown window bumps
    /// the skip count; reaching the threshold overrides the cooldown once and
    /// resets the count. The ceiling check comes second and never charges a
    /// skip. If the ceiling blocks an overriding sighting, the count stays at
    /// the threshold so the override is not lost.
    pub fn evaluate(&self, record: &PeerRecord, active: usize, now: Instant) -> AdmissionDecision {
        let mut skip_count = record.skip_count;
        let mut cooldown_override = false;

        if record.in_cooldown(self.cooldown, now) {
            skip_count = record.skip_count.saturating_add(1);
            let overrides_left = self
                .max_cooldown_overrides
                .map(|max| record.override_count < max)
                .unwrap_or(true);

            if skip_count < self.skip_threshold || !overrides_left {
                return AdmissionDecision {
                    verdict: Admission::SkipCooldown,
                    skip_count,
                    cooldown_override: false,
                };
            }
            cooldown_override = true;
        }

        if active >= self.max_concurrent {
            return AdmissionDecision {
                verdict: Admission::SkipCeiling,
                skip_count: if cooldown_override {
                    self.skip_threshold
                } else {
                    record.skip_count
                },
                cooldown_override: false,
            };
        }

        AdmissionDecision {
            verdict: Admission::Admit,
            skip_count: if cooldown_override { 0 } else { skip_count },
            cooldown_override,
        }
    }
}

/// Result of presenting a sighting to the table
#[derive(Debug, Clone)]
pub struct SightingOutcome {
    pub decision: AdmissionDecision,
    /// The record was created by this sighting
    pub first_sighting: bool,
    /// State before the sighting was evaluated
    pub previous_state: ConnectionState,
}

/// Peer records keyed by handle
///
/// Active and attempting counts are derived from the records themselves, so
/// they cannot drift from the per-peer states. Lock order: table, then peer.
/// Nothing may take the table lock while holding a peer lock.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: RwLock<HashMap<PeerHandle, Arc<Mutex<PeerRecord>>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn count_where<F>(records: &HashMap<PeerHandle, Arc<Mutex<PeerRecord>>>, predicate: F) -> usize
    where
        F: Fn(&ConnectionState) -> bool,
    {
        records
            .values()
            .filter(|record| predicate(&record.lock().state))
            .count()
    }

    /// Record a sighting and decide on admission atomically
    ///
    /// Peers already working (any active state or `Draining`) are left alone
    /// and reported as `SkipCeiling` without touching their counters.
    pub fn admit(
        &self,
        handle: &PeerHandle,
        policy: &AdmissionPolicy,
        now: Instant,
    ) -> SightingOutcome {
        let mut records = self.records.write();
        let active = Self::count_where(&records, ConnectionState::is_active);

        let mut first_sighting = false;
        let entry = records
            .entry(handle.clone())
            .or_insert_with(|| {
                first_sighting = true;
                Arc::new(Mutex::new(PeerRecord::new(handle.clone(), now)))
            })
            .clone();

        let mut record = entry.lock();
        record.last_seen = now;
        let previous_state = record.state.clone();

        if record.state.is_active() || record.state == ConnectionState::Draining {
            trace!("Peer {} already {}, sighting ignored", handle, record.state);
            return SightingOutcome {
                decision: AdmissionDecision {
                    verdict: Admission::SkipCeiling,
                    skip_count: record.skip_count,
                    cooldown_override: false,
                },
                first_sighting,
                previous_state,
            };
        }

        let decision = policy.evaluate(&record, active, now);
        record.skip_count = decision.skip_count;

        if decision.verdict == Admission::Admit {
            record.last_connect_attempt = Some(now);
            record.retry_count = 0;
            record.state = ConnectionState::Attempting;
            if decision.cooldown_override {
                record.override_count = record.override_count.saturating_add(1);
            }
            debug!(
                "Admitted {} ({} of {} slots in use{})",
                handle,
                active + 1,
                policy.max_concurrent,
                if decision.cooldown_override {
                    ", cooldown override"
                } else {
                    ""
                }
            );
        }

        SightingOutcome {
            decision,
            first_sighting,
            previous_state,
        }
    }

    pub fn get(&self, handle: &PeerHandle) -> Option<Arc<Mutex<PeerRecord>>> {
        self.records.read().get(handle).cloned()
    }

    pub fn contains(&self, handle: &PeerHandle) -> bool {
        self.records.read().contains_key(handle)
    }

    /// Copy of a record
    pub fn snapshot(&self, handle: &PeerHandle) -> Option<PeerRecord> {
        self.get(handle).map(|record| record.lock().clone())
    }

    pub fn state_of(&self, handle: &PeerHandle) -> Option<ConnectionState> {
        self.get(handle).map(|record| record.lock().state.clone())
    }

    /// Drop a peer's record entirely, history included
    pub fn evict(&self, handle: &PeerHandle) -> Option<PeerRecord> {
        let removed = self.records.write().remove(handle);
        removed.map(|record| record.lock().clone())
    }

    /// Drop every record, returning the handles the radio may still hold
    /// (outstanding connects and live links)
    pub fn clear(&self) -> Vec<PeerHandle> {
        let drained: Vec<_> = self.records.write().drain().collect();
        drained
            .into_iter()
            .filter(|(_, record)| {
                let state = &record.lock().state;
                state.is_active() || state.is_linked()
            })
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Peers occupying a slot under the ceiling
    pub fn active_count(&self) -> usize {
        Self::count_where(&self.records.read(), ConnectionState::is_active)
    }

    /// Peers with a connect request outstanding
    pub fn attempting_count(&self) -> usize {
        Self::count_where(&self.records.read(), ConnectionState::is_attempting)
    }

    pub fn handles(&self) -> Vec<PeerHandle> {
        self.records.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
