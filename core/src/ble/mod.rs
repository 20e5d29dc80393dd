/// BLE connection lifecycle
///
/// Platform code (Swift/Kotlin/BlueZ glue) owns the radio and forwards its
/// callbacks here as events. This module holds everything that decides what
/// to do with them:
///
/// - **radio**: the radio stack seam and the types crossing it
/// - **gatt**: discovery service layout
/// - **timer**: cancellable controller timers
/// - **admission**: per-peer records and the admission policy
/// - **scanner**: central-role scan and connect lifecycle
/// - **advertiser**: peripheral-role advertising lifecycle
/// - **channel**: blocking byte-stream adapter over promoted connections

pub mod admission;
pub mod advertiser;
pub mod channel;
pub mod gatt;
pub mod radio;
pub mod scanner;
pub mod timer;

pub use admission::{
    Admission, AdmissionDecision, AdmissionPolicy, CloseReason, ConnectionState, PeerRecord,
    PeerTable,
};
pub use advertiser::{
    AdvertiseController, AdvertiseError, AdvertiseEvent, AdvertiseObserver, AdvertisePhase,
};
pub use channel::{
    loopback_pair, ByteStreamChannel, ChannelBroker, ChannelCloser, ChannelError, LoopbackStream,
    RawStream, Readiness,
};
pub use gatt::{
    AdvertisementDescriptor, ProtectionLevel, ServiceDescriptor, DISCOVERY_CHARACTERISTIC_UUID,
    MAX_CHARACTERISTIC_SIZE, SERVICE_UUID,
};
pub use radio::{
    ChannelRequestId, ConnectFailure, PeerHandle, RadioError, RadioStack, RadioState,
    ReadRequestId, ScanFilter,
};
pub use scanner::{ScanController, ScanError, ScanEvent, ScanMode};
pub use timer::{TimerHandle, TimerSet, TimerToken};
