// Simulated radio stack shared by the integration tests
//
// Records every request and never calls back on its own; tests play the
// platform and feed completion events into the controllers. An optional hook
// runs after each request is recorded, from inside the request, to model
// stacks that answer synchronously.
#![allow(dead_code)]

use nearlink_core::ble::{
    AdvertisementDescriptor, ChannelRequestId, PeerHandle, RadioError, RadioStack, RadioState,
    ReadRequestId, ScanFilter, ServiceDescriptor,
};
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCall {
    StartScan(ScanFilter),
    StopScan,
    Connect(PeerHandle),
    Disconnect(PeerHandle),
    DiscoverServices(PeerHandle),
    DiscoverCharacteristics(PeerHandle, Uuid),
    ReadCharacteristic(PeerHandle, Uuid),
    OpenChannel(ChannelRequestId, PeerHandle, u16),
    PublishChannel,
    UnpublishChannel(u16),
    AddService(ServiceDescriptor),
    RemoveServices,
    StartAdvertising(AdvertisementDescriptor),
    StopAdvertising,
    RespondToRead(ReadRequestId, Vec<u8>),
}

type Hook = Arc<dyn Fn(&RadioCall) + Send + Sync>;

pub struct SimRadio {
    state: Mutex<RadioState>,
    calls: Mutex<Vec<RadioCall>>,
    hook: Mutex<Option<Hook>>,
}

impl SimRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RadioState::PoweredOn),
            calls: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
        })
    }

    pub fn set_hook<F>(&self, hook: F)
    where
        F: Fn(&RadioCall) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    pub fn set_state(&self, state: RadioState) {
        *self.state.lock() = state;
    }

    pub fn calls(&self) -> Vec<RadioCall> {
        self.calls.lock().clone()
    }

    pub fn count<F: Fn(&RadioCall) -> bool>(&self, predicate: F) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    pub fn connects_to(&self, peer: &PeerHandle) -> usize {
        self.count(|call| *call == RadioCall::Connect(peer.clone()))
    }

    pub fn channel_requests(&self) -> Vec<ChannelRequestId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RadioCall::OpenChannel(request, _, _) => Some(*request),
                _ => None,
            })
            .collect()
    }

    pub fn read_responses(&self) -> Vec<(ReadRequestId, Vec<u8>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RadioCall::RespondToRead(request, value) => Some((*request, value.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RadioCall) {
        self.calls.lock().push(call.clone());
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(&call);
        }
    }
}

impl RadioStack for SimRadio {
    fn state(&self) -> RadioState {
        *self.state.lock()
    }

    fn start_scan(&self, filter: ScanFilter) -> Result<(), RadioError> {
        self.record(RadioCall::StartScan(filter));
        Ok(())
    }

    fn stop_scan(&self) {
        self.record(RadioCall::StopScan);
    }

    fn connect(&self, peer: &PeerHandle) -> Result<(), RadioError> {
        self.record(RadioCall::Connect(peer.clone()));
        Ok(())
    }

    fn disconnect(&self, peer: &PeerHandle) {
        self.record(RadioCall::Disconnect(peer.clone()));
    }

    fn discover_services(&self, peer: &PeerHandle) -> Result<(), RadioError> {
        self.record(RadioCall::DiscoverServices(peer.clone()));
        Ok(())
    }

    fn discover_characteristics(&self, peer: &PeerHandle, service: Uuid) -> Result<(), RadioError> {
        self.record(RadioCall::DiscoverCharacteristics(peer.clone(), service));
        Ok(())
    }

    fn read_characteristic(&self, peer: &PeerHandle, characteristic: Uuid) -> Result<(), RadioError> {
        self.record(RadioCall::ReadCharacteristic(peer.clone(), characteristic));
        Ok(())
    }

    fn open_channel(
        &self,
        request: ChannelRequestId,
        peer: &PeerHandle,
        psm: u16,
    ) -> Result<(), RadioError> {
        self.record(RadioCall::OpenChannel(request, peer.clone(), psm));
        Ok(())
    }

    fn publish_channel(&self) -> Result<(), RadioError> {
        self.record(RadioCall::PublishChannel);
        Ok(())
    }

    fn unpublish_channel(&self, psm: u16) {
        self.record(RadioCall::UnpublishChannel(psm));
    }

    fn add_service(&self, descriptor: &ServiceDescriptor) -> Result<(), RadioError> {
        self.record(RadioCall::AddService(descriptor.clone()));
        Ok(())
    }

    fn remove_services(&self) {
        self.record(RadioCall::RemoveServices);
    }

    fn start_advertising(&self, descriptor: &AdvertisementDescriptor) -> Result<(), RadioError> {
        self.record(RadioCall::StartAdvertising(descriptor.clone()));
        Ok(())
    }

    fn stop_advertising(&self) {
        self.record(RadioCall::StopAdvertising);
    }

    fn respond_to_read(&self, request: ReadRequestId, value: Vec<u8>) -> Result<(), RadioError> {
        self.record(RadioCall::RespondToRead(request, value));
        Ok(())
    }
}

pub fn peer(n: u8) -> PeerHandle {
    PeerHandle::Address([0xC0, 0xFF, 0xEE, 0x00, 0x00, n])
}
