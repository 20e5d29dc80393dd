/// GATT layout of the discovery service
///
/// One primary service carrying a single readable discovery characteristic.
/// The identity payload served from it must fit in one characteristic read.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discovery service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x68D6_0EB2_8AAA_4D72_8851_BD6D_64E1_69B7);

/// Readable characteristic carrying the identity payload
pub const DISCOVERY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0BEB_F3FE_9A5E_4ED1_8157_7628_1B3F_0DA5);

/// Maximum GATT attribute value size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Access level required to read the discovery characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtectionLevel {
    Plain,
    EncryptionRequired,
}

/// Service registration handed to the radio before advertising
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Primary service identifier
    pub service: Uuid,
    /// Read-only discovery characteristic
    pub characteristic: Uuid,
    /// Read protection for the characteristic
    pub read_protection: ProtectionLevel,
    /// Channel identifier (PSM) of the published byte-stream channel
    pub psm: u16,
}

impl ServiceDescriptor {
    pub fn new(service: Uuid, characteristic: Uuid, psm: u16) -> Self {
        Self {
            service,
            characteristic,
            read_protection: ProtectionLevel::Plain,
            psm,
        }
    }
}

/// Advertisement parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementDescriptor {
    /// Service identifier placed in the advertisement
    pub service: Uuid,
    /// Optional local name
    pub local_name: Option<String>,
    pub connectable: bool,
    pub discoverable: bool,
}

impl AdvertisementDescriptor {
    pub fn new(service: Uuid, local_name: Option<String>) -> Self {
        Self {
            service,
            local_name,
            connectable: true,
            discoverable: true,
        }
    }
}

/// Whether a payload can be served in a single characteristic read
pub fn fits_characteristic(payload: &[u8]) -> bool {
    payload.len() <= MAX_CHARACTERISTIC_SIZE
}
