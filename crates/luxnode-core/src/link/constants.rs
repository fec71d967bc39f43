//! GATT constants shared by all families.

use uuid::Uuid;

// Status codes reported in link events
pub const GATT_SUCCESS: u8 = 0x00;
pub const GATT_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;
pub const GATT_CONN_TIMEOUT: u8 = 0x08;
pub const GATT_CONN_TERMINATE_PEER_USER: u8 = 0x13;
pub const GATT_CONN_TERMINATE_LOCAL_HOST: u8 = 0x16;
pub const GATT_ERROR: u8 = 0x85; // 133, the generic link failure

/// Client Characteristic Configuration descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Generic Attribute "Service Changed" characteristic.
pub const SERVICE_CHANGED_UUID: Uuid = Uuid::from_u128(0x00002a05_0000_1000_8000_00805f9b34fb);

// CCCD payloads
pub const CCCD_ENABLE_NOTIFICATION: [u8; 2] = [0x01, 0x00];
pub const CCCD_ENABLE_INDICATION: [u8; 2] = [0x02, 0x00];
pub const CCCD_DISABLE: [u8; 2] = [0x00, 0x00];

/// Maximum concurrent link handles the platform grants.
pub const MAX_LINK_HANDLES: usize = 32;
