//! luxnode-core: GATT coordination for streetlight controller nodes.
//!
//! This crate connects to lamp controllers over a remote-attribute radio
//! link, reads and writes their configuration through a family-neutral
//! model, authenticates the families that require it and reads DALI
//! diagnostic memory banks.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Link**: Transport abstraction over the radio (btleplug, mock)
//! - **Operation**: One request/response exchange as a small state machine
//! - **Coordinator**: Connection lifecycle, serialized operations, snapshot
//! - **Codec**: Per-family attribute ids and byte layouts
//! - **Auth**: AES-CMAC mutual authentication
//! - **Membank**: DALI memory-bank reader
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use luxnode_core::{
//!     AlwaysGranted, BtleLinkFactory, Coordinator, CoordinatorConfig, Device, DeviceFamily,
//!     TracingObserver,
//! };
//! use uuid::Uuid;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let coordinator = Coordinator::new(
//!     Arc::new(BtleLinkFactory::first_adapter().await?),
//!     Arc::new(AlwaysGranted),
//!     Arc::new(TracingObserver),
//!     CoordinatorConfig::default(),
//! );
//! let device = Device::new(Uuid::from_u128(1), "C4:7F:51:0A:1B:2C", DeviceFamily::D4i);
//! if coordinator.connect(device, None).await {
//!     let chars = coordinator.read_characteristics(None, None).await;
//!     println!("{chars:?}");
//! }
//! coordinator.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod link;
pub mod membank;
pub mod model;
pub mod operation;
pub mod permission;

// Re-exports for convenience
pub use auth::{AuthError, CredentialService, LocalCredentialService, ServiceError};
pub use codec::{FamilyCodec, WireError, codec_for};
pub use config::CoordinatorConfig;
pub use coordinator::{ConnectionState, ConnectionStatus, Coordinator};
pub use events::{LogLevel, NodeEvent, NodeObserver, NullObserver, TracingObserver};
pub use link::{BtleLinkFactory, LinkFactory, LinkTransport, MockLinkFactory, MockNode};
pub use model::{
    BankValue, DaliBanks, Device, DeviceCharacteristics, DeviceFamily, Dim, DimStep, General,
    OperatingMode,
};
pub use operation::{GattError, GattErrorKind, Operation, OperationError};
pub use permission::{AlwaysGranted, PermissionProvider};
