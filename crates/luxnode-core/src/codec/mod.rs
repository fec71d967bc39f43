//! Per-family codecs.
//!
//! Each family translates the generic characteristic model into its own
//! attribute ids and byte layout. Writes are always confirmed: either the
//! write operation reads the value back itself, or, for reliable-write
//! transactions, every member is read back once the transaction commits.

pub mod bdc;
pub mod d4i;
pub mod wire;
pub mod zsc010;

pub use bdc::Bdc;
pub use d4i::D4i;
pub use wire::WireError;
pub use zsc010::Zsc010;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::auth::CredentialService;
use crate::coordinator::Connection;
use crate::model::{
    DaliBank, Dali, Device, DeviceFamily, Diagnostics, Dim, General, Gps, Time,
};
use crate::operation::{
    Connect, Disconnect, DiscoverServices, GattErrorKind, OperationError, ReadCharacteristic,
    WriteCharacteristic,
};

/// Capability set of one controller family.
///
/// Reads return `Ok(None)` for groups the family does not carry. Writes of
/// unsupported groups fail with `PreconditionFailed`.
#[async_trait]
pub trait FamilyCodec: Send + Sync {
    fn family(&self) -> DeviceFamily;

    /// Family-specific connect sequence, run once per retry attempt.
    async fn connect(&self, conn: &Connection) -> Result<(), OperationError>;

    async fn disconnect(&self, conn: &Connection) -> Result<(), OperationError> {
        conn.perform(Disconnect).await
    }

    async fn read_general(&self, conn: &Connection) -> Result<Option<General>, OperationError>;

    async fn read_dim(&self, conn: &Connection) -> Result<Option<Dim>, OperationError>;

    async fn read_dali(&self, conn: &Connection) -> Result<Option<Dali>, OperationError>;

    async fn read_time(&self, conn: &Connection) -> Result<Option<Time>, OperationError>;

    async fn read_gps(&self, _conn: &Connection) -> Result<Option<Gps>, OperationError> {
        Ok(None)
    }

    async fn read_diagnostics(
        &self,
        conn: &Connection,
    ) -> Result<Option<Diagnostics>, OperationError>;

    /// Memory banks this family exposes.
    fn dali_banks(&self) -> &'static [u8] {
        &[]
    }

    async fn read_dali_bank(
        &self,
        _conn: &Connection,
        _bank: u8,
    ) -> Result<Option<DaliBank>, OperationError> {
        Ok(None)
    }

    async fn write_general(&self, _conn: &Connection, _value: &General) -> Result<(), OperationError> {
        Err(unsupported("write-general"))
    }

    async fn write_dim(&self, _conn: &Connection, _value: &Dim) -> Result<(), OperationError> {
        Err(unsupported("write-dim"))
    }

    async fn write_dali(&self, _conn: &Connection, _value: &Dali) -> Result<(), OperationError> {
        Err(unsupported("write-dali"))
    }

    async fn write_time(&self, _conn: &Connection, _value: &Time) -> Result<(), OperationError> {
        Err(unsupported("write-time"))
    }
}

/// Pick the codec for a device.
pub fn codec_for(
    device: &Device,
    credentials: Option<Arc<dyn CredentialService>>,
) -> Arc<dyn FamilyCodec> {
    match device.family {
        DeviceFamily::Bdc => Arc::new(Bdc::new(device.id, credentials)),
        DeviceFamily::Zsc010 => Arc::new(Zsc010::new(device)),
        DeviceFamily::D4i => Arc::new(D4i),
    }
}

fn unsupported(operation: &str) -> OperationError {
    OperationError::gatt(
        GattErrorKind::PreconditionFailed("not supported by this family".into()),
        operation,
    )
}

/// Plain connect: open the link and populate the service table.
pub(crate) async fn connect_and_discover(conn: &Connection) -> Result<(), OperationError> {
    conn.perform(Connect).await?;
    conn.perform(DiscoverServices).await
}

pub(crate) async fn read(conn: &Connection, uuid: Uuid) -> Result<Vec<u8>, OperationError> {
    conn.perform(ReadCharacteristic::new(uuid)).await
}

/// Tag a decode failure with the operation it belongs to.
pub(crate) fn decoded<T>(operation: &str, result: Result<T, WireError>) -> Result<T, OperationError> {
    result.map_err(|e| OperationError::gatt(e.into(), operation))
}

/// Single write confirmed by read-back.
pub(crate) async fn write(conn: &Connection, uuid: Uuid, value: Vec<u8>) -> Result<(), OperationError> {
    conn.perform(WriteCharacteristic::new(uuid, value)).await
}

/// Member of a reliable-write transaction.
#[derive(Debug, Clone)]
pub(crate) struct StagedWrite {
    uuid: Uuid,
    value: Vec<u8>,
    readback: Vec<u8>,
}

impl StagedWrite {
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self {
            uuid,
            readback: value.clone(),
            value,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// The node stores the value in a different byte order than written.
    pub fn reads_back_as(mut self, readback: Vec<u8>) -> Self {
        self.readback = readback;
        self
    }
}

/// Run one reliable-write transaction, then read every member back.
pub(crate) async fn write_transaction(
    conn: &Connection,
    writes: Vec<StagedWrite>,
) -> Result<(), OperationError> {
    let ops = writes
        .iter()
        .map(|w| WriteCharacteristic::queued(w.uuid, w.value.clone()))
        .collect();
    conn.write_transaction(ops).await?;

    for w in writes {
        let actual = read(conn, w.uuid).await?;
        if actual != w.readback {
            tracing::debug!(
                uuid = %w.uuid,
                expected = ?w.readback,
                actual = ?actual,
                "Transaction read-back mismatch"
            );
            return Err(OperationError::gatt(
                GattErrorKind::WriteValueMismatch,
                format!("confirm:{}", w.uuid),
            ));
        }
    }
    Ok(())
}
