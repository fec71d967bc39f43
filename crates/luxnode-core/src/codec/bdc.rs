//! Bdc family: authenticated, fixed attribute ids, little-endian fields.
//!
//! Configuration characteristics stay hidden until the handshake in
//! [`crate::auth`] succeeds. Dim steps come back from the node in reverse
//! write order.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt};
use uuid::Uuid;

use super::wire::{self, WireError};
use super::{FamilyCodec, StagedWrite, decoded, read, write, write_transaction};
use crate::auth::{self, AuthError, CredentialService};
use crate::coordinator::Connection;
use crate::model::{Dali, DeviceFamily, Diagnostics, Dim, DimStep, General, Gps, OperatingMode, Time};
use crate::operation::{Connect, OperationError};

pub mod uuids {
    use uuid::Uuid;

    const fn bdc(short: u16) -> Uuid {
        Uuid::from_u128(0x0000_0000_8d3e_4b6a_b2c5_7f10_0e3a_41d2 | ((short as u128) << 96))
    }

    pub const MODE: Uuid = bdc(0x1001);
    pub const PRESET: Uuid = bdc(0x1002);
    pub const LEVEL: Uuid = bdc(0x1003);
    pub const STEPS: Uuid = bdc(0x1004);
    pub const DALI_CONFIG: Uuid = bdc(0x1010);
    pub const POWER_LEVELS: Uuid = bdc(0x1011);
    pub const FIXTURE_NAME: Uuid = bdc(0x1012);
    pub const TIME: Uuid = bdc(0x1020);
    pub const GPS: Uuid = bdc(0x1021);
    pub const DIAGNOSTICS: Uuid = bdc(0x1030);
    pub const AUTH: Uuid = bdc(0x1040);
    pub const IDENTIFY: Uuid = bdc(0x1041);
}

/// Written to the identify characteristic to blink the lamp.
pub const IDENTIFY_BLINK: u8 = 0x01;

const MAX_STEPS: usize = 5;
const FIXTURE_NAME_LEN: usize = 20;
const DIAGNOSTICS_LEN: usize = 9;
const GPS_LEN: usize = 8;
const GPS_SCALE: f64 = 1e7;
/// Bytes one reliable-write transaction may carry.
const TRANSACTION_BUDGET: usize = 40;

/// Records in write order; the node reverses them when storing.
pub fn encode_steps(steps: &[DimStep]) -> Result<Vec<u8>, WireError> {
    wire::encode_steps(steps, MAX_STEPS, |l| l)
}

/// What the node holds after storing `encode_steps(steps)`.
pub fn stored_steps(encoded: &[u8]) -> Vec<u8> {
    encoded.chunks_exact(3).rev().flatten().copied().collect()
}

pub fn decode_steps(data: &[u8]) -> Result<Vec<DimStep>, WireError> {
    if data.len() % 3 != 0 {
        return Err(WireError::Truncated {
            needed: data.len().next_multiple_of(3),
            got: data.len(),
        });
    }
    if data.len() / 3 > MAX_STEPS {
        return Err(WireError::TooManySteps {
            count: data.len() / 3,
            max: MAX_STEPS,
        });
    }
    let mut steps = wire::decode_steps(data, |l| l);
    steps.reverse();
    Ok(steps)
}

pub fn decode_gps(data: &[u8]) -> Result<Option<Gps>, WireError> {
    wire::require(data, GPS_LEN)?;
    let mut cursor = Cursor::new(data);
    let lat = cursor.read_i32::<LittleEndian>()?;
    let lon = cursor.read_i32::<LittleEndian>()?;
    if lat == i32::MAX || lon == i32::MAX {
        return Ok(None);
    }
    Ok(Some(Gps {
        latitude: f64::from(lat) / GPS_SCALE,
        longitude: f64::from(lon) / GPS_SCALE,
    }))
}

pub fn decode_diagnostics(data: &[u8]) -> Result<Diagnostics, WireError> {
    wire::require(data, DIAGNOSTICS_LEN)?;
    let mut cursor = Cursor::new(data);
    let status = cursor.read_u32::<LittleEndian>()?;
    Ok(Diagnostics {
        status,
        firmware_version: wire::version(&data[4..7]),
        library_version: wire::version(&data[7..9]),
        ..Default::default()
    })
}

/// Members of one transaction; their summed payload must fit the node's queue.
fn transaction(
    operation: &str,
    writes: Vec<StagedWrite>,
) -> Result<Vec<StagedWrite>, OperationError> {
    let total: usize = writes.iter().map(StagedWrite::len).sum();
    if total > TRANSACTION_BUDGET {
        return Err(OperationError::gatt(
            WireError::OutOfRange {
                field: "transaction",
                value: total as i64,
            }
            .into(),
            operation,
        ));
    }
    Ok(writes)
}

/// Codec for Bdc controllers.
pub struct Bdc {
    device_id: Uuid,
    credentials: Option<Arc<dyn CredentialService>>,
}

impl Bdc {
    pub fn new(device_id: Uuid, credentials: Option<Arc<dyn CredentialService>>) -> Self {
        Self {
            device_id,
            credentials,
        }
    }
}

#[async_trait]
impl FamilyCodec for Bdc {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Bdc
    }

    async fn connect(&self, conn: &Connection) -> Result<(), OperationError> {
        let Some(service) = &self.credentials else {
            return Err(AuthError::NoCredentials.into());
        };
        conn.perform(Connect).await?;
        auth::authenticate(conn, self.device_id, service.as_ref()).await
    }

    async fn read_general(&self, conn: &Connection) -> Result<Option<General>, OperationError> {
        let data = read(conn, uuids::MODE).await?;
        decoded("read-general", wire::require(&data, 1))?;
        Ok(Some(General {
            mode: OperatingMode::from(data[0]),
        }))
    }

    async fn read_dim(&self, conn: &Connection) -> Result<Option<Dim>, OperationError> {
        let preset = read(conn, uuids::PRESET).await?;
        let steps = read(conn, uuids::STEPS).await?;
        let level = read(conn, uuids::LEVEL).await?;
        Ok(Some(Dim {
            preset: preset.first().copied().and_then(wire::optional_u8),
            steps: decoded("read-dim", decode_steps(&steps))?,
            level: level.first().copied().and_then(wire::optional_u8),
            schedule: None,
        }))
    }

    async fn read_dali(&self, conn: &Connection) -> Result<Option<Dali>, OperationError> {
        let config = read(conn, uuids::DALI_CONFIG).await?;
        let levels = read(conn, uuids::POWER_LEVELS).await?;
        let name = read(conn, uuids::FIXTURE_NAME).await?;
        let dali = decoded("read-dali", wire::decode_dali_config::<LittleEndian>(&config))?;
        Ok(Some(Dali {
            available_power_levels: wire::decode_u16_list::<LittleEndian>(&levels),
            fixture_name: wire::ascii(&name),
            ..dali
        }))
    }

    async fn read_time(&self, conn: &Connection) -> Result<Option<Time>, OperationError> {
        let data = read(conn, uuids::TIME).await?;
        decoded("read-time", wire::decode_time::<LittleEndian>(&data)).map(Some)
    }

    async fn read_gps(&self, conn: &Connection) -> Result<Option<Gps>, OperationError> {
        let data = read(conn, uuids::GPS).await?;
        decoded("read-gps", decode_gps(&data))
    }

    async fn read_diagnostics(
        &self,
        conn: &Connection,
    ) -> Result<Option<Diagnostics>, OperationError> {
        let data = read(conn, uuids::DIAGNOSTICS).await?;
        decoded("read-diagnostics", decode_diagnostics(&data)).map(Some)
    }

    async fn write_general(&self, conn: &Connection, value: &General) -> Result<(), OperationError> {
        write(conn, uuids::MODE, vec![value.mode.into()]).await
    }

    /// Preset and steps are committed as two separate transactions.
    async fn write_dim(&self, conn: &Connection, value: &Dim) -> Result<(), OperationError> {
        let steps = decoded("write-dim", encode_steps(&value.steps))?;
        if let Some(preset) = value.preset {
            let preset = transaction(
                "write-dim",
                vec![StagedWrite::new(uuids::PRESET, vec![preset])],
            )?;
            write_transaction(conn, preset).await?;
        }
        let stored = stored_steps(&steps);
        let steps = transaction(
            "write-dim",
            vec![StagedWrite::new(uuids::STEPS, steps).reads_back_as(stored)],
        )?;
        write_transaction(conn, steps).await?;

        if let Some(level) = value.level {
            let level = decoded("write-dim", wire::percent("level", level))?;
            write(conn, uuids::LEVEL, vec![level]).await?;
        }
        Ok(())
    }

    /// Config and fixture name commit together.
    async fn write_dali(&self, conn: &Connection, value: &Dali) -> Result<(), OperationError> {
        let mut writes = vec![StagedWrite::new(
            uuids::DALI_CONFIG,
            wire::encode_dali_config::<LittleEndian>(value),
        )];
        if let Some(name) = &value.fixture_name {
            let name = decoded("write-dali", wire::padded_ascii(name, FIXTURE_NAME_LEN))?;
            writes.push(StagedWrite::new(uuids::FIXTURE_NAME, name));
        }
        write_transaction(conn, transaction("write-dali", writes)?).await
    }

    async fn write_time(&self, conn: &Connection, value: &Time) -> Result<(), OperationError> {
        write(conn, uuids::TIME, wire::encode_time::<LittleEndian>(value)).await
    }
}
