//! Zsc010 family.
//!
//! Attribute ids are derived per node: `5A 53 | id | address reversed |
//! 00 00 00 00 00 01`. Fields are big-endian and light levels travel on the
//! DALI logarithmic dimming curve.

use std::io::Cursor;

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt};
use tracing::debug;
use uuid::Uuid;

use super::wire::{self, WireError};
use super::{FamilyCodec, StagedWrite, decoded, read, write, write_transaction};
use crate::coordinator::Connection;
use crate::model::{
    Dali, Device, DeviceFamily, Diagnostics, Dim, General, Gps, OperatingMode, ScheduleDate,
    ScheduleEntry, Time,
};
use crate::operation::{GattErrorKind, OperationError};

/// Characteristic ids carried in bytes 2..4 of the attribute id.
pub mod ids {
    pub const MODE: u16 = 0x0101;
    pub const LEVEL: u16 = 0x0102;
    pub const SCHEDULE: u16 = 0x0103;
    pub const DALI_CONFIG: u16 = 0x0201;
    pub const TIME: u16 = 0x0301;
    pub const GPS: u16 = 0x0302;
    pub const DIAGNOSTICS: u16 = 0x0401;
}

const PREFIX: [u8; 2] = [0x5A, 0x53];
const SUFFIX: [u8; 6] = [0, 0, 0, 0, 0, 1];

const MAX_STEPS: usize = 5;
const SCHEDULE_HEADER_LEN: usize = 7;
const GPS_LEN: usize = 8;
const GPS_SCALE: f64 = 1e6;
const FIRMWARE_LEN: usize = 8;

/// Schedule written when a dim update carries steps only.
pub const DEFAULT_SCHEDULE: ScheduleEntry = ScheduleEntry {
    version: 1,
    start: ScheduleDate {
        year: 2000,
        month: 1,
        day: 1,
    },
    recurrence: 0x7F,
    steps: Vec::new(),
};

/// Attribute id of characteristic `id` on the node at `address`.
pub fn attribute_uuid(id: u16, address: [u8; 6]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..2].copy_from_slice(&PREFIX);
    bytes[2..4].copy_from_slice(&id.to_be_bytes());
    for (dst, src) in bytes[4..10].iter_mut().zip(address.iter().rev()) {
        *dst = *src;
    }
    bytes[10..16].copy_from_slice(&SUFFIX);
    Uuid::from_bytes(bytes)
}

/// Percentage to the on-wire DALI arc level, 1..=100.
pub fn level_to_wire(percent: u8) -> u8 {
    let p = f64::from(percent.min(100));
    if p < 0.1 {
        return 1;
    }
    (1.0 + 33.0 * (p.log10() + 1.0)).round().clamp(1.0, 100.0) as u8
}

pub fn wire_to_level(wire: u8) -> u8 {
    let w = f64::from(wire.clamp(1, 100));
    10f64.powf(3.0 * (w - 1.0) / 99.0 - 1.0).round() as u8
}

pub fn encode_schedule(entry: &ScheduleEntry) -> Result<Vec<u8>, WireError> {
    let ScheduleDate { year, month, day } = entry.start;
    if !(1..=12).contains(&month) {
        return Err(WireError::OutOfRange {
            field: "month",
            value: month.into(),
        });
    }
    if !(1..=31).contains(&day) {
        return Err(WireError::OutOfRange {
            field: "day",
            value: day.into(),
        });
    }
    let records = wire::encode_steps(&entry.steps, MAX_STEPS, level_to_wire)?;

    let mut out = Vec::with_capacity(SCHEDULE_HEADER_LEN + records.len());
    out.push(entry.version);
    out.extend_from_slice(&year.to_be_bytes());
    out.extend_from_slice(&[month, day, entry.recurrence, entry.steps.len() as u8]);
    out.extend(records);
    Ok(out)
}

/// Empty payload means no schedule stored.
pub fn decode_schedule(data: &[u8]) -> Result<Option<ScheduleEntry>, WireError> {
    if data.is_empty() {
        return Ok(None);
    }
    wire::require(data, SCHEDULE_HEADER_LEN)?;
    let mut cursor = Cursor::new(data);
    let version = cursor.read_u8()?;
    let year = cursor.read_u16::<BigEndian>()?;
    let month = cursor.read_u8()?;
    let day = cursor.read_u8()?;
    let recurrence = cursor.read_u8()?;
    let count = usize::from(cursor.read_u8()?);
    if count > MAX_STEPS {
        return Err(WireError::TooManySteps {
            count,
            max: MAX_STEPS,
        });
    }
    let end = SCHEDULE_HEADER_LEN + count * 3;
    wire::require(data, end)?;
    Ok(Some(ScheduleEntry {
        version,
        start: ScheduleDate { year, month, day },
        recurrence,
        steps: wire::decode_steps(&data[SCHEDULE_HEADER_LEN..end], wire_to_level),
    }))
}

pub fn decode_gps(data: &[u8]) -> Result<Option<Gps>, WireError> {
    wire::require(data, GPS_LEN)?;
    let mut cursor = Cursor::new(data);
    let lat = cursor.read_i32::<BigEndian>()?;
    let lon = cursor.read_i32::<BigEndian>()?;
    if lat == i32::MAX || lon == i32::MAX {
        return Ok(None);
    }
    Ok(Some(Gps {
        latitude: f64::from(lat) / GPS_SCALE,
        longitude: f64::from(lon) / GPS_SCALE,
    }))
}

/// `[status u16][firmware ASCII 8]`. Nodes without diagnostics answer
/// with an empty payload, reported as status 0.
pub fn decode_diagnostics(data: &[u8]) -> Result<Diagnostics, WireError> {
    if data.is_empty() {
        return Ok(Diagnostics::default());
    }
    wire::require(data, 2)?;
    let status = Cursor::new(data).read_u16::<BigEndian>()?;
    let firmware = &data[2..data.len().min(2 + FIRMWARE_LEN)];
    Ok(Diagnostics {
        status: status.into(),
        firmware_version: wire::ascii(firmware),
        ..Default::default()
    })
}

/// Codec for Zsc010 controllers, bound to one node address.
#[derive(Debug)]
pub struct Zsc010 {
    address: Option<[u8; 6]>,
}

impl Zsc010 {
    pub fn new(device: &Device) -> Self {
        let address = device.address_bytes();
        if address.is_none() {
            debug!(address = %device.address, "Unparseable radio address");
        }
        Self { address }
    }

    fn uuid(&self, id: u16, operation: &str) -> Result<Uuid, OperationError> {
        self.address
            .map(|address| attribute_uuid(id, address))
            .ok_or_else(|| {
                OperationError::gatt(
                    GattErrorKind::PreconditionFailed("invalid radio address".into()),
                    operation,
                )
            })
    }

    async fn read_id(
        &self,
        conn: &Connection,
        id: u16,
        operation: &str,
    ) -> Result<Vec<u8>, OperationError> {
        read(conn, self.uuid(id, operation)?).await
    }
}

#[async_trait]
impl FamilyCodec for Zsc010 {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Zsc010
    }

    async fn connect(&self, conn: &Connection) -> Result<(), OperationError> {
        super::connect_and_discover(conn).await
    }

    async fn read_general(&self, conn: &Connection) -> Result<Option<General>, OperationError> {
        let data = self.read_id(conn, ids::MODE, "read-general").await?;
        decoded("read-general", wire::require(&data, 1))?;
        Ok(Some(General {
            mode: OperatingMode::from(data[0]),
        }))
    }

    async fn read_dim(&self, conn: &Connection) -> Result<Option<Dim>, OperationError> {
        let level = self.read_id(conn, ids::LEVEL, "read-dim").await?;
        let schedule = self.read_id(conn, ids::SCHEDULE, "read-dim").await?;
        let schedule = decoded("read-dim", decode_schedule(&schedule))?;
        Ok(Some(Dim {
            preset: None,
            steps: schedule
                .as_ref()
                .map(|s| s.steps.clone())
                .unwrap_or_default(),
            level: level
                .first()
                .copied()
                .and_then(wire::optional_u8)
                .map(wire_to_level),
            schedule,
        }))
    }

    async fn read_dali(&self, conn: &Connection) -> Result<Option<Dali>, OperationError> {
        let data = self.read_id(conn, ids::DALI_CONFIG, "read-dali").await?;
        decoded("read-dali", wire::decode_dali_config::<BigEndian>(&data)).map(Some)
    }

    async fn read_time(&self, conn: &Connection) -> Result<Option<Time>, OperationError> {
        let data = self.read_id(conn, ids::TIME, "read-time").await?;
        decoded("read-time", wire::decode_time::<BigEndian>(&data)).map(Some)
    }

    async fn read_gps(&self, conn: &Connection) -> Result<Option<Gps>, OperationError> {
        let data = self.read_id(conn, ids::GPS, "read-gps").await?;
        decoded("read-gps", decode_gps(&data))
    }

    async fn read_diagnostics(
        &self,
        conn: &Connection,
    ) -> Result<Option<Diagnostics>, OperationError> {
        let data = self.read_id(conn, ids::DIAGNOSTICS, "read-diagnostics").await?;
        decoded("read-diagnostics", decode_diagnostics(&data)).map(Some)
    }

    async fn write_general(&self, conn: &Connection, value: &General) -> Result<(), OperationError> {
        let uuid = self.uuid(ids::MODE, "write-general")?;
        write(conn, uuid, vec![value.mode.into()]).await
    }

    /// The step list is authoritative; the schedule header is kept from the
    /// update or defaulted.
    async fn write_dim(&self, conn: &Connection, value: &Dim) -> Result<(), OperationError> {
        let entry = ScheduleEntry {
            steps: value.steps.clone(),
            ..value.schedule.clone().unwrap_or(DEFAULT_SCHEDULE)
        };
        let encoded = decoded("write-dim", encode_schedule(&entry))?;
        let uuid = self.uuid(ids::SCHEDULE, "write-dim")?;
        write_transaction(conn, vec![StagedWrite::new(uuid, encoded)]).await?;

        if let Some(level) = value.level {
            let level = decoded("write-dim", wire::percent("level", level))?;
            let uuid = self.uuid(ids::LEVEL, "write-dim")?;
            write(conn, uuid, vec![level_to_wire(level)]).await?;
        }
        Ok(())
    }

    async fn write_dali(&self, conn: &Connection, value: &Dali) -> Result<(), OperationError> {
        let uuid = self.uuid(ids::DALI_CONFIG, "write-dali")?;
        write(conn, uuid, wire::encode_dali_config::<BigEndian>(value)).await
    }

    async fn write_time(&self, conn: &Connection, value: &Time) -> Result<(), OperationError> {
        let uuid = self.uuid(ids::TIME, "write-time")?;
        write(conn, uuid, wire::encode_time::<BigEndian>(value)).await
    }
}
