//! D4i family: fixed attribute ids, big-endian fields, DALI memory banks.

use std::io::Cursor;

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt};

use super::wire::{self, WireError};
use super::{FamilyCodec, StagedWrite, decoded, read, write, write_transaction};
use crate::coordinator::Connection;
use crate::membank::{self, BankChannel};
use crate::model::{
    Dali, DaliBank, DeviceFamily, Diagnostics, Dim, DimStep, General, OperatingMode, Time,
};
use crate::operation::OperationError;

pub mod uuids {
    use uuid::Uuid;

    const fn d4i(short: u16) -> Uuid {
        Uuid::from_u128(0x6d8f_0000_4e1a_4c4e_9a0b_5d41_0000_0000 | ((short as u128) << 96))
    }

    pub const MODE: Uuid = d4i(0x0001);
    pub const PRESET: Uuid = d4i(0x0002);
    pub const LEVEL: Uuid = d4i(0x0003);
    pub const STEPS: Uuid = d4i(0x0004);
    pub const DALI_CONFIG: Uuid = d4i(0x0010);
    pub const POWER_LEVELS: Uuid = d4i(0x0011);
    pub const FIXTURE_NAME: Uuid = d4i(0x0012);
    pub const TIME: Uuid = d4i(0x0020);
    pub const DIAGNOSTICS: Uuid = d4i(0x0030);
    pub const BANK_REQUEST: Uuid = d4i(0x0040);
    pub const BANK_RESPONSE: Uuid = d4i(0x0041);
}

const MAX_STEPS: usize = 8;
const FIXTURE_NAME_LEN: usize = 16;
const DIAGNOSTICS_LEN: usize = 8;
const BANKS: [u8; 4] = [0, 1, 202, 205];

const CHANNEL: BankChannel = BankChannel {
    request: uuids::BANK_REQUEST,
    response: uuids::BANK_RESPONSE,
};

/// `[n][n x (hour, minute, level)]`
pub fn encode_steps(steps: &[DimStep]) -> Result<Vec<u8>, WireError> {
    let records = wire::encode_steps(steps, MAX_STEPS, |l| l)?;
    let mut out = Vec::with_capacity(records.len() + 1);
    out.push(steps.len() as u8);
    out.extend(records);
    Ok(out)
}

pub fn decode_steps(data: &[u8]) -> Result<Vec<DimStep>, WireError> {
    wire::require(data, 1)?;
    let count = usize::from(data[0]);
    if count > MAX_STEPS {
        return Err(WireError::TooManySteps {
            count,
            max: MAX_STEPS,
        });
    }
    wire::require(data, 1 + count * 3)?;
    Ok(wire::decode_steps(&data[1..1 + count * 3], |l| l))
}

pub fn decode_diagnostics(data: &[u8]) -> Result<Diagnostics, WireError> {
    wire::require(data, DIAGNOSTICS_LEN)?;
    let mut cursor = Cursor::new(data);
    let status = cursor.read_u32::<BigEndian>()?;
    Ok(Diagnostics {
        status,
        firmware_version: wire::version(&data[4..6]),
        library_version: wire::version(&data[6..8]),
        ..Default::default()
    })
}

/// Codec for D4i controllers.
#[derive(Debug, Default)]
pub struct D4i;

#[async_trait]
impl FamilyCodec for D4i {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::D4i
    }

    async fn connect(&self, conn: &Connection) -> Result<(), OperationError> {
        super::connect_and_discover(conn).await
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
        let dali = decoded("read-dali", wire::decode_dali_config::<BigEndian>(&config))?;
        Ok(Some(Dali {
            available_power_levels: wire::decode_u16_list::<BigEndian>(&levels),
            fixture_name: wire::ascii(&name),
            ..dali
        }))
    }

    async fn read_time(&self, conn: &Connection) -> Result<Option<Time>, OperationError> {
        let data = read(conn, uuids::TIME).await?;
        decoded("read-time", wire::decode_time::<BigEndian>(&data)).map(Some)
    }

    async fn read_diagnostics(
        &self,
        conn: &Connection,
    ) -> Result<Option<Diagnostics>, OperationError> {
        let data = read(conn, uuids::DIAGNOSTICS).await?;
        decoded("read-diagnostics", decode_diagnostics(&data)).map(Some)
    }

    fn dali_banks(&self) -> &'static [u8] {
        &BANKS
    }

    async fn read_dali_bank(
        &self,
        conn: &Connection,
        bank: u8,
    ) -> Result<Option<DaliBank>, OperationError> {
        membank::read_bank(conn, CHANNEL, bank).await
    }

    async fn write_general(&self, conn: &Connection, value: &General) -> Result<(), OperationError> {
        write(conn, uuids::MODE, vec![value.mode.into()]).await
    }

    /// Preset and steps go out in one reliable-write transaction; the
    /// absolute level is a separate write.
    async fn write_dim(&self, conn: &Connection, value: &Dim) -> Result<(), OperationError> {
        let steps = decoded("write-dim", encode_steps(&value.steps))?;
        let mut staged = Vec::with_capacity(2);
        if let Some(preset) = value.preset {
            staged.push(StagedWrite::new(uuids::PRESET, vec![preset]));
        }
        staged.push(StagedWrite::new(uuids::STEPS, steps));
        write_transaction(conn, staged).await?;

        if let Some(level) = value.level {
            let level = decoded("write-dim", wire::percent("level", level))?;
            write(conn, uuids::LEVEL, vec![level]).await?;
        }
        Ok(())
    }

    async fn write_dali(&self, conn: &Connection, value: &Dali) -> Result<(), OperationError> {
        write(
            conn,
            uuids::DALI_CONFIG,
            wire::encode_dali_config::<BigEndian>(value),
        )
        .await?;
        if let Some(name) = &value.fixture_name {
            let name = decoded("write-dali", wire::padded_ascii(name, FIXTURE_NAME_LEN))?;
            write(conn, uuids::FIXTURE_NAME, name).await?;
        }
        Ok(())
    }

    async fn write_time(&self, conn: &Connection, value: &Time) -> Result<(), OperationError> {
        write(conn, uuids::TIME, wire::encode_time::<BigEndian>(value)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::link::{MockNode, WriteEffect};
    use std::collections::HashMap;

    /// Bank images keyed by bank id; unknown addresses read as 0xFF.
    fn bank_images() -> HashMap<u8, Vec<u8>> {
        let mut bank0 = vec![0xFF; 0x20];
        bank0[0x03..0x09].copy_from_slice(&[0x00, 0x12, 0x34, 0x56, 0x78, 0x9A]);
        bank0[0x09] = 2;
        bank0[0x0A] = 7;
        let mut bank205 = vec![0xFF; 0x20];
        bank205[0x04..0x08].copy_from_slice(&[0x00, 0x01, 0x51, 0x80]);
        bank205[0x0F] = 0;
        bank205[0x1B] = 42;
        HashMap::from([(0, bank0), (205, bank205)])
    }

    /// Node populated with a plausible D4i attribute table.
    pub(crate) fn node() -> MockNode {
        let node = MockNode::new();
        node.set_attribute(uuids::MODE, &[2]);
        node.set_attribute(uuids::PRESET, &[1]);
        node.set_attribute(uuids::LEVEL, &[0xFF]);
        node.set_attribute(uuids::STEPS, &[2, 22, 0, 60, 1, 30, 30]);
        node.set_attribute(uuids::DALI_CONFIG, &[1, 0x00, 0x64, 4]);
        node.set_attribute(uuids::POWER_LEVELS, &[0x00, 0x32, 0x00, 0x64]);
        node.set_attribute(uuids::FIXTURE_NAME, b"STREET-40\0\0\0\0\0\0\0");
        node.set_attribute(uuids::TIME, &[0x65, 0x00, 0x00, 0x00, 0x00, 0x3C, 0x00, 0x00]);
        node.set_attribute(uuids::DIAGNOSTICS, &[0, 0, 0, 5, 1, 2, 3, 4]);
        node.set_attribute(uuids::BANK_REQUEST, &[]);
        node.set_attribute(uuids::BANK_RESPONSE, &[]);

        let images = bank_images();
        node.set_write_hook(
            uuids::BANK_REQUEST,
            Box::new(move |request| {
                let [bank, address, len] = [request[0], request[1], request[2]];
                let mut response = request.to_vec();
                if let Some(image) = images.get(&bank) {
                    let start = usize::from(address);
                    response.extend(
                        (start..start + usize::from(len))
                            .map(|i| image.get(i).copied().unwrap_or(0xFF)),
                    );
                } else {
                    // Unknown bank: the node answers with a stale header.
                    response = vec![0xFF, 0xFF, 0xFF];
                }
                WriteEffect {
                    store: vec![(uuids::BANK_RESPONSE, response)],
                    ..Default::default()
                }
            }),
        );
        node
    }

    #[test]
    fn test_steps_encoding() {
        let steps = vec![DimStep::new(22, 0, 60), DimStep::new(1, 30, 30)];
        let encoded = encode_steps(&steps).unwrap();
        assert_eq!(encoded, vec![2, 22, 0, 60, 1, 30, 30]);
        assert_eq!(decode_steps(&encoded).unwrap(), steps);

        assert!(matches!(
            decode_steps(&[3, 22, 0, 60]),
            Err(WireError::Truncated { needed: 10, .. })
        ));
        assert!(matches!(
            encode_steps(&vec![DimStep::new(0, 0, 0); 9]),
            Err(WireError::TooManySteps { count: 9, max: 8 })
        ));
    }

    #[test]
    fn test_diagnostics_decoding() {
        let diag = decode_diagnostics(&[0, 0, 1, 0, 1, 2, 0xFF, 0xFF]).unwrap();
        assert_eq!(diag.status, 256);
        assert_eq!(diag.firmware_version.as_deref(), Some("1.2"));
        assert_eq!(diag.library_version, None);
    }

    mod live {
        use super::*;
        use crate::config::CoordinatorConfig;
        use crate::coordinator::Coordinator;
        use crate::events::NullObserver;
        use crate::link::MockLinkFactory;
        use crate::model::{BankValue, Device};
        use crate::permission::AlwaysGranted;
        use std::sync::Arc;
        use uuid::Uuid;

        async fn connected(node: &MockNode) -> Coordinator {
            let coordinator = Coordinator::new(
                Arc::new(MockLinkFactory::new(node.clone())),
                Arc::new(AlwaysGranted),
                Arc::new(NullObserver),
                CoordinatorConfig::default(),
            );
            let device = Device::new(Uuid::from_u128(1), "00:11:22:33:44:55", DeviceFamily::D4i);
            assert!(coordinator.connect(device, None).await);
            coordinator
        }

        #[tokio::test(start_paused = true)]
        async fn test_read_all_groups() {
            let node = node();
            let coordinator = connected(&node).await;
            let chars = coordinator.read_characteristics(None, None).await;

            let dim = chars.dim.unwrap();
            assert_eq!(dim.preset, Some(1));
            assert_eq!(dim.level, None);
            assert_eq!(dim.steps.len(), 2);

            let dali = chars.dali.unwrap();
            assert!(dali.clo);
            assert_eq!(dali.power_level, Some(100));
            assert_eq!(dali.available_power_levels, vec![50, 100]);
            assert_eq!(dali.fixture_name.as_deref(), Some("STREET-40"));

            let time = chars.time.unwrap();
            assert_eq!(time.utc, 0x6500_0000);
            assert_eq!(time.timezone_minutes, 60);

            assert_eq!(chars.diagnostics.unwrap().status, 5);
            assert!(chars.gps.is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn test_read_memory_banks() {
            let node = node();
            let coordinator = connected(&node).await;
            let banks = coordinator.read_dali_banks().await.unwrap();

            let bank0 = &banks[&0];
            assert_eq!(bank0[&0x03], BankValue::Unsigned(0x0012_3456_789A));
            assert_eq!(bank0[&0x09], BankValue::Unsigned(2));
            // 0xFF bytes are sentinels
            assert!(!bank0.contains_key(&0x13));

            let bank205 = &banks[&205];
            assert_eq!(bank205[&0x04], BankValue::Unsigned(86400));
            assert_eq!(bank205[&0x0F], BankValue::Bool(false));
            assert_eq!(bank205[&0x1B], BankValue::Signed(42));

            // Bank 1 and 202 answer with a stale header: absent, not an error.
            assert!(!banks.contains_key(&1));
            assert!(!banks.contains_key(&202));
            assert!(coordinator.state().last_error.is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn test_write_then_read_is_idempotent() {
            let node = node();
            let coordinator = connected(&node).await;
            let dim = Dim {
                preset: Some(3),
                steps: vec![
                    DimStep::new(20, 0, 100),
                    DimStep::new(23, 0, 50),
                    DimStep::new(5, 0, 80),
                ],
                level: Some(70),
                schedule: None,
            };
            let update = crate::model::DeviceCharacteristics {
                dim: Some(dim.clone()),
                ..Default::default()
            };

            assert!(coordinator.write_characteristics(&update).await);
            assert!(coordinator.write_characteristics(&update).await);
            let read = coordinator.read_characteristics(None, None).await;
            assert_eq!(read.dim, Some(dim));
        }

        #[tokio::test(start_paused = true)]
        async fn test_unsupported_gps_write_is_ignored() {
            let node = node();
            let coordinator = connected(&node).await;
            let update = crate::model::DeviceCharacteristics {
                gps: Some(crate::model::Gps {
                    latitude: 1.0,
                    longitude: 2.0,
                }),
                ..Default::default()
            };
            assert!(coordinator.write_characteristics(&update).await);
        }
    }
}
