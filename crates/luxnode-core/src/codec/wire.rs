//! Byte-level helpers shared by the family codecs.

use std::io::Cursor;

use byteorder::{ByteOrder, ReadBytesExt};
use thiserror::Error;

use crate::model::{Dali, DimStep, Time};
use crate::operation::GattErrorKind;

/// Sentinel for an absent 8-bit value.
pub const ABSENT_U8: u8 = 0xFF;
/// Sentinel for an absent 16-bit value.
pub const ABSENT_U16: u16 = 0xFFFF;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Payload too short: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Payload ended early")]
    Eof,

    #[error("{count} dim steps exceed the limit of {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("Value {value} out of range for {field}")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("Text '{0}' does not fit the field")]
    TextTooLong(String),

    #[error("Text is not ASCII")]
    NotAscii,
}

impl From<std::io::Error> for WireError {
    fn from(_: std::io::Error) -> Self {
        // byteorder only fails on short input
        WireError::Eof
    }
}

impl From<WireError> for GattErrorKind {
    fn from(e: WireError) -> Self {
        GattErrorKind::SerializationFailed(e.to_string())
    }
}

pub fn require(data: &[u8], needed: usize) -> Result<(), WireError> {
    if data.len() < needed {
        return Err(WireError::Truncated {
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

pub fn optional_u8(value: u8) -> Option<u8> {
    (value != ABSENT_U8).then_some(value)
}

pub fn optional_u16(value: u16) -> Option<u16> {
    (value != ABSENT_U16).then_some(value)
}

/// Percentage in 0..=100.
pub fn percent(field: &'static str, value: u8) -> Result<u8, WireError> {
    if value > 100 {
        return Err(WireError::OutOfRange {
            field,
            value: value.into(),
        });
    }
    Ok(value)
}

/// ASCII field padded with NUL (or 0xFF when erased). Empty means absent.
pub fn ascii(data: &[u8]) -> Option<String> {
    let end = data
        .iter()
        .position(|b| *b == 0 || *b == 0xFF)
        .unwrap_or(data.len());
    let text: String = data[..end]
        .iter()
        .filter(|b| b.is_ascii() && !b.is_ascii_control())
        .map(|b| *b as char)
        .collect();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub fn padded_ascii(text: &str, len: usize) -> Result<Vec<u8>, WireError> {
    if !text.is_ascii() {
        return Err(WireError::NotAscii);
    }
    if text.len() > len {
        return Err(WireError::TextTooLong(text.to_string()));
    }
    let mut out = text.as_bytes().to_vec();
    out.resize(len, 0);
    Ok(out)
}

/// `(hour, minute, level)` records, no count prefix.
pub fn encode_steps(
    steps: &[DimStep],
    max: usize,
    level: impl Fn(u8) -> u8,
) -> Result<Vec<u8>, WireError> {
    if steps.len() > max {
        return Err(WireError::TooManySteps {
            count: steps.len(),
            max,
        });
    }
    let mut out = Vec::with_capacity(steps.len() * 3);
    for step in steps {
        if step.hour > 23 {
            return Err(WireError::OutOfRange {
                field: "hour",
                value: step.hour.into(),
            });
        }
        if step.minute > 59 {
            return Err(WireError::OutOfRange {
                field: "minute",
                value: step.minute.into(),
            });
        }
        out.extend_from_slice(&[step.hour, step.minute, level(percent("level", step.level)?)]);
    }
    Ok(out)
}

pub fn decode_steps(data: &[u8], level: impl Fn(u8) -> u8) -> Vec<DimStep> {
    data.chunks_exact(3)
        .map(|r| DimStep::new(r[0], r[1], level(r[2])))
        .collect()
}

pub const TIME_LEN: usize = 8;

/// `[utc u32][timezone i16][midnight offset i16]`
pub fn decode_time<B: ByteOrder>(data: &[u8]) -> Result<Time, WireError> {
    require(data, TIME_LEN)?;
    let mut cursor = Cursor::new(data);
    Ok(Time {
        utc: cursor.read_u32::<B>()?,
        timezone_minutes: cursor.read_i16::<B>()?,
        midnight_offset_minutes: cursor.read_i16::<B>()?,
    })
}

pub fn encode_time<B: ByteOrder>(time: &Time) -> Vec<u8> {
    let mut out = vec![0u8; TIME_LEN];
    B::write_u32(&mut out[0..4], time.utc);
    B::write_i16(&mut out[4..6], time.timezone_minutes);
    B::write_i16(&mut out[6..8], time.midnight_offset_minutes);
    out
}

pub const DALI_CONFIG_LEN: usize = 4;

/// `[clo u8][power u16][fade u8]` into the scalar part of [`Dali`].
pub fn decode_dali_config<B: ByteOrder>(data: &[u8]) -> Result<Dali, WireError> {
    require(data, DALI_CONFIG_LEN)?;
    let mut cursor = Cursor::new(data);
    let clo = cursor.read_u8()? != 0;
    let power_level = optional_u16(cursor.read_u16::<B>()?);
    let fade_time = optional_u8(cursor.read_u8()?);
    Ok(Dali {
        clo,
        power_level,
        fade_time,
        ..Default::default()
    })
}

pub fn encode_dali_config<B: ByteOrder>(dali: &Dali) -> Vec<u8> {
    let mut out = vec![0u8; DALI_CONFIG_LEN];
    out[0] = dali.clo.into();
    B::write_u16(&mut out[1..3], dali.power_level.unwrap_or(ABSENT_U16));
    out[3] = dali.fade_time.unwrap_or(ABSENT_U8);
    out
}

pub fn decode_u16_list<B: ByteOrder>(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(B::read_u16)
        .filter(|v| *v != ABSENT_U16)
        .collect()
}

/// `major.minor[.patch]`, absent when every part is erased.
pub fn version(parts: &[u8]) -> Option<String> {
    if parts.is_empty() || parts.iter().all(|p| *p == ABSENT_U8) {
        return None;
    }
    Some(
        parts
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join("."),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_trims_padding() {
        assert_eq!(ascii(b"LUMI-40\0\0\0"), Some("LUMI-40".into()));
        assert_eq!(ascii(&[0xFF; 8]), None);
        assert_eq!(ascii(b""), None);
    }

    #[test]
    fn test_padded_ascii_limits() {
        assert_eq!(padded_ascii("ab", 4).unwrap(), b"ab\0\0".to_vec());
        assert!(matches!(
            padded_ascii("abcde", 4),
            Err(WireError::TextTooLong(_))
        ));
        assert_eq!(padded_ascii("é", 4), Err(WireError::NotAscii));
    }

    #[test]
    fn test_steps_limit_and_range() {
        let steps = vec![DimStep::new(1, 0, 50); 6];
        assert_eq!(
            encode_steps(&steps, 5, |l| l),
            Err(WireError::TooManySteps { count: 6, max: 5 })
        );
        assert!(matches!(
            encode_steps(&[DimStep::new(24, 0, 50)], 5, |l| l),
            Err(WireError::OutOfRange { field: "hour", .. })
        ));
        assert!(matches!(
            encode_steps(&[DimStep::new(1, 0, 101)], 5, |l| l),
            Err(WireError::OutOfRange { field: "level", .. })
        ));
    }

    #[test]
    fn test_time_byte_order() {
        use byteorder::{BigEndian, LittleEndian};
        let time = Time {
            utc: 0x0102_0304,
            timezone_minutes: -60,
            midnight_offset_minutes: 30,
        };
        let be = encode_time::<BigEndian>(&time);
        assert_eq!(&be[..4], &[1, 2, 3, 4]);
        assert_eq!(&be[4..6], &[0xFF, 0xC4]);
        let le = encode_time::<LittleEndian>(&time);
        assert_eq!(&le[..4], &[4, 3, 2, 1]);
        assert_eq!(decode_time::<LittleEndian>(&le).unwrap(), time);
        assert!(matches!(
            decode_time::<BigEndian>(&be[..7]),
            Err(WireError::Truncated { needed: 8, got: 7 })
        ));
    }

    #[test]
    fn test_dali_config_sentinels() {
        use byteorder::BigEndian;
        let dali = decode_dali_config::<BigEndian>(&[1, 0xFF, 0xFF, 0xFF]).unwrap();
        assert!(dali.clo);
        assert_eq!(dali.power_level, None);
        assert_eq!(dali.fade_time, None);
        assert_eq!(encode_dali_config::<BigEndian>(&dali), vec![1, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_version_text() {
        assert_eq!(version(&[1, 4, 2]), Some("1.4.2".into()));
        assert_eq!(version(&[0xFF, 0xFF]), None);
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(optional_u8(0xFF), None);
        assert_eq!(optional_u8(7), Some(7));
        assert_eq!(optional_u16(0xFFFF), None);
        assert_eq!(optional_u16(0xFFFE), Some(0xFFFE));
    }
}
