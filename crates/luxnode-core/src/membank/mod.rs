//! DALI memory-bank reader.
//!
//! The node exposes its DALI memory banks through a request/response pair:
//! the central writes `[bank, address, length]` to the request characteristic,
//! waits briefly, then reads `[bank, address, length, data...]` back. A
//! response whose header does not echo the request is stale and discarded.

pub mod fields;

pub use fields::{BankLayout, Field, FieldKind, layout};

use tracing::debug;
use uuid::Uuid;

use crate::coordinator::Connection;
use crate::model::DaliBank;
use crate::operation::{OperationError, ReadCharacteristic, WriteCharacteristic};

/// Largest data payload in one response.
pub const MAX_WINDOW: usize = 32;

const HEADER_LEN: usize = 3;

/// Request and response characteristics of a node.
#[derive(Debug, Clone, Copy)]
pub struct BankChannel {
    pub request: Uuid,
    pub response: Uuid,
}

/// One validated response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankWindow {
    pub bank: u8,
    pub address: u8,
    data: Vec<u8>,
}

impl BankWindow {
    /// Validate `response` against the request header. `None` on mismatch.
    pub fn parse(request: [u8; 3], response: &[u8]) -> Option<Self> {
        if response.len() < HEADER_LEN || response[..HEADER_LEN] != request {
            return None;
        }
        let len = usize::from(request[2]).min(MAX_WINDOW);
        let data = response[HEADER_LEN..]
            .iter()
            .take(len)
            .copied()
            .collect();
        Some(Self {
            bank: request[0],
            address: request[1],
            data,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes at absolute bank `offset`.
    fn slice(&self, offset: u8, len: usize) -> Option<&[u8]> {
        let start = usize::from(offset.checked_sub(self.address)?);
        self.data.get(start..start + len)
    }

    /// Big-endian unsigned of 1, 2, 3, 4, 6 or 8 bytes. Values above
    /// `max_valid` are sentinels.
    pub fn unsigned(&self, offset: u8, width: usize, max_valid: u64) -> Option<u64> {
        if !matches!(width, 1 | 2 | 3 | 4 | 6 | 8) {
            return None;
        }
        let value = self
            .slice(offset, width)?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        (value <= max_valid).then_some(value)
    }

    pub fn signed(&self, offset: u8, max_valid: i8) -> Option<i8> {
        let value = i8::from_be_bytes([*self.slice(offset, 1)?.first()?]);
        (value <= max_valid).then_some(value)
    }

    /// `0` or `1`; anything else is absent.
    pub fn boolean(&self, offset: u8) -> Option<bool> {
        match self.slice(offset, 1)?.first()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        }
    }

    pub fn text(&self, offset: u8, len: usize) -> Option<String> {
        crate::codec::wire::ascii(self.slice(offset, len)?)
    }
}

/// Read one window. A stale or mismatched response is `Ok(None)`.
pub async fn read_window(
    conn: &Connection,
    channel: BankChannel,
    bank: u8,
    address: u8,
    length: u8,
) -> Result<Option<BankWindow>, OperationError> {
    let request = [bank, address, length.min(MAX_WINDOW as u8)];
    conn.perform(WriteCharacteristic::unverified(
        channel.request,
        request.to_vec(),
    ))
    .await?;
    tokio::time::sleep(conn.config().bank_settle()).await;
    let response = conn.perform(ReadCharacteristic::new(channel.response)).await?;

    let window = BankWindow::parse(request, &response);
    if window.is_none() {
        debug!(
            bank,
            address,
            header = ?response.get(..HEADER_LEN),
            "Discarding mismatched bank response"
        );
    }
    Ok(window)
}

/// Read and decode every known field of `bank`.
pub async fn read_bank(
    conn: &Connection,
    channel: BankChannel,
    bank: u8,
) -> Result<Option<DaliBank>, OperationError> {
    let Some(layout) = layout(bank) else {
        debug!(bank, "No field table for bank");
        return Ok(None);
    };

    let mut out = DaliBank::new();
    for span in layout.windows() {
        let Some(window) = read_window(conn, channel, bank, span.start, span.len).await? else {
            continue;
        };
        for field in span.fields {
            if let Some(value) = field.decode(&window) {
                out.insert(field.offset, value);
            }
        }
    }
    Ok((!out.is_empty()).then_some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(address: u8, data: &[u8]) -> BankWindow {
        let mut response = vec![0, address, data.len() as u8];
        response.extend_from_slice(data);
        BankWindow::parse([0, address, data.len() as u8], &response).unwrap()
    }

    #[test]
    fn test_header_mismatch_is_absent() {
        assert_eq!(BankWindow::parse([1, 3, 4], &[1, 4, 4, 9, 9, 9, 9]), None);
        assert_eq!(BankWindow::parse([1, 3, 4], &[1, 3]), None);
        assert!(BankWindow::parse([1, 3, 4], &[1, 3, 4, 9, 9, 9, 9]).is_some());
    }

    #[test]
    fn test_payload_clamped() {
        let mut response = vec![0, 0, 40];
        response.extend(std::iter::repeat_n(7u8, 40));
        let window = BankWindow::parse([0, 0, 40], &response).unwrap();
        assert_eq!(window.data().len(), MAX_WINDOW);
    }

    #[test]
    fn test_typed_accessors() {
        let w = window(
            0x10,
            &[0x01, 0x02, 0x03, 0xFF, 0xFF, 0x01, 0x05, 0xF0, b'O', b'K', 0],
        );
        assert_eq!(w.unsigned(0x10, 3, u64::MAX), Some(0x010203));
        assert_eq!(w.unsigned(0x13, 2, 0xFFFE), None);
        assert_eq!(w.unsigned(0x10, 5, u64::MAX), None);
        assert_eq!(w.boolean(0x15), Some(true));
        assert_eq!(w.boolean(0x16), None);
        assert_eq!(w.signed(0x17, 100), Some(-16));
        assert_eq!(w.text(0x18, 3), Some("OK".into()));
        // Outside the window
        assert_eq!(w.unsigned(0x0F, 1, 0xFF), None);
        assert_eq!(w.unsigned(0x1A, 2, 0xFFFF), None);
    }
}
