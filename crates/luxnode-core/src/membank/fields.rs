//! Field tables for the supported memory banks.

use super::{BankWindow, MAX_WINDOW};
use crate::model::BankValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Unsigned { width: usize, max_valid: u64 },
    Signed { max_valid: i8 },
    Bool,
    Text { len: usize },
}

impl FieldKind {
    pub fn width(&self) -> usize {
        match self {
            FieldKind::Unsigned { width, .. } => *width,
            FieldKind::Signed { .. } | FieldKind::Bool => 1,
            FieldKind::Text { len } => *len,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub offset: u8,
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub fn decode(&self, window: &BankWindow) -> Option<BankValue> {
        match self.kind {
            FieldKind::Unsigned { width, max_valid } => window
                .unsigned(self.offset, width, max_valid)
                .map(BankValue::Unsigned),
            FieldKind::Signed { max_valid } => {
                window.signed(self.offset, max_valid).map(BankValue::Signed)
            }
            FieldKind::Bool => window.boolean(self.offset).map(BankValue::Bool),
            FieldKind::Text { len } => window.text(self.offset, len).map(BankValue::Text),
        }
    }
}

const fn uint(offset: u8, name: &'static str, width: usize, max_valid: u64) -> Field {
    Field {
        offset,
        name,
        kind: FieldKind::Unsigned { width, max_valid },
    }
}

const fn flag(offset: u8, name: &'static str) -> Field {
    Field {
        offset,
        name,
        kind: FieldKind::Bool,
    }
}

/// Fields of one bank, sorted by offset.
#[derive(Debug)]
pub struct BankLayout {
    pub bank: u8,
    pub name: &'static str,
    pub fields: &'static [Field],
}

/// Contiguous range read in one request.
#[derive(Debug)]
pub struct Span {
    pub start: u8,
    pub len: u8,
    pub fields: &'static [Field],
}

impl BankLayout {
    /// Group consecutive fields into windows of at most [`MAX_WINDOW`] bytes.
    pub fn windows(&self) -> Vec<Span> {
        let fields: &'static [Field] = self.fields;
        let mut spans = Vec::new();
        let mut first = 0;
        while first < self.fields.len() {
            let start = self.fields[first].offset;
            let mut last = first;
            while last + 1 < self.fields.len() {
                let next = &self.fields[last + 1];
                let end = usize::from(next.offset) + next.kind.width();
                if end - usize::from(start) > MAX_WINDOW {
                    break;
                }
                last += 1;
            }
            let tail = &self.fields[last];
            let end = usize::from(tail.offset) + tail.kind.width();
            spans.push(Span {
                start,
                len: (end - usize::from(start)).min(MAX_WINDOW) as u8,
                fields: &fields[first..=last],
            });
            first = last + 1;
        }
        spans
    }

    pub fn field(&self, offset: u8) -> Option<&Field> {
        self.fields.iter().find(|f| f.offset == offset)
    }
}

// Bank 0: control gear identification
static BANK_0: BankLayout = BankLayout {
    bank: 0,
    name: "Control gear",
    fields: &[
        uint(0x03, "GTIN", 6, 0xFFFF_FFFF_FFFE),
        uint(0x09, "Firmware version (major)", 1, 0xFE),
        uint(0x0A, "Firmware version (minor)", 1, 0xFE),
        uint(0x0B, "Identification number", 8, u64::MAX - 1),
        uint(0x13, "Hardware version (major)", 1, 0xFE),
        uint(0x14, "Hardware version (minor)", 1, 0xFE),
        uint(0x15, "101 version", 1, 0xFE),
        uint(0x16, "102 version", 1, 0xFE),
        uint(0x17, "103 version", 1, 0xFE),
        uint(0x18, "Logical control device units", 1, 0x3F),
        uint(0x19, "Logical control gear units", 1, 0x3F),
        uint(0x1A, "Control gear unit index", 1, 0x3F),
    ],
};

// Bank 1: luminaire information
static BANK_1: BankLayout = BankLayout {
    bank: 1,
    name: "Luminaire",
    fields: &[
        uint(0x03, "Luminaire GTIN", 6, 0xFFFF_FFFF_FFFE),
        uint(0x09, "Luminaire identification number", 8, u64::MAX - 1),
        uint(0x11, "Content format", 2, 0xFFFE),
        uint(0x13, "Year of manufacture", 1, 99),
        uint(0x14, "Week of manufacture", 1, 53),
        uint(0x15, "Nominal input power (W)", 2, 0xFFFE),
        uint(0x17, "Power at minimum dim level (W)", 2, 0xFFFE),
        uint(0x19, "Nominal minimum AC mains voltage (V)", 2, 0xFFFE),
        uint(0x1B, "Nominal maximum AC mains voltage (V)", 2, 0xFFFE),
        uint(0x1D, "Nominal light output (lm)", 3, 0xFF_FFFE),
        uint(0x20, "CRI", 1, 100),
        uint(0x21, "CCT (K)", 2, 0xFFFD),
        uint(0x23, "Light distribution type", 1, 4),
        Field {
            offset: 0x24,
            name: "Luminaire colour",
            kind: FieldKind::Text { len: 24 },
        },
    ],
};

// Bank 202: energy reporting
static BANK_202: BankLayout = BankLayout {
    bank: 202,
    name: "Energy",
    fields: &[
        Field {
            offset: 0x04,
            name: "Active energy scale",
            kind: FieldKind::Signed { max_valid: 6 },
        },
        uint(0x05, "Active energy", 6, 0xFFFF_FFFF_FFFD),
        Field {
            offset: 0x0B,
            name: "Active power scale",
            kind: FieldKind::Signed { max_valid: 6 },
        },
        uint(0x0C, "Active power", 4, 0xFFFF_FFFD),
    ],
};

// Bank 205: control gear diagnostics
static BANK_205: BankLayout = BankLayout {
    bank: 205,
    name: "Diagnostics",
    fields: &[
        uint(0x04, "Operating time (s)", 4, 0xFFFF_FFFD),
        uint(0x08, "Start counter", 3, 0xFF_FFFD),
        uint(0x0B, "External supply voltage (0.1 V)", 2, 0xFFFD),
        uint(0x0D, "External supply frequency (Hz)", 1, 0xFD),
        uint(0x0E, "Power factor (0.01)", 1, 0xFD),
        flag(0x0F, "Overall failure"),
        uint(0x10, "Overall failure counter", 1, 0xFD),
        flag(0x11, "Undervoltage"),
        uint(0x12, "Undervoltage counter", 1, 0xFD),
        flag(0x13, "Overvoltage"),
        uint(0x14, "Overvoltage counter", 1, 0xFD),
        flag(0x15, "Output power limitation"),
        uint(0x16, "Output power limitation counter", 1, 0xFD),
        flag(0x17, "Thermal derating"),
        uint(0x18, "Thermal derating counter", 1, 0xFD),
        flag(0x19, "Thermal shutdown"),
        uint(0x1A, "Thermal shutdown counter", 1, 0xFD),
        Field {
            offset: 0x1B,
            name: "Temperature (C)",
            kind: FieldKind::Signed { max_valid: 125 },
        },
        uint(0x1C, "Output current (%)", 1, 100),
    ],
};

/// Field table for `bank`, if known.
pub fn layout(bank: u8) -> Option<&'static BankLayout> {
    match bank {
        0 => Some(&BANK_0),
        1 => Some(&BANK_1),
        202 => Some(&BANK_202),
        205 => Some(&BANK_205),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_respect_limit() {
        for bank in [0, 1, 202, 205] {
            let layout = layout(bank).unwrap();
            let spans = layout.windows();
            let covered: usize = spans.iter().map(|s| s.fields.len()).sum();
            assert_eq!(covered, layout.fields.len());
            for span in &spans {
                assert!(usize::from(span.len) <= MAX_WINDOW);
            }
        }
    }

    #[test]
    fn test_bank_1_splits_into_two_windows() {
        let spans = layout(1).unwrap().windows();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, 0x03);
        assert_eq!(spans[1].fields[0].name, "Light distribution type");
    }

    #[test]
    fn test_unknown_bank() {
        assert!(layout(7).is_none());
        assert_eq!(
            layout(205).unwrap().field(0x0F).map(|f| f.kind),
            Some(FieldKind::Bool)
        );
    }
}
