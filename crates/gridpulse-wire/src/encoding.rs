//! Negotiated text encodings.
//!
//! UTF-16 variants are deprecated on the wire but still accepted; code units
//! are always transmitted as two bytes regardless of host wide-char size.

use crate::commands::{operational_encoding, operational_modes};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf16Le,
    Utf16Be,
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding::Utf8
    }
}

impl TextEncoding {
    /// Derive the encoding from a negotiated operational-modes word.
    /// Returns `None` for an unrecognized encoding-mask value; callers fall
    /// back to UTF-8 with a warning.
    pub fn from_modes(modes: u32) -> Option<Self> {
        match modes & operational_modes::ENCODING_MASK {
            operational_encoding::UTF8 => Some(TextEncoding::Utf8),
            operational_encoding::UTF16LE => Some(TextEncoding::Utf16Le),
            operational_encoding::UTF16BE => Some(TextEncoding::Utf16Be),
            _ => None,
        }
    }

    /// Encoded size of one character, used when estimating string buffers.
    pub fn char_size(&self) -> u32 {
        match self {
            TextEncoding::Utf8 => 1,
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => 2,
        }
    }

    pub fn decode(&self, data: &[u8]) -> Result<String> {
        match self {
            TextEncoding::Utf8 => String::from_utf8(data.to_vec())
                .map_err(|err| Error::InvalidString(err.to_string())),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                if data.len() % 2 != 0 {
                    return Err(Error::InvalidString(
                        "UTF-16 payload has odd byte length".into(),
                    ));
                }
                let units: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|pair| match self {
                        TextEncoding::Utf16Be => u16::from_be_bytes([pair[0], pair[1]]),
                        _ => u16::from_le_bytes([pair[0], pair[1]]),
                    })
                    .collect();
                String::from_utf16(&units).map_err(|err| Error::InvalidString(err.to_string()))
            }
        }
    }

    pub fn encode(&self, value: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => value.as_bytes().to_vec(),
            TextEncoding::Utf16Le | TextEncoding::Utf16Be => {
                let mut result = Vec::with_capacity(value.len() * 2);
                for unit in value.encode_utf16() {
                    let bytes = match self {
                        TextEncoding::Utf16Be => unit.to_be_bytes(),
                        _ => unit.to_le_bytes(),
                    };
                    result.extend_from_slice(&bytes);
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::operational_modes::ENCODING_MASK;

    #[test]
    fn round_trips_all_encodings() {
        let value = "FILTER ActiveMeasurements WHERE SignalType='FREQ' — π";
        for encoding in [TextEncoding::Utf8, TextEncoding::Utf16Le, TextEncoding::Utf16Be] {
            let encoded = encoding.encode(value);
            assert_eq!(encoding.decode(&encoded).expect("decode"), value);
        }
    }

    #[test]
    fn utf16_uses_two_bytes_per_unit() {
        let encoded = TextEncoding::Utf16Le.encode("abc");
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], b'a');
        assert_eq!(encoded[1], 0);
    }

    #[test]
    fn derives_from_modes_with_unknown_fallback() {
        assert_eq!(TextEncoding::from_modes(0x02), Some(TextEncoding::Utf8));
        assert_eq!(
            TextEncoding::from_modes(0x0100),
            Some(TextEncoding::Utf16Le)
        );
        assert_eq!(
            TextEncoding::from_modes(0x0200),
            Some(TextEncoding::Utf16Be)
        );
        assert_eq!(TextEncoding::from_modes(ENCODING_MASK), None);
    }

    #[test]
    fn rejects_odd_utf16_payload() {
        assert!(TextEncoding::Utf16Le.decode(&[0x61, 0x00, 0x62]).is_err());
    }
}
