//! # Wire Codec Module
//!
//! Fixed-point encodings used by the LoggingScale firmware.
//!
//! Mass values travel as a signed little-endian 16-bit integer holding grams × 10,
//! which gives one decimal place over roughly ±3276.7 g. Flags are a single byte
//! where any non-zero value is true.

use crate::error::CodecError;
use std::fmt;

/// Scale factor between grams and the integer on the wire
const FIXED_POINT_SCALE: f32 = 10.0;

pub const TARE_OPCODE: u8 = 0x01;
pub const CYCLE_START_OPCODE: u8 = 0x01;
pub const CYCLE_STOP_OPCODE: u8 = 0x00;
pub const LOGGING_ENABLE_OPCODE: u8 = 0x01;
pub const LOGGING_DISABLE_OPCODE: u8 = 0x00;

/// A mass in grams with one decimal place of meaningful precision
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Grams(pub f32);

impl Grams {
    pub const ZERO: Grams = Grams(0.0);
}

impl fmt::Display for Grams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.0)
    }
}

/// Decode a fixed-point mass.
///
/// Only the first two bytes are read; anything after them is ignored.
pub fn decode_fixed_point_mass(bytes: &[u8]) -> Result<Grams, CodecError> {
    match bytes {
        [lo, hi, ..] => {
            let raw = i16::from_le_bytes([*lo, *hi]);
            Ok(Grams(raw as f32 / FIXED_POINT_SCALE))
        }
        _ => Err(CodecError::ShortPayload(bytes.len())),
    }
}

/// Encode a mass for the wire.
///
/// Values outside the i16 range wrap (two's-complement truncation), NaN encodes as 0.
pub fn encode_fixed_point_mass(grams: Grams) -> [u8; 2] {
    // f32 -> i64 saturates, i64 -> i16 truncates
    let scaled = (grams.0 * FIXED_POINT_SCALE).round() as i64;
    (scaled as i16).to_le_bytes()
}

pub fn decode_boolean_flag(bytes: &[u8]) -> Result<bool, CodecError> {
    bytes
        .first()
        .map(|b| *b != 0)
        .ok_or(CodecError::EmptyPayload)
}
