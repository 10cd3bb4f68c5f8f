//! # Decimal
//!
//! A 96-bit scaled decimal in the 16-byte layout used on the wire:
//!
//! ```text
//! [lo u32 LE] [mid u32 LE] [hi u32 LE] [flags u32 LE]
//! flags: bits 16..=23 scale (0..=28), bit 31 sign, all other bits zero
//! ```
//!
//! Equality is structural: `1.0` and `1.00` carry different scales and are
//! not equal.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Largest scale the format can carry
pub const MAX_SCALE: u8 = 28;

const MANTISSA_MAX: u128 = (1u128 << 96) - 1;
const SCALE_SHIFT: u32 = 16;
const SCALE_MASK: u32 = 0x00FF_0000;
const SIGN_MASK: u32 = 0x8000_0000;

/// Fixed-point decimal: `(-1)^negative * mantissa / 10^scale`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal {
    mantissa: u128,
    scale: u8,
    negative: bool,
}

impl Decimal {
    pub const ZERO: Decimal = Decimal {
        mantissa: 0,
        scale: 0,
        negative: false,
    };

    /// Build from a signed mantissa and a scale
    pub fn new(mantissa: i128, scale: u8) -> Result<Self> {
        Self::from_parts(mantissa.unsigned_abs(), scale, mantissa < 0)
    }

    /// Build from magnitude, scale and sign
    pub fn from_parts(mantissa: u128, scale: u8, negative: bool) -> Result<Self> {
        if mantissa > MANTISSA_MAX {
            return Err(ProtocolError::InvalidDecimal(format!(
                "mantissa {mantissa} exceeds 96 bits"
            )));
        }
        if scale > MAX_SCALE {
            return Err(ProtocolError::InvalidDecimal(format!(
                "scale {scale} exceeds {MAX_SCALE}"
            )));
        }
        Ok(Self {
            mantissa,
            scale,
            negative,
        })
    }

    /// Signed mantissa
    pub fn mantissa(&self) -> i128 {
        // At most 96 bits, always fits
        let magnitude = self.mantissa as i128;
        if self.negative {
            -magnitude
        } else {
            magnitude
        }
    }

    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.mantissa == 0
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let lo = self.mantissa as u32;
        let mid = (self.mantissa >> 32) as u32;
        let hi = (self.mantissa >> 64) as u32;
        let mut flags = u32::from(self.scale) << SCALE_SHIFT;
        if self.negative {
            flags |= SIGN_MASK;
        }

        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&lo.to_le_bytes());
        out[4..8].copy_from_slice(&mid.to_le_bytes());
        out[8..12].copy_from_slice(&hi.to_le_bytes());
        out[12..16].copy_from_slice(&flags.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Result<Self> {
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let (lo, mid, hi, flags) = (word(0), word(4), word(8), word(12));

        if flags & !(SCALE_MASK | SIGN_MASK) != 0 {
            return Err(ProtocolError::InvalidDecimal(format!(
                "reserved flag bits set: {flags:#010x}"
            )));
        }
        let scale = ((flags & SCALE_MASK) >> SCALE_SHIFT) as u8;
        let mantissa = u128::from(lo) | (u128::from(mid) << 32) | (u128::from(hi) << 64);
        Self::from_parts(mantissa, scale, flags & SIGN_MASK != 0)
    }
}

impl From<i64> for Decimal {
    fn from(value: i64) -> Self {
        Self {
            mantissa: u128::from(value.unsigned_abs()),
            scale: 0,
            negative: value < 0,
        }
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.mantissa.to_string();
        let scale = usize::from(self.scale);
        let sign = if self.negative && self.mantissa != 0 {
            "-"
        } else {
            ""
        };

        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

impl FromStr for Decimal {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ProtocolError::InvalidDecimal(format!("cannot parse '{s}'"));

        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }

        let scale = u8::try_from(frac_part.len()).map_err(|_| invalid())?;
        let mut mantissa: u128 = 0;
        for b in int_part.bytes().chain(frac_part.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(u128::from(b - b'0')))
                .ok_or_else(invalid)?;
        }
        Self::from_parts(mantissa, scale, negative)
    }
}
