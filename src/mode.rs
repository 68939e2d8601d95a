use anyhow::{bail, Result};

use crate::types::nibble_value;

/// Scoring function selector. Declaration order is ABI: the device kernel
/// switches on the little-endian u32 tag, so variants must never be
/// reordered.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreFunction {
    Benchmark = 0,
    ZeroBytes,
    Matching,
    Leading,
    Range,
    Mirror,
    Doubles,
    LeadingRange,
}

/// Scoring-mode descriptor uploaded verbatim to every device.
///
/// `data1`/`data2` are interpreted per function: a nibble mask and expected
/// nibble values for `Matching`, inclusive min/max in the first byte for
/// `Range` and `LeadingRange`, the leading nibble in `data1[0]` for
/// `Leading`. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub function: ScoreFunction,
    pub data1: [u8; 20],
    pub data2: [u8; 20],
}

const MAX_PATTERN_NIBBLES: usize = 40;

impl Mode {
    pub const DEVICE_BYTES: usize = 44;

    fn with_function(function: ScoreFunction) -> Self {
        Self {
            function,
            data1: [0u8; 20],
            data2: [0u8; 20],
        }
    }

    pub fn benchmark() -> Self {
        Self::with_function(ScoreFunction::Benchmark)
    }

    pub fn zero_bytes() -> Self {
        Self::with_function(ScoreFunction::ZeroBytes)
    }

    pub fn zeros() -> Self {
        Self::range(0, 0).expect("0..=0 is a valid range")
    }

    pub fn letters() -> Self {
        Self::range(10, 15).expect("10..=15 is a valid range")
    }

    pub fn numbers() -> Self {
        Self::range(0, 9).expect("0..=9 is a valid range")
    }

    pub fn mirror() -> Self {
        Self::with_function(ScoreFunction::Mirror)
    }

    pub fn doubles() -> Self {
        Self::with_function(ScoreFunction::Doubles)
    }

    pub fn leading(c: char) -> Result<Self> {
        let Some(nibble) = nibble_value(c) else {
            bail!("leading character '{c}' is not a hex digit");
        };
        let mut mode = Self::with_function(ScoreFunction::Leading);
        mode.data1[0] = nibble;
        Ok(mode)
    }

    /// Nibble-by-nibble pattern match against the address. Any non-hex
    /// character in the pattern is a wildcard: its mask nibble stays zero.
    pub fn matching(pattern: &str) -> Result<Self> {
        let nibbles: Vec<char> = pattern.chars().collect();
        if nibbles.len() > MAX_PATTERN_NIBBLES {
            bail!(
                "matching pattern is {} nibbles, at most {MAX_PATTERN_NIBBLES} fit in an address",
                nibbles.len()
            );
        }

        let mut mode = Self::with_function(ScoreFunction::Matching);
        for (index, pair) in nibbles.chunks(2).enumerate() {
            let hi = nibble_value(pair[0]);
            let lo = pair.get(1).copied().and_then(nibble_value);

            let mask_hi = if hi.is_some() { 0xf0 } else { 0 };
            let mask_lo = if lo.is_some() { 0x0f } else { 0 };

            mode.data1[index] = mask_hi | mask_lo;
            mode.data2[index] = (hi.unwrap_or(0) << 4) | lo.unwrap_or(0);
        }
        Ok(mode)
    }

    pub fn range(min: u8, max: u8) -> Result<Self> {
        let mut mode = Self::with_function(ScoreFunction::Range);
        let (min, max) = checked_bounds(min, max)?;
        mode.data1[0] = min;
        mode.data2[0] = max;
        Ok(mode)
    }

    pub fn leading_range(min: u8, max: u8) -> Result<Self> {
        let mut mode = Self::with_function(ScoreFunction::LeadingRange);
        let (min, max) = checked_bounds(min, max)?;
        mode.data1[0] = min;
        mode.data2[0] = max;
        Ok(mode)
    }

    /// Wire representation consumed by the kernel: LE u32 tag, then both
    /// parameter arrays, 44 bytes, no padding.
    pub fn device_bytes(&self) -> [u8; Self::DEVICE_BYTES] {
        let mut out = [0u8; Self::DEVICE_BYTES];
        out[..4].copy_from_slice(&(self.function as u32).to_le_bytes());
        out[4..24].copy_from_slice(&self.data1);
        out[24..44].copy_from_slice(&self.data2);
        out
    }
}

fn checked_bounds(min: u8, max: u8) -> Result<(u8, u8)> {
    if min > 15 || max > 15 {
        bail!("range bounds are nibble values, 0 through 15");
    }
    if min > max {
        bail!("range minimum {min} exceeds maximum {max}");
    }
    Ok((min, max))
}
