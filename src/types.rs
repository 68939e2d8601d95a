use anyhow::{anyhow, bail, Result};

/// Highest score the kernel can record. Result slots are indexed by score,
/// so every device mirrors `MAX_SCORE + 1` slots per round.
pub const MAX_SCORE: u8 = 40;
pub const SCORE_SLOTS: usize = MAX_SCORE as usize + 1;

/// One result slot, written by the device kernel and read by the host.
///
/// Layout must match the device-side declaration bit for bit: 32 salt bytes,
/// 20 hash bytes, one u32 found flag, packed, 56 bytes total. The kernel only
/// ever raises `found` within a run; the host zeroes the array between runs.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultSlot {
    pub salt: [u8; 32],
    pub hash: [u8; 20],
    pub found: u32,
}

impl ResultSlot {
    pub const BYTES: usize = 56;
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

pub fn decode_hex(input: &str, what: &str) -> Result<Vec<u8>> {
    let stripped = input.strip_prefix("0x").unwrap_or(input);
    if stripped.len() % 2 != 0 {
        bail!("{what} has an odd number of hex digits");
    }

    let mut out = Vec::with_capacity(stripped.len() / 2);
    let digits: Vec<char> = stripped.chars().collect();
    for pair in digits.chunks(2) {
        let hi = nibble_value(pair[0])
            .ok_or_else(|| anyhow!("{what} contains a non-hex character '{}'", pair[0]))?;
        let lo = nibble_value(pair[1])
            .ok_or_else(|| anyhow!("{what} contains a non-hex character '{}'", pair[1]))?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

/// Value of a single hex digit, or `None` for anything else.
pub fn nibble_value(c: char) -> Option<u8> {
    c.to_digit(16).map(|v| v as u8)
}
