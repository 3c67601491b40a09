//! Wide unsigned integer normalization at the encode boundary.
//!
//! Callers hand over balances and ids as decimal strings, hex strings,
//! 256-bit little-endian buffers or native integers. Every encode goes through
//! [`encode_uint`], which normalizes the input and checks it fits the target
//! width before producing SCALE bytes. Nothing here touches shared codec state.

use parity_scale_codec::{Compact, Encode};
use subxt::dynamic::Value;
use subxt::ext::scale_value::{Primitive, ValueDef};

use crate::error::ChainError;

/// An unsigned integer in any of the shapes callers supply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WideUint {
    /// Decimal digits or `0x`-prefixed hex.
    Text(String),
    /// 256-bit little-endian.
    Big([u8; 32]),
    Native(u128),
}

/// Target width of a fixed-size unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UintWidth {
    U32,
    U64,
    U128,
    U256,
}

impl UintWidth {
    pub fn bytes(&self) -> usize {
        match self {
            UintWidth::U32 => 4,
            UintWidth::U64 => 8,
            UintWidth::U128 => 16,
            UintWidth::U256 => 32,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UintWidth::U32 => "u32",
            UintWidth::U64 => "u64",
            UintWidth::U128 => "u128",
            UintWidth::U256 => "u256",
        }
    }
}

impl From<u128> for WideUint {
    fn from(v: u128) -> Self {
        WideUint::Native(v)
    }
}

impl From<u64> for WideUint {
    fn from(v: u64) -> Self {
        WideUint::Native(v as u128)
    }
}

impl From<u32> for WideUint {
    fn from(v: u32) -> Self {
        WideUint::Native(v as u128)
    }
}

impl From<&str> for WideUint {
    fn from(v: &str) -> Self {
        WideUint::Text(v.to_string())
    }
}

impl WideUint {
    /// Normalize to 32 little-endian bytes.
    pub fn to_le_bytes(&self) -> Result<[u8; 32], ChainError> {
        match self {
            WideUint::Native(v) => {
                let mut out = [0u8; 32];
                out[..16].copy_from_slice(&v.to_le_bytes());
                Ok(out)
            }
            WideUint::Big(bytes) => Ok(*bytes),
            WideUint::Text(text) => parse_text(text),
        }
    }

    /// The value as a `u128`, if it fits.
    pub fn as_u128(&self) -> Result<u128, ChainError> {
        let bytes = self.to_le_bytes()?;
        if bytes[16..].iter().any(|b| *b != 0) {
            return Err(ChainError::Overflow("u128"));
        }
        let mut low = [0u8; 16];
        low.copy_from_slice(&bytes[..16]);
        Ok(u128::from_le_bytes(low))
    }

    /// Convert to a dynamic value: `u128` when it fits, `U256` otherwise.
    pub fn to_value(&self) -> Result<Value, ChainError> {
        let bytes = self.to_le_bytes()?;
        if bytes[16..].iter().all(|b| *b == 0) {
            return self.as_u128().map(Value::u128);
        }
        Ok(Value {
            value: ValueDef::Primitive(Primitive::U256(bytes)),
            context: (),
        })
    }
}

fn parse_text(text: &str) -> Result<[u8; 32], ChainError> {
    let trimmed = text.trim();
    if let Some(hex_digits) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return parse_hex(hex_digits);
    }
    parse_decimal(trimmed)
}

fn parse_hex(digits: &str) -> Result<[u8; 32], ChainError> {
    let digits = digits.trim_start_matches('0');
    if digits.len() > 64 {
        return Err(ChainError::Overflow("u256"));
    }
    let padded = if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits.to_string()
    };
    let be = hex::decode(&padded)
        .map_err(|e| ChainError::InvalidData(format!("Invalid hex integer: {}", e)))?;

    let mut out = [0u8; 32];
    for (i, b) in be.iter().rev().enumerate() {
        out[i] = *b;
    }
    Ok(out)
}

fn parse_decimal(digits: &str) -> Result<[u8; 32], ChainError> {
    if digits.is_empty() {
        return Err(ChainError::InvalidData("Empty integer".into()));
    }

    // Little-endian 64-bit limbs.
    let mut limbs = [0u64; 4];
    for c in digits.chars() {
        let digit = c
            .to_digit(10)
            .ok_or_else(|| ChainError::InvalidData(format!("Invalid decimal integer: {}", digits)))?;

        let mut carry = digit as u128;
        for limb in limbs.iter_mut() {
            let acc = (*limb as u128) * 10 + carry;
            *limb = acc as u64;
            carry = acc >> 64;
        }
        if carry != 0 {
            return Err(ChainError::Overflow("u256"));
        }
    }

    let mut out = [0u8; 32];
    for (i, limb) in limbs.iter().enumerate() {
        out[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_le_bytes());
    }
    Ok(out)
}

/// SCALE-encode `value` as a fixed-width or compact unsigned integer.
pub fn encode_uint(value: &WideUint, width: UintWidth, compact: bool) -> Result<Vec<u8>, ChainError> {
    let bytes = value.to_le_bytes()?;
    let n = width.bytes();
    if bytes[n..].iter().any(|b| *b != 0) {
        return Err(ChainError::Overflow(width.name()));
    }

    if !compact {
        return Ok(bytes[..n].to_vec());
    }

    match width {
        UintWidth::U32 => {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&bytes[..4]);
            Ok(Compact(u32::from_le_bytes(buf)).encode())
        }
        UintWidth::U64 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            Ok(Compact(u64::from_le_bytes(buf)).encode())
        }
        UintWidth::U128 => Ok(Compact(value.as_u128()?).encode()),
        UintWidth::U256 => {
            if bytes[16..].iter().all(|b| *b == 0) {
                return Ok(Compact(value.as_u128()?).encode());
            }
            Ok(encode_big_compact(&bytes))
        }
    }
}

/// Compact big-integer mode: length prefix then the significant bytes.
fn encode_big_compact(le: &[u8; 32]) -> Vec<u8> {
    let significant = le
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0)
        .max(4);

    let mut out = Vec::with_capacity(significant + 1);
    out.push((((significant - 4) as u8) << 2) | 0b11);
    out.extend_from_slice(&le[..significant]);
    out
}
