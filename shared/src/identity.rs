//! Device identity (IMEI) decoding

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of BCD-packed bytes carrying an identity on the wire
pub const BCD_LEN: usize = 8;

/// Number of decimal digits in an identity
pub const IMEI_DIGITS: usize = 15;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identity needs {BCD_LEN} BCD bytes, got {0}")]
    WrongBcdLength(usize),

    #[error("Invalid BCD nibble {0:#x} at digit {1}")]
    InvalidNibble(u8, usize),

    #[error("Identity must be {IMEI_DIGITS} decimal digits: {0:?}")]
    Malformed(String),
}

/// A 15-digit device identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Decode an identity from 8 BCD-packed bytes
    ///
    /// Sixteen digits come off the wire. A leading zero is dropped, otherwise
    /// the first fifteen digits are kept.
    pub fn from_bcd(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != BCD_LEN {
            return Err(IdentityError::WrongBcdLength(bytes.len()));
        }

        let mut digits = String::with_capacity(BCD_LEN * 2);
        for (i, byte) in bytes.iter().enumerate() {
            for (j, nibble) in [byte >> 4, byte & 0x0F].into_iter().enumerate() {
                if nibble > 9 {
                    return Err(IdentityError::InvalidNibble(nibble, i * 2 + j));
                }
                digits.push(char::from(b'0' + nibble));
            }
        }

        if digits.starts_with('0') {
            digits.remove(0);
        } else {
            digits.truncate(IMEI_DIGITS);
        }

        Ok(Self(digits))
    }

    /// Parse a textual identity, e.g. from an operator command
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.len() == IMEI_DIGITS && s.bytes().all(|b| b.is_ascii_digit()) {
            Ok(Self(s.to_string()))
        } else {
            Err(IdentityError::Malformed(s.to_string()))
        }
    }

    /// Wire form: a zero nibble followed by the fifteen digits
    pub fn to_bcd(&self) -> [u8; BCD_LEN] {
        let mut nibbles = [0u8; BCD_LEN * 2];
        for (slot, digit) in nibbles[1..].iter_mut().zip(self.0.bytes()) {
            *slot = digit - b'0';
        }

        let mut out = [0u8; BCD_LEN];
        for (i, pair) in nibbles.chunks_exact(2).enumerate() {
            out[i] = (pair[0] << 4) | pair[1];
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing `n` digits, used for synthesized vehicle numbers
    pub fn suffix(&self, n: usize) -> &str {
        &self.0[self.0.len().saturating_sub(n)..]
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
