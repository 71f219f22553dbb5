//! Transmitter port selection
//!
//! Daemons with several IR emitters select the active ones with a bit mask:
//! bit *i* set means port *i + 1* is active. On the wire the mask is a
//! lowercase hexadecimal token of minimal width (`0` selects no port).

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Widest mask the daemon accepts
pub const MAX_PORTS: usize = 32;

/// Port count assumed when none is configured
pub const DEFAULT_PORT_COUNT: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransmitterError {
    #[error("Transmitter {port} out of range (1..={port_count})")]
    OutOfRange { port: u32, port_count: usize },

    #[error("Mask width {actual} does not match port count {expected}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("Unsupported port count {0} (1..={max})", max = MAX_PORTS)]
    BadPortCount(usize),

    #[error("Invalid transmitter mask token: {0:?}")]
    BadToken(String),
}

/// Active transmitter ports as a fixed-width bit vector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransmitterMask {
    bits: u32,
    width: usize,
}

impl TransmitterMask {
    /// Mask selecting no port
    pub fn none(width: usize) -> Result<Self, TransmitterError> {
        check_width(width)?;
        Ok(Self { bits: 0, width })
    }

    /// Mask selecting every port
    pub fn all(width: usize) -> Result<Self, TransmitterError> {
        check_width(width)?;
        Ok(Self {
            bits: width_bits(width),
            width,
        })
    }

    /// Build a mask from 1-based port numbers
    pub fn from_ports<I>(ports: I, width: usize) -> Result<Self, TransmitterError>
    where
        I: IntoIterator<Item = u32>,
    {
        check_width(width)?;
        let mut bits = 0u32;
        for port in ports {
            if port == 0 || port as usize > width {
                return Err(TransmitterError::OutOfRange {
                    port,
                    port_count: width,
                });
            }
            bits |= 1 << (port - 1);
        }
        Ok(Self { bits, width })
    }

    /// Build a mask from raw bits; bits above `width` are rejected
    pub fn from_bits(bits: u32, width: usize) -> Result<Self, TransmitterError> {
        check_width(width)?;
        let extra = bits & !width_bits(width);
        if extra != 0 {
            return Err(TransmitterError::OutOfRange {
                port: extra.trailing_zeros() + 1,
                port_count: width,
            });
        }
        Ok(Self { bits, width })
    }

    /// Parse the hexadecimal wire token
    pub fn from_wire(token: &str, width: usize) -> Result<Self, TransmitterError> {
        let digits = token.strip_prefix("0x").unwrap_or(token);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TransmitterError::BadToken(token.to_string()));
        }
        let bits = u32::from_str_radix(digits, 16)
            .map_err(|_| TransmitterError::BadToken(token.to_string()))?;
        Self::from_bits(bits, width)
    }

    /// Minimal lowercase hexadecimal token
    pub fn to_wire(&self) -> String {
        format!("{:x}", self.bits)
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn contains(&self, port: u32) -> bool {
        port >= 1 && port as usize <= self.width && self.bits & (1 << (port - 1)) != 0
    }

    /// Active 1-based port numbers
    pub fn ports(&self) -> BTreeSet<u32> {
        (1..=self.width as u32).filter(|&p| self.contains(p)).collect()
    }

    pub fn ensure_width(&self, expected: usize) -> Result<(), TransmitterError> {
        if self.width != expected {
            return Err(TransmitterError::WidthMismatch {
                expected,
                actual: self.width,
            });
        }
        Ok(())
    }
}

impl fmt::Display for TransmitterMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

fn check_width(width: usize) -> Result<(), TransmitterError> {
    if width == 0 || width > MAX_PORTS {
        return Err(TransmitterError::BadPortCount(width));
    }
    Ok(())
}

fn width_bits(width: usize) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}
