//! Decoded button events
//!
//! The daemon broadcasts every decoded key press to its clients as
//! `<code> <repeat> <button> <remote>`, for example
//! `0000000000f40bf0 00 KEY_UP tv`. The same line, split into arguments,
//! is what `simulate` injects.

use std::fmt;
use std::str::FromStr;

use crate::lirc::protocol::FrameError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonEvent {
    /// Scan code as decoded by the daemon
    pub code: u64,
    /// Repeat counter, 0 for the initial press
    pub repeat: u32,
    pub button: String,
    pub remote: String,
}

impl ButtonEvent {
    pub fn new(remote: impl Into<String>, button: impl Into<String>, code: u64, repeat: u32) -> Self {
        Self {
            code,
            repeat,
            button: button.into(),
            remote: remote.into(),
        }
    }

    /// Code as 16 hex digits
    pub fn code_token(&self) -> String {
        format!("{:016x}", self.code)
    }

    /// Repeat counter as (at least) 2 hex digits
    pub fn repeat_token(&self) -> String {
        format!("{:02x}", self.repeat)
    }
}

impl fmt::Display for ButtonEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.code_token(),
            self.repeat_token(),
            self.button,
            self.remote
        )
    }
}

impl FromStr for ButtonEvent {
    type Err = FrameError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bad = || FrameError::BadEvent(line.to_string());

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [code, repeat, button, remote] = fields.as_slice() else {
            return Err(bad());
        };

        Ok(Self {
            code: u64::from_str_radix(code, 16).map_err(|_| bad())?,
            repeat: u32::from_str_radix(repeat, 16).map_err(|_| bad())?,
            button: button.to_string(),
            remote: remote.to_string(),
        })
    }
}
