//! IR signal representations
//!
//! Raw infrared signals are carried as alternating pulse/space durations in
//! microseconds. The [`waveform`] module converts between that representation
//! and the textual and binary forms used by IR daemons and capture devices.

pub mod waveform;

pub use waveform::{Capture, CaptureBuilder, Mode2Record, PulseSpace, Termination, WaveformError};
