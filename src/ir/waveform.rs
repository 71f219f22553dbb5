//! Pulse/space waveform codec
//!
//! Two wire forms are supported:
//!
//! - Token text: an optional carrier header followed by decimal durations,
//!   separated by whitespace or newlines:
//!   ```text
//!   f=38000
//!   9024 4512 564 564 564 1692
//!   564
//!   ```
//! - mode2: the record stream produced by kernel IR receivers, either as
//!   text lines (`pulse 564`, `space 1692`, `carrier 38000`, `timeout 30000`)
//!   or as 32-bit little-endian words with the record type in the high byte
//!   and the value in the low 24 bits.

use std::ops::RangeInclusive;

use thiserror::Error;
use tracing::warn;

/// Carrier assumed when a capture carries no frequency information
pub const DEFAULT_CARRIER_HZ: u32 = 38_000;

/// Carrier frequencies used by consumer IR remotes
pub const TYPICAL_CARRIER_RANGE: RangeInclusive<u32> = 30_000..=60_000;

/// Durations per line when encoding token text
pub const TOKENS_PER_LINE: usize = 6;

const CARRIER_PREFIX: &str = "f=";

const MODE2_VALUE_MASK: u32 = 0x00ff_ffff;
const MODE2_SPACE: u8 = 0x00;
const MODE2_PULSE: u8 = 0x01;
const MODE2_FREQUENCY: u8 = 0x02;
const MODE2_TIMEOUT: u8 = 0x03;

/// Waveform parsing and validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaveformError {
    #[error("Not a decimal duration: {0:?}")]
    NotNumeric(String),

    #[error("Negative duration: {0:?}")]
    Negative(String),

    #[error("Duration out of range: {0:?}")]
    Overflow(String),

    #[error("Waveform contains no durations")]
    Empty,

    #[error("Invalid carrier frequency: {0:?}")]
    BadCarrier(String),

    #[error("Sequence of length {len} cannot be terminated by {termination:?}")]
    TerminationMismatch { len: usize, termination: Termination },

    #[error("Truncated mode2 data: {0} trailing bytes")]
    TruncatedWord(usize),

    #[error("Unknown mode2 record type {0:#04x}")]
    UnknownRecord(u8),

    #[error("Malformed mode2 line: {0:?}")]
    BadMode2Line(String),
}

/// How a pulse/space sequence ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Odd length: the last duration is a pulse
    Pulse,
    /// Even length: the last duration is a space
    TrailingGap,
}

impl Termination {
    fn for_len(len: usize) -> Self {
        if len % 2 == 1 {
            Termination::Pulse
        } else {
            Termination::TrailingGap
        }
    }
}

/// Alternating pulse/space durations in microseconds, starting with a pulse
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseSpace {
    durations: Vec<u32>,
    termination: Termination,
}

impl PulseSpace {
    /// Create a sequence that ends in a pulse (odd length)
    pub fn new(durations: Vec<u32>) -> Result<Self, WaveformError> {
        Self::with_termination(durations, Termination::Pulse)
    }

    /// Create a sequence that ends in a trailing gap (even length)
    pub fn with_trailing_gap(durations: Vec<u32>) -> Result<Self, WaveformError> {
        Self::with_termination(durations, Termination::TrailingGap)
    }

    /// Create a sequence, deriving the termination from its length
    pub fn from_durations(durations: Vec<u32>) -> Result<Self, WaveformError> {
        let termination = Termination::for_len(durations.len());
        Self::with_termination(durations, termination)
    }

    fn with_termination(
        durations: Vec<u32>,
        termination: Termination,
    ) -> Result<Self, WaveformError> {
        if durations.is_empty() {
            return Err(WaveformError::Empty);
        }
        if Termination::for_len(durations.len()) != termination {
            return Err(WaveformError::TerminationMismatch {
                len: durations.len(),
                termination,
            });
        }
        Ok(Self {
            durations,
            termination,
        })
    }

    pub fn durations(&self) -> &[u32] {
        &self.durations
    }

    pub fn into_durations(self) -> Vec<u32> {
        self.durations
    }

    pub fn termination(&self) -> Termination {
        self.termination
    }

    pub fn ends_in_gap(&self) -> bool {
        self.termination == Termination::TrailingGap
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// Always false; a sequence holds at least one pulse
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Iterate `(pulse, space)` pairs; the final space is `None` for odd sequences
    pub fn pairs(&self) -> impl Iterator<Item = (u32, Option<u32>)> + '_ {
        self.durations
            .chunks(2)
            .map(|pair| (pair[0], pair.get(1).copied()))
    }

    pub fn total_duration_us(&self) -> u64 {
        self.durations.iter().map(|&d| u64::from(d)).sum()
    }
}

/// A captured or decoded signal together with its carrier frequency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub carrier_hz: u32,
    pub signal: PulseSpace,
}

impl Capture {
    pub fn new(carrier_hz: u32, signal: PulseSpace) -> Self {
        Self { carrier_hz, signal }
    }

    /// Signal at the default carrier
    pub fn unmodulated(signal: PulseSpace) -> Self {
        Self::new(DEFAULT_CARRIER_HZ, signal)
    }
}

/// Parse a single decimal microsecond token
pub fn parse_duration(token: &str) -> Result<u32, WaveformError> {
    let digits = token.strip_prefix('+').unwrap_or(token);
    if digits.starts_with('-') {
        return Err(WaveformError::Negative(token.to_string()));
    }
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(WaveformError::NotNumeric(token.to_string()));
    }
    digits
        .parse::<u32>()
        .map_err(|_| WaveformError::Overflow(token.to_string()))
}

/// Parse a carrier frequency in Hz; zero is rejected
pub fn parse_carrier(value: &str) -> Result<u32, WaveformError> {
    match value.parse::<u32>() {
        Ok(hz) if hz > 0 => {
            check_carrier_range(hz);
            Ok(hz)
        }
        _ => Err(WaveformError::BadCarrier(value.to_string())),
    }
}

fn check_carrier_range(hz: u32) {
    if !TYPICAL_CARRIER_RANGE.contains(&hz) {
        warn!("Carrier frequency {} Hz outside typical IR range", hz);
    }
}

/// Decode token text into a capture
///
/// A missing carrier header yields [`DEFAULT_CARRIER_HZ`].
pub fn decode(text: &str) -> Result<Capture, WaveformError> {
    decode_lines(text.lines())
}

/// Decode token text given as separate lines
pub fn decode_lines<I, S>(lines: I) -> Result<Capture, WaveformError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut carrier = None;
    let mut durations = Vec::new();

    for line in lines {
        for token in line.as_ref().split_whitespace() {
            if let Some(value) = token.strip_prefix(CARRIER_PREFIX) {
                if carrier.is_some() || !durations.is_empty() {
                    return Err(WaveformError::BadCarrier(token.to_string()));
                }
                carrier = Some(parse_carrier(value)?);
                continue;
            }
            durations.push(parse_duration(token)?);
        }
    }

    let signal = PulseSpace::from_durations(durations)?;
    Ok(Capture::new(carrier.unwrap_or(DEFAULT_CARRIER_HZ), signal))
}

/// Encode a capture as token text lines
pub fn encode(capture: &Capture) -> Vec<String> {
    let mut lines = Vec::with_capacity(1 + capture.signal.len().div_ceil(TOKENS_PER_LINE));
    lines.push(format!("{}{}", CARRIER_PREFIX, capture.carrier_hz));
    for chunk in capture.signal.durations().chunks(TOKENS_PER_LINE) {
        let line = chunk
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(line);
    }
    lines
}

/// Encode a capture as newline-terminated token text
pub fn encode_to_string(capture: &Capture) -> String {
    let mut text = encode(capture).join("\n");
    text.push('\n');
    text
}

/// One mode2 record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode2Record {
    Pulse(u32),
    Space(u32),
    Frequency(u32),
    Timeout(u32),
}

impl Mode2Record {
    /// Parse a mode2 text line; blank lines and `#` comments yield `None`
    pub fn parse_line(line: &str) -> Result<Option<Self>, WaveformError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut parts = line.split_whitespace();
        let (Some(kind), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(WaveformError::BadMode2Line(line.to_string()));
        };

        let record = match kind {
            "pulse" => Mode2Record::Pulse(parse_duration(value)?),
            "space" => Mode2Record::Space(parse_duration(value)?),
            "carrier" => Mode2Record::Frequency(parse_carrier(value)?),
            "timeout" => Mode2Record::Timeout(parse_duration(value)?),
            _ => return Err(WaveformError::BadMode2Line(line.to_string())),
        };
        Ok(Some(record))
    }

    pub fn from_word(word: u32) -> Result<Self, WaveformError> {
        let value = word & MODE2_VALUE_MASK;
        match (word >> 24) as u8 {
            MODE2_SPACE => Ok(Mode2Record::Space(value)),
            MODE2_PULSE => Ok(Mode2Record::Pulse(value)),
            MODE2_FREQUENCY => Ok(Mode2Record::Frequency(value)),
            MODE2_TIMEOUT => Ok(Mode2Record::Timeout(value)),
            other => Err(WaveformError::UnknownRecord(other)),
        }
    }

    /// Values wider than 24 bits saturate
    pub fn to_word(self) -> u32 {
        let (kind, value) = match self {
            Mode2Record::Space(v) => (MODE2_SPACE, v),
            Mode2Record::Pulse(v) => (MODE2_PULSE, v),
            Mode2Record::Frequency(v) => (MODE2_FREQUENCY, v),
            Mode2Record::Timeout(v) => (MODE2_TIMEOUT, v),
        };
        (u32::from(kind) << 24) | value.min(MODE2_VALUE_MASK)
    }
}

/// Accumulates durations into a capture
///
/// Spaces before the first pulse are dropped and consecutive durations of
/// the same kind are merged.
#[derive(Debug, Default)]
pub struct CaptureBuilder {
    carrier_hz: Option<u32>,
    durations: Vec<u32>,
}

impl CaptureBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pulse(&mut self, us: u32) {
        if self.durations.len() % 2 == 1 {
            let last = self.durations.len() - 1;
            self.durations[last] = self.durations[last].saturating_add(us);
        } else {
            self.durations.push(us);
        }
    }

    pub fn push_space(&mut self, us: u32) {
        if self.durations.is_empty() {
            return;
        }
        if self.durations.len() % 2 == 0 {
            let last = self.durations.len() - 1;
            self.durations[last] = self.durations[last].saturating_add(us);
        } else {
            self.durations.push(us);
        }
    }

    pub fn set_carrier(&mut self, hz: u32) -> Result<(), WaveformError> {
        if hz == 0 {
            return Err(WaveformError::BadCarrier(hz.to_string()));
        }
        check_carrier_range(hz);
        self.carrier_hz = Some(hz);
        Ok(())
    }

    /// Apply a record; returns `true` once a timeout record ends the signal
    pub fn push(&mut self, record: Mode2Record) -> Result<bool, WaveformError> {
        match record {
            Mode2Record::Pulse(us) => self.push_pulse(us),
            Mode2Record::Space(us) => self.push_space(us),
            Mode2Record::Frequency(hz) => self.set_carrier(hz)?,
            Mode2Record::Timeout(_) => return Ok(self.has_pulse()),
        }
        Ok(false)
    }

    pub fn has_pulse(&self) -> bool {
        !self.durations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.durations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }

    /// Duration of the trailing space, if the sequence currently ends in one
    pub fn trailing_gap(&self) -> Option<u32> {
        if self.durations.len() % 2 == 0 {
            self.durations.last().copied()
        } else {
            None
        }
    }

    /// Build the capture; `None` when no pulse was seen
    pub fn finish(self) -> Option<Capture> {
        let carrier_hz = self.carrier_hz.unwrap_or(DEFAULT_CARRIER_HZ);
        PulseSpace::from_durations(self.durations)
            .ok()
            .map(|signal| Capture::new(carrier_hz, signal))
    }
}

/// Decode mode2 binary words (little-endian)
pub fn decode_mode2_binary(bytes: &[u8]) -> Result<Capture, WaveformError> {
    let words = bytes.chunks_exact(4);
    if !words.remainder().is_empty() {
        return Err(WaveformError::TruncatedWord(words.remainder().len()));
    }

    let mut builder = CaptureBuilder::new();
    for word in words {
        let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        if builder.push(Mode2Record::from_word(word)?)? {
            break;
        }
    }
    builder.finish().ok_or(WaveformError::Empty)
}

/// Encode a capture as mode2 binary words, carrier first
pub fn encode_mode2_binary(capture: &Capture) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 * (capture.signal.len() + 1));
    bytes.extend_from_slice(&Mode2Record::Frequency(capture.carrier_hz).to_word().to_le_bytes());
    for (pulse, space) in capture.signal.pairs() {
        bytes.extend_from_slice(&Mode2Record::Pulse(pulse).to_word().to_le_bytes());
        if let Some(space) = space {
            bytes.extend_from_slice(&Mode2Record::Space(space).to_word().to_le_bytes());
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEC_HEAD: [u32; 7] = [9024, 4512, 564, 564, 564, 1692, 564];

    #[test]
    fn test_decode_with_carrier_header() {
        let capture = decode("f=36000 9024 4512\n564 564\n564").unwrap();
        assert_eq!(capture.carrier_hz, 36000);
        assert_eq!(capture.signal.durations(), &[9024, 4512, 564, 564, 564]);
        assert_eq!(capture.signal.termination(), Termination::Pulse);
    }

    #[test]
    fn test_decode_missing_carrier_uses_default() {
        let capture = decode("9024 4512 564").unwrap();
        assert_eq!(capture.carrier_hz, DEFAULT_CARRIER_HZ);
    }

    #[test]
    fn test_decode_even_length_flags_trailing_gap() {
        let capture = decode_lines(["9024 4512", "564 40000"]).unwrap();
        assert!(capture.signal.ends_in_gap());
        assert_eq!(capture.signal.len(), 4);
    }

    #[test]
    fn test_decode_rejects_negative() {
        let result = decode("9024 -4512 564");
        assert_eq!(result, Err(WaveformError::Negative("-4512".to_string())));
    }

    #[test]
    fn test_decode_rejects_non_numeric() {
        assert!(matches!(decode("9024 abc 564"), Err(WaveformError::NotNumeric(_))));
        assert!(matches!(decode("9024 4.5 564"), Err(WaveformError::NotNumeric(_))));
    }

    #[test]
    fn test_decode_rejects_overflow() {
        assert!(matches!(decode("99999999999"), Err(WaveformError::Overflow(_))));
    }

    #[test]
    fn test_decode_rejects_bad_carrier() {
        assert!(matches!(decode("f=0 100"), Err(WaveformError::BadCarrier(_))));
        assert!(matches!(decode("f=abc 100"), Err(WaveformError::BadCarrier(_))));
        // Header only allowed before the first duration
        assert!(matches!(decode("100 f=38000"), Err(WaveformError::BadCarrier(_))));
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode("f=38000\n\n"), Err(WaveformError::Empty));
    }

    #[test]
    fn test_out_of_band_carrier_is_accepted() {
        let capture = decode("f=455000 100").unwrap();
        assert_eq!(capture.carrier_hz, 455000);
    }

    #[test]
    fn test_encode_groups_lines() {
        let signal = PulseSpace::new(NEC_HEAD.to_vec()).unwrap();
        let lines = encode(&Capture::unmodulated(signal));
        assert_eq!(
            lines,
            vec![
                "f=38000".to_string(),
                "9024 4512 564 564 564 1692".to_string(),
                "564".to_string(),
            ]
        );
    }

    #[test]
    fn test_token_roundtrip() {
        let capture = Capture::new(40000, PulseSpace::new(NEC_HEAD.to_vec()).unwrap());
        let decoded = decode(&encode_to_string(&capture)).unwrap();
        assert_eq!(decoded, capture);
    }

    #[test]
    fn test_pulse_space_termination_checks() {
        assert!(PulseSpace::new(vec![100, 200]).is_err());
        assert!(PulseSpace::with_trailing_gap(vec![100]).is_err());
        assert_eq!(PulseSpace::new(vec![]), Err(WaveformError::Empty));
        let seq = PulseSpace::with_trailing_gap(vec![100, 200]).unwrap();
        assert!(seq.ends_in_gap());
        assert_eq!(seq.total_duration_us(), 300);
    }

    #[test]
    fn test_pairs() {
        let seq = PulseSpace::new(vec![1, 2, 3]).unwrap();
        let pairs: Vec<_> = seq.pairs().collect();
        assert_eq!(pairs, vec![(1, Some(2)), (3, None)]);
    }

    #[test]
    fn test_mode2_line_parsing() {
        assert_eq!(
            Mode2Record::parse_line("pulse 564").unwrap(),
            Some(Mode2Record::Pulse(564))
        );
        assert_eq!(
            Mode2Record::parse_line("  space 1692  ").unwrap(),
            Some(Mode2Record::Space(1692))
        );
        assert_eq!(
            Mode2Record::parse_line("carrier 38000").unwrap(),
            Some(Mode2Record::Frequency(38000))
        );
        assert_eq!(Mode2Record::parse_line("").unwrap(), None);
        assert_eq!(Mode2Record::parse_line("# comment").unwrap(), None);
        assert!(Mode2Record::parse_line("pulse").is_err());
        assert!(Mode2Record::parse_line("mark 100").is_err());
    }

    #[test]
    fn test_builder_merges_and_drops_leading_space() {
        let mut builder = CaptureBuilder::new();
        builder.push_space(100_000);
        builder.push_pulse(500);
        builder.push_pulse(64);
        builder.push_space(500);
        builder.push_space(100);
        builder.push_pulse(560);
        let capture = builder.finish().unwrap();
        assert_eq!(capture.signal.durations(), &[564, 600, 560]);
    }

    #[test]
    fn test_builder_without_pulse_is_none() {
        let mut builder = CaptureBuilder::new();
        builder.push_space(1000);
        assert!(builder.finish().is_none());
    }

    #[test]
    fn test_mode2_binary_decode() {
        let mut bytes = Vec::new();
        for word in [
            0x0000_1000u32, // leading space, dropped
            0x0200_9470,    // frequency 38000
            0x0100_2340,    // pulse 9024
            0x0000_11a0,    // space 4512
            0x0100_0234,    // pulse 564
            0x0300_7530,    // timeout
            0x0100_0234,    // ignored after timeout
        ] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let capture = decode_mode2_binary(&bytes).unwrap();
        assert_eq!(capture.carrier_hz, 38000);
        assert_eq!(capture.signal.durations(), &[9024, 4512, 564]);
    }

    #[test]
    fn test_mode2_binary_truncated() {
        let bytes = [0x34, 0x02, 0x00, 0x01, 0x00];
        assert_eq!(
            decode_mode2_binary(&bytes),
            Err(WaveformError::TruncatedWord(1))
        );
    }

    #[test]
    fn test_mode2_binary_unknown_record() {
        let bytes = 0x0700_0001u32.to_le_bytes();
        assert_eq!(
            decode_mode2_binary(&bytes),
            Err(WaveformError::UnknownRecord(0x07))
        );
    }

    #[test]
    fn test_mode2_binary_encode() {
        let capture = Capture::new(36000, PulseSpace::with_trailing_gap(vec![900, 450]).unwrap());
        let bytes = encode_mode2_binary(&capture);
        assert_eq!(bytes.len(), 12);
        assert_eq!(decode_mode2_binary(&bytes).unwrap(), capture);
    }

    #[test]
    fn test_mode2_word_saturates() {
        assert_eq!(Mode2Record::Pulse(u32::MAX).to_word(), 0x01ff_ffff);
    }

    #[test]
    fn test_single_and_zero_durations_survive_text() {
        for durations in [vec![0], vec![1], vec![0, 0, 0], vec![u32::MAX]] {
            let capture = Capture::new(1, PulseSpace::new(durations).unwrap());
            assert_eq!(decode(&encode_to_string(&capture)).unwrap(), capture);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn pulse_terminated() -> impl Strategy<Value = Vec<u32>> {
            prop::collection::vec(any::<u32>(), 0..40).prop_map(|mut durations| {
                if durations.len() % 2 == 0 {
                    durations.push(0);
                }
                durations
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

            #[test]
            fn token_text_keeps_durations_and_carrier(
                durations in pulse_terminated(),
                carrier_hz in 1u32..=u32::MAX,
            ) {
                let capture = Capture::new(carrier_hz, PulseSpace::new(durations.clone()).unwrap());
                let decoded = decode(&encode_to_string(&capture)).unwrap();
                prop_assert_eq!(decoded.signal.durations(), durations.as_slice());
                prop_assert_eq!(decoded.carrier_hz, carrier_hz);
                prop_assert!(!decoded.signal.ends_in_gap());
            }

            #[test]
            fn trailing_gap_survives_text(
                durations in prop::collection::vec(any::<u32>(), 1..20),
            ) {
                let mut durations = durations;
                if durations.len() % 2 == 1 {
                    durations.push(0);
                }
                let capture = Capture::new(DEFAULT_CARRIER_HZ, PulseSpace::with_trailing_gap(durations).unwrap());
                prop_assert_eq!(decode(&encode_to_string(&capture)).unwrap(), capture);
            }
        }
    }
}
