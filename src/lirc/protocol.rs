//! Line protocol framing
//!
//! Requests are single lines: `<verb> <arg>*\n`. Every request is answered
//! by one block:
//!
//! ```text
//! BEGIN
//! <request echo>
//! SUCCESS | ERROR
//! [DATA
//!  <count>
//!  <count payload lines>]
//! END
//! ```
//!
//! The daemon may also push a `BEGIN / SIGHUP / END` block at any time after
//! reloading its configuration, and a button event line whenever a remote is
//! pressed. [`LineReader::read_block`] skips the former and queues the latter
//! for [`LineReader::read_broadcast`].

use std::collections::VecDeque;
use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::ir::waveform::WaveformError;
use crate::lirc::event::ButtonEvent;

/// Longest accepted line, excluding the terminator
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Largest accepted `DATA` count
pub const MAX_DATA_LINES: usize = 1 << 20;

/// Button events kept while a response is awaited
pub const MAX_QUEUED_EVENTS: usize = 256;

const BEGIN: &str = "BEGIN";
const END: &str = "END";
const SUCCESS: &str = "SUCCESS";
const ERROR: &str = "ERROR";
const DATA: &str = "DATA";
const SIGHUP: &str = "SIGHUP";

/// Response grammar violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Expected BEGIN, got {0:?}")]
    ExpectedBegin(String),

    #[error("Echo {got:?} does not match request {expected:?}")]
    EchoMismatch { expected: String, got: String },

    #[error("Expected SUCCESS or ERROR, got {0:?}")]
    ExpectedStatus(String),

    #[error("Expected DATA or END, got {0:?}")]
    ExpectedDataOrEnd(String),

    #[error("Invalid DATA count: {0:?}")]
    BadCount(String),

    #[error("Expected END after {count} data lines, got {got:?}")]
    ExpectedEnd { count: usize, got: String },

    #[error("Stream ended after {received} of {expected} data lines")]
    Truncated { expected: usize, received: usize },

    #[error("Stream ended inside a response block")]
    UnexpectedEof,

    #[error("Line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("Unexpected payload: {0}")]
    UnexpectedPayload(String),

    #[error("Malformed broadcast line: {0:?}")]
    BadEvent(String),

    #[error("Unsolicited block starting with {0:?}")]
    UnsolicitedBlock(String),

    #[error("Malformed capture data: {0}")]
    BadCapture(WaveformError),
}

/// Errors while reading or writing the line protocol
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Request verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    SendOnce,
    SendStart,
    SendStop,
    ListRemotes,
    ListCommands,
    Version,
    SetTransmitters,
    Simulate,
}

impl Verb {
    pub const ALL: [Verb; 8] = [
        Verb::SendOnce,
        Verb::SendStart,
        Verb::SendStop,
        Verb::ListRemotes,
        Verb::ListCommands,
        Verb::Version,
        Verb::SetTransmitters,
        Verb::Simulate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::SendOnce => "send_once",
            Verb::SendStart => "send_start",
            Verb::SendStop => "send_stop",
            Verb::ListRemotes => "list_remotes",
            Verb::ListCommands => "list_commands",
            Verb::Version => "version",
            Verb::SetTransmitters => "set_transmitters",
            Verb::Simulate => "simulate",
        }
    }

    /// Case-insensitive lookup
    pub fn from_wire(word: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|verb| verb.as_str().eq_ignore_ascii_case(word))
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    verb: Verb,
    args: Vec<String>,
}

impl Request {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Parse a request line; `None` for blank lines and unknown verbs
    pub fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let verb = Verb::from_wire(words.next()?)?;
        Some(Self {
            verb,
            args: words.map(str::to_string).collect(),
        })
    }

    /// Whether a daemon echo line refers to this request
    pub fn matches_echo(&self, echo: &str) -> bool {
        let mut words = echo.split_whitespace();
        let verb_matches = words
            .next()
            .is_some_and(|word| self.verb.as_str().eq_ignore_ascii_case(word));
        verb_matches && words.eq(self.args.iter().map(String::as_str))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb.as_str())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Parsed response block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `SUCCESS`, with the payload when a `DATA` section was present
    Success(Option<Vec<String>>),
    /// `ERROR`, with the message lines (empty when no `DATA` section was sent)
    Error(Vec<String>),
}

impl Response {
    pub fn is_success(&self) -> bool {
        matches!(self, Response::Success(_))
    }

    /// Payload lines; empty for a bare `SUCCESS`
    pub fn payload(&self) -> &[String] {
        match self {
            Response::Success(Some(lines)) | Response::Error(lines) => lines,
            Response::Success(None) => &[],
        }
    }

    /// Render the block answering `echo`
    pub fn to_block(&self, echo: &str) -> String {
        let (status, data) = match self {
            Response::Success(data) => (SUCCESS, data.as_deref()),
            Response::Error(lines) => (ERROR, Some(lines.as_slice())),
        };

        let mut block = format!("{}\n{}\n{}\n", BEGIN, echo, status);
        if let Some(lines) = data {
            block.push_str(&format!("{}\n{}\n", DATA, lines.len()));
            for line in lines {
                block.push_str(line);
                block.push('\n');
            }
        }
        block.push_str(END);
        block.push('\n');
        block
    }
}

/// Write a request line and flush
pub async fn write_request<W>(writer: &mut W, request: &Request) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let line = format!("{}\n", request);
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a response block and flush
pub async fn write_response<W>(writer: &mut W, echo: &str, response: &Response) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.to_block(echo).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Progress through a pushed `BEGIN / SIGHUP / END` block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hangup {
    Idle,
    AfterBegin,
    AfterSighup,
}

/// Newline framing over a byte stream
///
/// Bytes of an incomplete line are kept between calls, so a read that is
/// abandoned (for example by a timeout) loses nothing and the next call
/// resumes the same line.
pub struct LineReader<R> {
    inner: BufReader<R>,
    partial: Vec<u8>,
    /// Button events seen while waiting for a block
    events: VecDeque<ButtonEvent>,
    hangup: Hangup,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            partial: Vec::new(),
            events: VecDeque::new(),
            hangup: Hangup::Idle,
        }
    }

    #[cfg(test)]
    fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Number of button events queued by [`read_block`](Self::read_block)
    pub fn queued_events(&self) -> usize {
        self.events.len()
    }

    /// Read one line without its `\n` / `\r\n` terminator
    ///
    /// Returns `None` at end of stream. An unterminated final line is
    /// returned as is.
    pub async fn read_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let limit = (MAX_LINE_LEN + 1).saturating_sub(self.partial.len()) as u64;
        (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.partial)
            .await?;

        let complete = self.partial.last() == Some(&b'\n');
        if !complete && self.partial.len() > MAX_LINE_LEN {
            self.partial.clear();
            return Err(FrameError::LineTooLong(MAX_LINE_LEN).into());
        }
        if self.partial.is_empty() {
            return Ok(None);
        }

        let mut bytes = std::mem::take(&mut self.partial);
        while matches!(bytes.last(), Some(b'\n' | b'\r')) {
            bytes.pop();
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read a line that must exist because a block is in progress
    async fn expect_line(&mut self) -> Result<String, ProtocolError> {
        self.read_line()
            .await?
            .ok_or_else(|| FrameError::UnexpectedEof.into())
    }

    async fn expect_open_line(&mut self) -> Result<String, ProtocolError> {
        self.read_line().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "Daemon closed the connection").into()
        })
    }

    /// Read the next unsolicited button event
    ///
    /// Events queued while a block was awaited come first. `SIGHUP` blocks
    /// and blank lines are skipped. Abandoning the call between lines loses
    /// nothing.
    pub async fn read_broadcast(&mut self) -> Result<ButtonEvent, ProtocolError> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            let line = self.expect_open_line().await?;
            if let Some(event) = self.step_broadcast(line)? {
                debug!("Received event {}", event);
                return Ok(event);
            }
        }
    }

    /// Feed one line read outside a response block
    fn step_broadcast(&mut self, line: String) -> Result<Option<ButtonEvent>, ProtocolError> {
        let word = line.trim();
        match self.hangup {
            Hangup::Idle if word == BEGIN => {
                self.hangup = Hangup::AfterBegin;
                Ok(None)
            }
            Hangup::Idle if word.is_empty() => Ok(None),
            Hangup::Idle => Ok(Some(line.parse::<ButtonEvent>()?)),
            Hangup::AfterBegin => {
                if word != SIGHUP {
                    self.hangup = Hangup::Idle;
                    return Err(FrameError::UnsolicitedBlock(line).into());
                }
                self.hangup = Hangup::AfterSighup;
                Ok(None)
            }
            Hangup::AfterSighup => {
                self.hangup = Hangup::Idle;
                if word != END {
                    return Err(FrameError::ExpectedEnd { count: 0, got: line }.into());
                }
                warn!("Daemon reloaded its configuration (SIGHUP broadcast)");
                Ok(None)
            }
        }
    }

    fn queue_event(&mut self, event: ButtonEvent) {
        debug!("Queued event {} while awaiting a response", event);
        if self.events.len() >= MAX_QUEUED_EVENTS {
            warn!("Event queue full, dropping oldest event");
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Read the block answering `request`
    pub async fn read_block(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        // Finish a SIGHUP block left half read by an abandoned broadcast read
        while self.hangup != Hangup::Idle {
            let line = self.expect_line().await?;
            self.step_broadcast(line)?;
        }

        loop {
            let first = self.expect_open_line().await?;
            let word = first.trim_end();
            if word.is_empty() {
                continue;
            }
            if word != BEGIN {
                match first.parse::<ButtonEvent>() {
                    Ok(event) => {
                        self.queue_event(event);
                        continue;
                    }
                    Err(_) => return Err(FrameError::ExpectedBegin(first).into()),
                }
            }

            let echo = self.expect_line().await?;
            if echo.trim_end() == SIGHUP {
                let end = self.expect_line().await?;
                if end.trim_end() != END {
                    return Err(FrameError::ExpectedEnd { count: 0, got: end }.into());
                }
                warn!("Daemon reloaded its configuration (SIGHUP broadcast)");
                continue;
            }
            if !request.matches_echo(&echo) {
                return Err(FrameError::EchoMismatch {
                    expected: request.to_string(),
                    got: echo,
                }
                .into());
            }

            let status = self.expect_line().await?;
            let is_error = match status.trim_end() {
                SUCCESS => false,
                ERROR => true,
                END => return Ok(Response::Success(None)),
                _ => return Err(FrameError::ExpectedStatus(status).into()),
            };

            let marker = self.expect_line().await?;
            let data = match marker.trim_end() {
                END => None,
                DATA => Some(self.read_data().await?),
                _ => return Err(FrameError::ExpectedDataOrEnd(marker).into()),
            };

            let response = if is_error {
                Response::Error(data.unwrap_or_default())
            } else {
                Response::Success(data)
            };
            debug!("Received {:?} for {}", response, request.verb());
            return Ok(response);
        }
    }

    /// Read `<count>`, the payload lines and the closing `END`
    async fn read_data(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count_line = self.expect_line().await?;
        let count = count_line
            .trim()
            .parse::<usize>()
            .ok()
            .filter(|&n| n <= MAX_DATA_LINES)
            .ok_or_else(|| FrameError::BadCount(count_line.clone()))?;

        let mut lines = Vec::with_capacity(count.min(1024));
        for received in 0..count {
            match self.read_line().await? {
                Some(line) => lines.push(line),
                None => {
                    return Err(FrameError::Truncated {
                        expected: count,
                        received,
                    }
                    .into());
                }
            }
        }

        let end = self.expect_line().await?;
        if end.trim_end() != END {
            return Err(FrameError::ExpectedEnd { count, got: end }.into());
        }
        Ok(lines)
    }
}
