//! Command engine
//!
//! A [`Connection`] owns one transport and drives one request at a time:
//! write the request line, read the answering block within the deadline,
//! and map the block to a typed result.
//!
//! The protocol carries no request identifiers, so a connection must have a
//! single owner. Parallel work needs separate connections. Transport,
//! timeout and framing failures leave the stream in an unknown position;
//! the connection is then marked closed and every later call fails fast
//! with [`LircError::Closed`] until the caller opens a new one.

use std::io;
#[cfg(unix)]
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ir::waveform::{self, Capture, CaptureBuilder, Mode2Record, WaveformError};
use crate::lirc::event::ButtonEvent;
use crate::lirc::protocol::{
    FrameError, LineReader, ProtocolError, Request, Response, Verb, write_request,
};
use crate::lirc::transmitters::{DEFAULT_PORT_COUNT, TransmitterError, TransmitterMask};
use crate::lirc::transport::{self, Transport};

/// Default deadline for one response block
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for the first pulse of a raw capture
pub const DEFAULT_BEGIN_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Silence that ends a raw capture
pub const DEFAULT_ENDING_TIMEOUT: Duration = Duration::from_millis(300);

/// Most durations collected by one raw capture
pub const DEFAULT_CAPTURE_MAX_SIZE: usize = 500;

/// Caller-side argument errors, raised before any I/O
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error(transparent)]
    Waveform(#[from] WaveformError),

    #[error(transparent)]
    Transmitter(#[from] TransmitterError),

    #[error("{0}")]
    InvalidArgument(String),
}

/// Command outcome failures
#[derive(Error, Debug)]
pub enum LircError {
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("No complete response within {0:?}")]
    Timeout(Duration),

    #[error("Framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("Daemon error: {0}")]
    Daemon(String),

    #[error("Invalid argument: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connection closed")]
    Closed,
}

impl LircError {
    /// Whether the error invalidated the connection
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LircError::Transport(_) | LircError::Timeout(_) | LircError::Framing(_) | LircError::Closed
        )
    }
}

impl From<ProtocolError> for LircError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => LircError::Transport(e),
            ProtocolError::Frame(e) => LircError::Framing(e),
        }
    }
}

impl From<TransmitterError> for LircError {
    fn from(err: TransmitterError) -> Self {
        LircError::Validation(err.into())
    }
}

/// Raw capture limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub begin_timeout: Duration,
    pub ending_timeout: Duration,
    pub max_size: usize,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            begin_timeout: DEFAULT_BEGIN_TIMEOUT,
            ending_timeout: DEFAULT_ENDING_TIMEOUT,
            max_size: DEFAULT_CAPTURE_MAX_SIZE,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Deadline for a complete response block
    pub timeout: Duration,
    /// Number of physical transmitter ports
    pub port_count: usize,
    pub capture: CaptureOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            port_count: DEFAULT_PORT_COUNT,
            capture: CaptureOptions::default(),
        }
    }
}

/// One entry of a remote's command listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Scan code, when the daemon reports one
    pub code: Option<String>,
    pub name: String,
}

impl RemoteCommand {
    fn parse(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(name), None, None) => Some(Self {
                code: None,
                name: name.to_string(),
            }),
            (Some(code), Some(name), None) => Some(Self {
                code: Some(code.to_string()),
                name: name.to_string(),
            }),
            _ => None,
        }
    }
}

/// Aborts a connection from another task
///
/// Closing wakes a pending read immediately; the call returns
/// [`LircError::Closed`].
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Repeat {
    remote: String,
    command: String,
}

/// An open connection to the daemon
pub struct Connection {
    reader: LineReader<ReadHalf<Box<dyn Transport>>>,
    writer: WriteHalf<Box<dyn Transport>>,
    options: ConnectionOptions,
    peer: String,
    open: bool,
    cancel: CancellationToken,
    /// Mask last accepted by the daemon
    transmitters: Option<TransmitterMask>,
    /// Command last started with `send_start` and not yet stopped
    repeating: Option<Repeat>,
}

impl Connection {
    /// Take ownership of an established transport
    pub fn open<T: Transport>(transport: T, options: ConnectionOptions) -> Self {
        Self::with_peer(Box::new(transport), options, "transport".to_string())
    }

    /// Connect over TCP (`host` or `host:port`)
    pub async fn connect_tcp(address: &str, options: ConnectionOptions) -> Result<Self, LircError> {
        let stream = transport::connect_tcp(address).await?;
        Ok(Self::with_peer(Box::new(stream), options, address.to_string()))
    }

    /// Connect over the daemon's Unix socket
    #[cfg(unix)]
    pub async fn connect_unix(path: &Path, options: ConnectionOptions) -> Result<Self, LircError> {
        let stream = transport::connect_unix(path).await?;
        Ok(Self::with_peer(
            Box::new(stream),
            options,
            path.display().to_string(),
        ))
    }

    fn with_peer(transport: Box<dyn Transport>, options: ConnectionOptions, peer: String) -> Self {
        info!("Opened connection to {}", peer);
        let (reader, writer) = tokio::io::split(transport);
        Self {
            reader: LineReader::new(reader),
            writer,
            options,
            peer,
            open: true,
            cancel: CancellationToken::new(),
            transmitters: None,
            repeating: None,
        }
    }

    /// Close the connection, shutting down the write side
    pub async fn close(mut self) {
        self.open = false;
        if let Err(e) = self.writer.shutdown().await {
            debug!("Shutdown of {} failed: {}", self.peer, e);
        }
        info!("Closed connection to {}", self.peer);
    }

    /// Handle for aborting pending calls from another task
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open && !self.cancel.is_cancelled()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Mask currently selected on the daemon, if one was set on this connection
    pub fn transmitters(&self) -> Option<TransmitterMask> {
        self.transmitters
    }

    // ------------------------------------------------------------------
    // Verbs
    // ------------------------------------------------------------------

    /// Send a command `count` times
    pub async fn send_once(&mut self, remote: &str, command: &str, count: u32) -> Result<(), LircError> {
        check_token("remote", remote)?;
        check_token("command", command)?;
        if count == 0 {
            return Err(invalid("repeat count must be positive"));
        }

        let request = Request::new(Verb::SendOnce)
            .arg(remote)
            .arg(command)
            .arg(count.to_string());
        self.command(request).await?;
        Ok(())
    }

    /// Send a command on the given 1-based ports
    ///
    /// The transmitter mask is only sent when it differs from the one
    /// already selected on this connection.
    pub async fn send_once_on<I>(
        &mut self,
        remote: &str,
        command: &str,
        count: u32,
        ports: I,
    ) -> Result<(), LircError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mask = TransmitterMask::from_ports(ports, self.options.port_count)?;
        self.select_transmitters(mask).await?;
        self.send_once(remote, command, count).await
    }

    /// Start repeating a command until [`send_stop`](Self::send_stop)
    pub async fn send_start(&mut self, remote: &str, command: &str) -> Result<(), LircError> {
        check_token("remote", remote)?;
        check_token("command", command)?;

        let request = Request::new(Verb::SendStart).arg(remote).arg(command);
        self.command(request).await?;
        self.repeating = Some(Repeat {
            remote: remote.to_string(),
            command: command.to_string(),
        });
        Ok(())
    }

    /// Start repeating a command on the given 1-based ports
    pub async fn send_start_on<I>(&mut self, remote: &str, command: &str, ports: I) -> Result<(), LircError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mask = TransmitterMask::from_ports(ports, self.options.port_count)?;
        self.select_transmitters(mask).await?;
        self.send_start(remote, command).await
    }

    /// Stop a repeating command
    ///
    /// Stopping a command this connection did not start succeeds even if the
    /// daemon reports that nothing was repeating; after a reconnect the
    /// caller cannot know whether a repeat is still running.
    pub async fn send_stop(&mut self, remote: &str, command: &str) -> Result<(), LircError> {
        check_token("remote", remote)?;
        check_token("command", command)?;

        let tracked = self
            .repeating
            .as_ref()
            .is_some_and(|r| r.remote == remote && r.command == command);

        let request = Request::new(Verb::SendStop).arg(remote).arg(command);
        match self.command(request).await {
            Ok(_) => {
                if tracked {
                    self.repeating = None;
                }
                Ok(())
            }
            Err(LircError::Daemon(message)) if !tracked => {
                warn!(
                    "Ignoring send_stop error for untracked {} {}: {}",
                    remote, command, message
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Remote names in daemon order
    pub async fn list_remotes(&mut self) -> Result<Vec<String>, LircError> {
        self.command(Request::new(Verb::ListRemotes)).await
    }

    /// Commands of one remote in daemon order
    pub async fn list_commands(&mut self, remote: &str) -> Result<Vec<RemoteCommand>, LircError> {
        check_token("remote", remote)?;

        let lines = self
            .command(Request::new(Verb::ListCommands).arg(remote))
            .await?;
        lines
            .iter()
            .map(|line| {
                RemoteCommand::parse(line).ok_or_else(|| {
                    FrameError::UnexpectedPayload(format!("command entry {:?}", line))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.invalidate(e.into()))
    }

    /// Daemon version string
    pub async fn version(&mut self) -> Result<String, LircError> {
        let mut lines = self.command(Request::new(Verb::Version)).await?;
        if lines.len() != 1 {
            let err = FrameError::UnexpectedPayload(format!("{} version lines", lines.len()));
            return Err(self.invalidate(err.into()));
        }
        Ok(lines.remove(0))
    }

    /// Select transmitters by 1-based port number
    pub async fn set_transmitters<I>(&mut self, ports: I) -> Result<TransmitterMask, LircError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mask = TransmitterMask::from_ports(ports, self.options.port_count)?;
        self.set_transmitter_mask(mask).await?;
        Ok(mask)
    }

    /// Select transmitters with a prepared mask of the configured width
    pub async fn set_transmitter_mask(&mut self, mask: TransmitterMask) -> Result<(), LircError> {
        mask.ensure_width(self.options.port_count)?;

        let request = Request::new(Verb::SetTransmitters).arg(mask.to_wire());
        self.command(request).await?;
        self.transmitters = Some(mask);
        Ok(())
    }

    async fn select_transmitters(&mut self, mask: TransmitterMask) -> Result<(), LircError> {
        if self.transmitters == Some(mask) {
            debug!("Transmitter mask {} already selected", mask);
            return Ok(());
        }
        self.set_transmitter_mask(mask).await
    }

    /// Inject a decoded button press as if it had been received
    pub async fn simulate(&mut self, event: &ButtonEvent) -> Result<(), LircError> {
        check_token("remote", &event.remote)?;
        check_token("button", &event.button)?;

        let request = Request::new(Verb::Simulate)
            .arg(event.code_token())
            .arg(event.repeat_token())
            .arg(event.button.as_str())
            .arg(event.remote.as_str());
        self.command(request).await?;
        Ok(())
    }

    /// Wait for one broadcast button event
    ///
    /// Events that arrived while a command was awaiting its response are
    /// returned first, and `SIGHUP` reload blocks are skipped. Returns `None`
    /// if nothing arrives within `wait`; no block is in flight, so the
    /// connection stays usable.
    pub async fn next_event(&mut self, wait: Duration) -> Result<Option<ButtonEvent>, LircError> {
        self.ensure_open()?;

        let deadline = Instant::now() + wait;
        let result: Result<Option<ButtonEvent>, LircError> = tokio::select! {
            _ = self.cancel.cancelled() => Err(LircError::Closed),
            r = timeout_at(deadline, self.reader.read_broadcast()) => match r {
                Ok(Ok(event)) => Ok(Some(event)),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Ok(None),
            },
        };

        result.map_err(|e| self.invalidate(e))
    }

    /// Read a raw waveform streamed on the connection
    ///
    /// Accepts mode2 text (`pulse N`, `space N`, `carrier N`, `timeout N`)
    /// and token lines (`f=38000 9024 4512 ...`). The signal ends at a space
    /// of at least the ending timeout, a `timeout` record, equally long
    /// silence, or the size limit. Returns `None` if no pulse arrives
    /// within the begin timeout. Malformed data is a framing error and
    /// closes the connection.
    pub async fn receive_raw(&mut self) -> Result<Option<Capture>, LircError> {
        self.ensure_open()?;

        let capture = self.options.capture.clone();
        let ending_us = u32::try_from(capture.ending_timeout.as_micros()).unwrap_or(u32::MAX);
        let begin_deadline = Instant::now() + capture.begin_timeout;
        let mut builder = CaptureBuilder::new();

        loop {
            let deadline = if builder.has_pulse() {
                Instant::now() + capture.ending_timeout
            } else {
                begin_deadline
            };

            let Some(line) = self.read_line_until(deadline).await? else {
                break;
            };
            let ended = apply_raw_line(&mut builder, &line)
                .map_err(|e| self.invalidate(FrameError::BadCapture(e).into()))?;
            if ended {
                break;
            }
            if builder.trailing_gap().is_some_and(|gap| gap >= ending_us)
                || builder.len() >= capture.max_size
            {
                break;
            }
        }

        let result = builder.finish();
        match &result {
            Some(c) => debug!("Captured {} durations at {} Hz", c.signal.len(), c.carrier_hz),
            None => debug!("No signal within {:?}", capture.begin_timeout),
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Exchange
    // ------------------------------------------------------------------

    /// Run a request and return the success payload
    async fn command(&mut self, request: Request) -> Result<Vec<String>, LircError> {
        match self.exchange(&request).await? {
            Response::Success(data) => Ok(data.unwrap_or_default()),
            Response::Error(lines) => {
                let message = lines.join("\n");
                debug!("Daemon rejected {}: {}", request, message);
                Err(LircError::Daemon(message))
            }
        }
    }

    /// Write one request and read its block within the deadline
    async fn exchange(&mut self, request: &Request) -> Result<Response, LircError> {
        self.ensure_open()?;

        let limit = self.options.timeout;
        let deadline = Instant::now() + limit;
        debug!("Sending {:?} to {}", request.to_string(), self.peer);

        let result: Result<Response, LircError> = tokio::select! {
            _ = self.cancel.cancelled() => Err(LircError::Closed),
            r = timeout_at(deadline, round_trip(&mut self.reader, &mut self.writer, request)) => {
                r.unwrap_or(Err(LircError::Timeout(limit)))
            }
        };

        result.map_err(|e| self.invalidate(e))
    }

    /// Read one line, `None` once `deadline` passes
    async fn read_line_until(&mut self, deadline: Instant) -> Result<Option<String>, LircError> {
        let result: Result<Option<String>, LircError> = tokio::select! {
            _ = self.cancel.cancelled() => Err(LircError::Closed),
            r = timeout_at(deadline, self.reader.read_line()) => match r {
                Ok(Ok(Some(line))) => Ok(Some(line)),
                Ok(Ok(None)) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Daemon closed the connection",
                )
                .into()),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Ok(None),
            },
        };

        result.map_err(|e| self.invalidate(e))
    }

    fn ensure_open(&mut self) -> Result<(), LircError> {
        if self.open && self.cancel.is_cancelled() {
            return Err(self.invalidate(LircError::Closed));
        }
        if !self.open {
            return Err(LircError::Closed);
        }
        Ok(())
    }

    /// Mark the connection unusable after a fatal error
    fn invalidate(&mut self, err: LircError) -> LircError {
        if err.is_fatal() && self.open {
            warn!("Connection to {} is no longer usable: {}", self.peer, err);
            self.open = false;
            self.transmitters = None;
            self.repeating = None;
        }
        err
    }
}

async fn round_trip(
    reader: &mut LineReader<ReadHalf<Box<dyn Transport>>>,
    writer: &mut WriteHalf<Box<dyn Transport>>,
    request: &Request,
) -> Result<Response, LircError> {
    write_request(writer, request).await?;
    Ok(reader.read_block(request).await?)
}

/// Feed one streamed line into the capture; `true` when the signal ended
fn apply_raw_line(builder: &mut CaptureBuilder, line: &str) -> Result<bool, WaveformError> {
    let trimmed = line.trim_start();
    let is_tokens = trimmed.starts_with("f=")
        || trimmed.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '+');
    if !is_tokens {
        return match Mode2Record::parse_line(line)? {
            Some(record) => builder.push(record),
            None => Ok(false),
        };
    }

    for token in line.split_whitespace() {
        if let Some(hz) = token.strip_prefix("f=") {
            builder.set_carrier(waveform::parse_carrier(hz)?)?;
            continue;
        }
        let us = waveform::parse_duration(token)?;
        if builder.len() % 2 == 0 {
            builder.push_pulse(us);
        } else {
            builder.push_space(us);
        }
    }
    Ok(false)
}

fn check_token(what: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::InvalidArgument(format!("{} must not be empty", what)));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidArgument(format!(
            "{} {:?} contains whitespace",
            what, value
        )));
    }
    Ok(())
}

fn invalid(message: &str) -> LircError {
    ValidationError::InvalidArgument(message.to_string()).into()
}
