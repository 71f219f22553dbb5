//! In-memory reference daemon
//!
//! [`Emulator`] answers the line protocol the way the real daemon does:
//! every request gets one `BEGIN ... END` block, decoded button presses are
//! broadcast to all connected clients, and a configuration reload pushes a
//! `SIGHUP` block. Nothing is transmitted; sends are recorded instead.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixListener;

use crate::lirc::event::ButtonEvent;
use crate::lirc::protocol::{LineReader, ProtocolError, Request, Response, Verb, write_response};
use crate::lirc::transmitters::{TransmitterError, TransmitterMask};

const SIGHUP_BLOCK: &str = "BEGIN\nSIGHUP\nEND\n";

/// A remote and its commands, in listing order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDefinition {
    pub name: String,
    pub commands: Vec<(String, u64)>,
}

impl RemoteDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            commands: Vec::new(),
        }
    }

    pub fn command(mut self, name: impl Into<String>, code: u64) -> Self {
        self.commands.push((name.into(), code));
        self
    }

    fn has_command(&self, name: &str) -> bool {
        self.commands.iter().any(|(command, _)| command == name)
    }
}

/// One accepted `send_once` / `send_start`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub remote: String,
    pub command: String,
    /// Repeat count; 0 for a `send_start`
    pub count: u32,
    pub transmitters: TransmitterMask,
}

#[derive(Debug, Clone)]
enum Broadcast {
    Event(ButtonEvent),
    Reload,
}

struct EmulatorState {
    version: String,
    remotes: Vec<RemoteDefinition>,
    port_count: usize,
    transmitters: TransmitterMask,
    repeating: Option<(String, String)>,
    transmissions: Vec<Transmission>,
}

type Reply = Result<Option<Vec<String>>, String>;

impl EmulatorState {
    fn check_command(&self, remote: &str, command: &str) -> Result<(), String> {
        let definition = self
            .remotes
            .iter()
            .find(|r| r.name == remote)
            .ok_or_else(|| format!("unknown remote: \"{}\"", remote))?;
        if !definition.has_command(command) {
            return Err(format!("unknown command: \"{}\"", command));
        }
        Ok(())
    }

    fn send_once(&mut self, remote: &str, command: &str, count: &str) -> Reply {
        let count = match count.parse::<u32>() {
            Ok(n) if n > 0 => n,
            _ => return Err(format!("bad repeat count: \"{}\"", count)),
        };
        self.check_command(remote, command)?;
        self.record(remote, command, count);
        Ok(None)
    }

    fn send_start(&mut self, remote: &str, command: &str) -> Reply {
        self.check_command(remote, command)?;
        if self.repeating.is_some() {
            return Err("already repeating".to_string());
        }
        self.record(remote, command, 0);
        self.repeating = Some((remote.to_string(), command.to_string()));
        Ok(None)
    }

    fn send_stop(&mut self, remote: &str, command: &str) -> Reply {
        self.check_command(remote, command)?;
        let active = self
            .repeating
            .as_ref()
            .is_some_and(|(r, c)| r == remote && c == command);
        if !active {
            return Err("not repeating".to_string());
        }
        self.repeating = None;
        Ok(None)
    }

    fn list_commands(&self, remote: &str) -> Reply {
        let definition = self
            .remotes
            .iter()
            .find(|r| r.name == remote)
            .ok_or_else(|| format!("unknown remote: \"{}\"", remote))?;
        Ok(Some(
            definition
                .commands
                .iter()
                .map(|(name, code)| format!("{:016x} {}", code, name))
                .collect(),
        ))
    }

    fn set_transmitters(&mut self, token: &str) -> Reply {
        let mask = TransmitterMask::from_wire(token, self.port_count)
            .map_err(|e| format!("cannot set transmitters: {}", e))?;
        self.transmitters = mask;
        Ok(None)
    }

    fn record(&mut self, remote: &str, command: &str, count: u32) {
        debug!("Emulating {} {} x{} on {}", remote, command, count, self.transmitters);
        self.transmissions.push(Transmission {
            remote: remote.to_string(),
            command: command.to_string(),
            count,
            transmitters: self.transmitters,
        });
    }
}

/// Reference daemon shared by any number of client streams
#[derive(Clone)]
pub struct Emulator {
    state: Arc<RwLock<EmulatorState>>,
    broadcast_tx: broadcast::Sender<Broadcast>,
}

impl Emulator {
    /// Create an emulator with all `port_count` transmitters selected
    pub fn new(
        version: impl Into<String>,
        port_count: usize,
        remotes: Vec<RemoteDefinition>,
    ) -> Result<Self, TransmitterError> {
        let (broadcast_tx, _) = broadcast::channel(64);
        let state = EmulatorState {
            version: version.into(),
            remotes,
            port_count,
            transmitters: TransmitterMask::all(port_count)?,
            repeating: None,
            transmissions: Vec::new(),
        };
        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            broadcast_tx,
        })
    }

    /// Sends accepted so far, oldest first
    pub async fn transmissions(&self) -> Vec<Transmission> {
        self.state.read().await.transmissions.clone()
    }

    pub async fn transmitters(&self) -> TransmitterMask {
        self.state.read().await.transmitters
    }

    /// Command currently repeating, as `(remote, command)`
    pub async fn repeating(&self) -> Option<(String, String)> {
        self.state.read().await.repeating.clone()
    }

    /// Replace the remote definitions and notify clients with a `SIGHUP` block
    pub async fn reload(&self, remotes: Vec<RemoteDefinition>) {
        {
            let mut state = self.state.write().await;
            state.remotes = remotes;
            state.repeating = None;
        }
        info!("Emulator reloaded its remotes");
        // No receivers just means no client is connected
        let _ = self.broadcast_tx.send(Broadcast::Reload);
    }

    /// Deliver a decoded button press to every connected client
    pub fn broadcast_event(&self, event: ButtonEvent) {
        let _ = self.broadcast_tx.send(Broadcast::Event(event));
    }

    /// Serve one client until it disconnects
    pub async fn serve<S>(&self, stream: S) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = LineReader::new(reader);
        let mut broadcasts = self.broadcast_tx.subscribe();

        loop {
            tokio::select! {
                line = lines.read_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => return Ok(()), // Client closed connection
                        Err(ProtocolError::Io(e)) => return Err(e),
                        Err(ProtocolError::Frame(e)) => {
                            return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                        }
                    };
                    let echo = line.trim();
                    if echo.is_empty() {
                        continue;
                    }

                    let (response, event) = self.handle(echo).await;
                    write_response(&mut writer, echo, &response).await?;
                    if let Some(event) = event {
                        self.broadcast_event(event);
                    }
                }
                message = broadcasts.recv() => {
                    let text = match message {
                        Ok(Broadcast::Event(event)) => format!("{}\n", event),
                        Ok(Broadcast::Reload) => SIGHUP_BLOCK.to_string(),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Client lagged, {} broadcasts dropped", missed);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    };
                    writer.write_all(text.as_bytes()).await?;
                    writer.flush().await?;
                }
            }
        }
    }

    /// Accept clients on a Unix socket (call in a spawned task)
    #[cfg(unix)]
    pub async fn run(self, listener: UnixListener) -> io::Result<()> {
        info!("Emulator listening on {:?}", listener.local_addr()?);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let emulator = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = emulator.serve(stream).await {
                            debug!("Client disconnected: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Answer one request line; a simulated press is returned for broadcast
    async fn handle(&self, line: &str) -> (Response, Option<ButtonEvent>) {
        let Some(request) = Request::parse(line) else {
            let verb = line.split_whitespace().next().unwrap_or_default();
            return (Response::Error(vec![format!("unknown command: \"{}\"", verb)]), None);
        };
        debug!("Emulator received {}", request);

        let args: Vec<&str> = request.args().iter().map(String::as_str).collect();
        let mut event = None;
        let mut state = self.state.write().await;

        let reply = match (request.verb(), args.as_slice()) {
            (Verb::SendOnce, [remote, command]) => state.send_once(remote, command, "1"),
            (Verb::SendOnce, [remote, command, count]) => state.send_once(remote, command, count),
            (Verb::SendStart, [remote, command]) => state.send_start(remote, command),
            (Verb::SendStop, [remote, command]) => state.send_stop(remote, command),
            (Verb::ListRemotes, []) => Ok(Some(
                state.remotes.iter().map(|r| r.name.clone()).collect(),
            )),
            (Verb::ListCommands, [remote]) => state.list_commands(remote),
            (Verb::Version, []) => Ok(Some(vec![state.version.clone()])),
            (Verb::SetTransmitters, [mask]) => state.set_transmitters(mask),
            (Verb::Simulate, [_, _, _, _]) => match args.join(" ").parse::<ButtonEvent>() {
                Ok(parsed) => {
                    event = Some(parsed);
                    Ok(None)
                }
                Err(_) => Err("bad simulate packet".to_string()),
            },
            _ => Err("bad send packet".to_string()),
        };

        let response = match reply {
            Ok(data) => Response::Success(data),
            Err(message) => Response::Error(vec![message]),
        };
        (response, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lirc::client::{Connection, ConnectionOptions, LircError};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn remotes() -> Vec<RemoteDefinition> {
        vec![
            RemoteDefinition::new("tv")
                .command("KEY_POWER", 0x10ef)
                .command("KEY_MUTE", 0x20df),
            RemoteDefinition::new("amp").command("KEY_VOLUMEUP", 0x1d),
        ]
    }

    fn emulator() -> Emulator {
        Emulator::new("0.10.2", 4, remotes()).unwrap()
    }

    fn connect(emulator: &Emulator) -> Connection {
        let (client, server) = tokio::io::duplex(4096);
        let emulator = emulator.clone();
        tokio::spawn(async move { emulator.serve(server).await });
        Connection::open(
            client,
            ConnectionOptions {
                timeout: Duration::from_secs(2),
                port_count: 4,
                ..ConnectionOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_send_once_is_recorded() {
        let emulator = emulator();
        let mut conn = connect(&emulator);

        conn.send_once("tv", "KEY_POWER", 2).await.unwrap();

        let sent = emulator.transmissions().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].remote, "tv");
        assert_eq!(sent[0].command, "KEY_POWER");
        assert_eq!(sent[0].count, 2);
        assert_eq!(sent[0].transmitters, TransmitterMask::all(4).unwrap());
    }

    #[tokio::test]
    async fn test_listings_keep_order() {
        let emulator = emulator();
        let mut conn = connect(&emulator);

        assert_eq!(conn.list_remotes().await.unwrap(), vec!["tv", "amp"]);

        let commands = conn.list_commands("tv").await.unwrap();
        let names: Vec<_> = commands.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["KEY_POWER", "KEY_MUTE"]);
        assert_eq!(commands[0].code.as_deref(), Some("00000000000010ef"));

        assert_eq!(conn.version().await.unwrap(), "0.10.2");
    }

    #[tokio::test]
    async fn test_unknown_remote_is_daemon_error() {
        let emulator = emulator();
        let mut conn = connect(&emulator);

        match conn.send_once("bogus", "KEY_POWER", 1).await {
            Err(LircError::Daemon(message)) => assert!(message.starts_with("unknown remote")),
            other => panic!("expected daemon error, got {:?}", other),
        }
        assert!(conn.is_open());
        assert!(emulator.transmissions().await.is_empty());

        assert!(matches!(
            conn.list_commands("bogus").await,
            Err(LircError::Daemon(_))
        ));
    }

    #[tokio::test]
    async fn test_repeat_lifecycle() {
        let emulator = emulator();
        let mut conn = connect(&emulator);

        conn.send_start("amp", "KEY_VOLUMEUP").await.unwrap();
        assert_eq!(
            emulator.repeating().await,
            Some(("amp".to_string(), "KEY_VOLUMEUP".to_string()))
        );
        assert!(matches!(
            conn.send_start("tv", "KEY_POWER").await,
            Err(LircError::Daemon(_))
        ));

        conn.send_stop("amp", "KEY_VOLUMEUP").await.unwrap();
        assert_eq!(emulator.repeating().await, None);
    }

    #[tokio::test]
    async fn test_stop_from_fresh_connection_is_tolerated() {
        let emulator = emulator();
        let mut conn = connect(&emulator);
        conn.send_stop("tv", "KEY_POWER").await.unwrap();
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_transmitter_selection() {
        let emulator = emulator();
        let mut conn = connect(&emulator);

        conn.send_once_on("tv", "KEY_MUTE", 1, [2, 4]).await.unwrap();
        let sent = emulator.transmissions().await;
        assert_eq!(sent[0].transmitters.to_wire(), "a");
        assert_eq!(emulator.transmitters().await.ports(), BTreeSet::from([2, 4]));
    }

    #[tokio::test]
    async fn test_simulate_reaches_other_clients() {
        let emulator = emulator();
        let mut listener = connect(&emulator);
        let mut sender = connect(&emulator);

        // Make sure the listener is subscribed before the press is broadcast
        listener.version().await.unwrap();

        let press = ButtonEvent::new("tv", "KEY_POWER", 0x10ef, 0);
        sender.simulate(&press).await.unwrap();

        let received = listener.next_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Some(press));
    }

    #[tokio::test]
    async fn test_reload_block_is_skipped() {
        let emulator = emulator();
        let mut conn = connect(&emulator);
        conn.version().await.unwrap();

        emulator
            .reload(vec![RemoteDefinition::new("projector").command("KEY_POWER", 1)])
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(conn.list_remotes().await.unwrap(), vec!["projector"]);
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_own_simulated_press_does_not_break_next_reply() {
        let emulator = emulator();
        let mut conn = connect(&emulator);

        let press = ButtonEvent::new("tv", "KEY_MUTE", 0x20df, 0);
        conn.simulate(&press).await.unwrap();
        assert_eq!(conn.version().await.unwrap(), "0.10.2");
        assert!(conn.is_open());

        let received = conn.next_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Some(press));
    }

    #[tokio::test]
    async fn test_press_between_commands_is_kept() {
        let emulator = emulator();
        let mut conn = connect(&emulator);
        conn.version().await.unwrap();

        let press = ButtonEvent::new("amp", "KEY_VOLUMEUP", 0x1d, 2);
        emulator.broadcast_event(press.clone());

        assert_eq!(conn.list_remotes().await.unwrap(), vec!["tv", "amp"]);
        assert_eq!(conn.list_remotes().await.unwrap(), vec!["tv", "amp"]);
        let received = conn.next_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Some(press));
    }

    #[tokio::test]
    async fn test_reload_while_waiting_for_press() {
        let emulator = emulator();
        let mut conn = connect(&emulator);
        conn.version().await.unwrap();

        let press = ButtonEvent::new("projector", "KEY_POWER", 1, 0);
        let pusher = {
            let emulator = emulator.clone();
            let press = press.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                emulator
                    .reload(vec![RemoteDefinition::new("projector").command("KEY_POWER", 1)])
                    .await;
                emulator.broadcast_event(press);
            })
        };

        let received = conn.next_event(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Some(press));
        assert!(conn.is_open());
        pusher.await.unwrap();

        assert_eq!(conn.list_remotes().await.unwrap(), vec!["projector"]);
    }

    #[tokio::test]
    async fn test_raw_protocol_errors() {
        let emulator = emulator();
        let (client, server) = tokio::io::duplex(4096);
        let serving = emulator.clone();
        tokio::spawn(async move { serving.serve(server).await });

        let (read, mut write) = tokio::io::split(client);
        let mut lines = LineReader::new(read);

        write.write_all(b"launch_missiles now\n").await.unwrap();
        let request = Request::new(Verb::Version);
        // The echo belongs to an unknown verb, so read the block by hand
        let mut block = Vec::new();
        for _ in 0..7 {
            block.push(lines.read_line().await.unwrap().unwrap());
        }
        assert_eq!(
            block,
            vec![
                "BEGIN",
                "launch_missiles now",
                "ERROR",
                "DATA",
                "1",
                "unknown command: \"launch_missiles\"",
                "END"
            ]
        );

        write.write_all(b"VERSION\n").await.unwrap();
        let response = lines.read_block(&request).await.unwrap();
        assert_eq!(response.payload(), &["0.10.2".to_string()]);

        write.write_all(b"send_once tv\n").await.unwrap();
        let request = Request::new(Verb::SendOnce).arg("tv");
        let response = lines.read_block(&request).await.unwrap();
        assert_eq!(response, Response::Error(vec!["bad send packet".to_string()]));

        write.write_all(b"set_transmitters 10\n").await.unwrap();
        let request = Request::new(Verb::SetTransmitters).arg("10");
        assert!(!lines.read_block(&request).await.unwrap().is_success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("lircd");
        let listener = UnixListener::bind(&path).unwrap();

        let server_handle = tokio::spawn(emulator().run(listener));

        let mut conn = Connection::connect_unix(&path, ConnectionOptions::default())
            .await
            .unwrap();
        assert_eq!(conn.version().await.unwrap(), "0.10.2");
        conn.close().await;

        server_handle.abort();
    }
}
