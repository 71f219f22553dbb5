//! Client for LIRC-style IR daemons
//!
//! Talks to the daemon's line protocol over TCP or a Unix socket.
//!
//! # Protocol
//!
//! Requests are single text lines; every request is answered by one
//! `BEGIN ... END` block (see [`protocol`]). The daemon additionally pushes
//! decoded button presses and `SIGHUP` reload notices to every client.
//!
//! # Usage
//!
//! ```ignore
//! use irlink::lirc::{Connection, ConnectionOptions};
//!
//! let mut conn = Connection::connect_tcp("localhost", ConnectionOptions::default()).await?;
//!
//! for remote in conn.list_remotes().await? {
//!     println!("{}", remote);
//! }
//!
//! conn.set_transmitters([1, 3]).await?;
//! conn.send_once("tv", "KEY_POWER", 1).await?;
//! conn.close().await;
//! ```

pub mod client;
pub mod event;
pub mod protocol;
pub mod server;
pub mod transmitters;
pub mod transport;

pub use client::{
    CaptureOptions, CloseHandle, Connection, ConnectionOptions, LircError, RemoteCommand,
    ValidationError,
};
pub use event::ButtonEvent;
pub use protocol::{FrameError, Request, Response, Verb};
pub use server::{Emulator, RemoteDefinition, Transmission};
pub use transmitters::{TransmitterError, TransmitterMask};
