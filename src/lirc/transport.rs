//! Byte-stream transports
//!
//! The engine runs over any bidirectional async stream. TCP and Unix socket
//! connectors are provided for the two ways a daemon is normally reached.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

#[cfg(unix)]
use std::path::Path;
#[cfg(unix)]
use tokio::net::UnixStream;

/// Default TCP port of the daemon
pub const DEFAULT_TCP_PORT: u16 = 8765;

/// Conventional daemon socket
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/lirc/lircd";

/// Timeout for establishing a transport
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A bidirectional byte stream the engine can own
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Connect to `host:port`; a bare host gets [`DEFAULT_TCP_PORT`]
pub async fn connect_tcp(address: &str) -> io::Result<TcpStream> {
    let address = with_default_port(address);
    debug!("Connecting to daemon at {}", address);

    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("Failed to connect to {}: {}", address, e);
            return Err(e);
        }
        Err(_) => {
            debug!("Connect timeout for {}", address);
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Connect timeout"));
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Connect to the daemon's Unix socket
#[cfg(unix)]
pub async fn connect_unix(path: &Path) -> io::Result<UnixStream> {
    debug!("Connecting to daemon socket {}", path.display());

    match timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "Connect timeout")),
    }
}

fn with_default_port(address: &str) -> String {
    let has_port = match address.rsplit_once(':') {
        // Bracketed IPv6 literal: "[::1]:8765" vs "[::1]"
        Some((host, port)) if host.starts_with('[') => host.ends_with(']') && !port.is_empty(),
        // Unbracketed IPv6 literal carries no port
        Some((host, _)) if host.contains(':') => false,
        Some((_, port)) => !port.is_empty(),
        None => false,
    };
    if has_port {
        address.to_string()
    } else {
        format!("{}:{}", address, DEFAULT_TCP_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(with_default_port("localhost"), "localhost:8765");
        assert_eq!(with_default_port("localhost:9000"), "localhost:9000");
        assert_eq!(with_default_port("10.0.0.5"), "10.0.0.5:8765");
        assert_eq!(with_default_port("[::1]:9000"), "[::1]:9000");
        assert_eq!(with_default_port("[::1]"), "[::1]:8765");
    }

    #[tokio::test]
    async fn test_connect_tcp_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(connect_tcp(&address).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        assert!(connect_tcp(&address).await.is_ok());
        accept.await.unwrap().unwrap();
    }
}
