//! A single connection to the on-device agent: session handshake, line
//! framing, and per-connection ticket allocation.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::adb::Adb;
use crate::error::{Result, Sl4aError};
use crate::port::Ports;

/// The default timeout applied to a connection when none is specified.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Session UID placeholder before a handshake has assigned a real one.
pub const UNKNOWN_UID: i64 = -1;

#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    cmd: &'a str,
    uid: i64,
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    status: bool,
    uid: i64,
}

/// One TCP connection from the host to the forwarded agent server port.
///
/// Owns both halves of the socket behind `tokio::sync::Mutex`, since send
/// and receive each cross an await point and can be driven from different
/// call sites (the RPC client for requests, the event dispatcher for the
/// long poll).
pub struct Connection {
    adb: Arc<dyn Adb>,
    ports: Ports,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    ticket_counter: AtomicU64,
    uid: AtomicI64,
    timeout: Mutex<Duration>,
    closed: AtomicBool,
}

impl Connection {
    /// Binds (if a client port hint is given) and connects to the
    /// forwarded port, retrying with an OS-assigned port on collision.
    ///
    /// Mirrors the host-port bind dance: a bind failure due to
    /// `EADDRINUSE` retries with port 0, and a post-connect
    /// `EADDRNOTAVAIL` (the hinted port was stolen between bind and
    /// connect) also retries with port 0.
    async fn open_socket(mut ports: Ports) -> Result<(TcpStream, Ports)> {
        loop {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;

            if ports.client_port != 0 {
                let bind_addr = std::net::SocketAddr::from(([0, 0, 0, 0], ports.client_port));
                if let Err(e) = socket.bind(bind_addr) {
                    if e.kind() == std::io::ErrorKind::AddrInUse {
                        tracing::warn!(
                            port = ports.client_port,
                            "host port already in use, retrying with a random port"
                        );
                        ports.client_port = 0;
                        continue;
                    }
                    return Err(e.into());
                }
            }

            let target =
                std::net::SocketAddr::from(([127, 0, 0, 1], ports.forwarded_port));
            match tokio::time::timeout(SOCKET_TIMEOUT, socket.connect(target)).await {
                Err(_) => {
                    return Err(Sl4aError::Connection(format!(
                        "agent did not connect over port {} within {:?}",
                        ports.forwarded_port, SOCKET_TIMEOUT
                    )))
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::AddrNotAvailable => {
                    ports.client_port = 0;
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(stream)) => {
                    ports.client_port = stream.local_addr()?.port();
                    return Ok((stream, ports));
                }
            }
        }
    }

    /// Connects to the device and opens a new connection, without yet
    /// performing the session handshake.
    ///
    /// `timeout` seeds the connection's response deadline, used for the
    /// handshake itself and for any subsequent call that doesn't override
    /// it with [`Connection::set_timeout`].
    pub async fn connect(adb: Arc<dyn Adb>, ports: Ports, uid: i64, timeout: Duration) -> Result<Self> {
        let (stream, ports) = Self::open_socket(ports).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            adb,
            ports,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            ticket_counter: AtomicU64::new(0),
            uid: AtomicI64::new(uid),
            timeout: Mutex::new(timeout),
            closed: AtomicBool::new(false),
        })
    }

    /// Performs the session handshake: `initiate` for a brand new session,
    /// `continue` to resume one whose UID is already known.
    pub async fn open(&self) -> Result<()> {
        let start_command = if self.uid() != UNKNOWN_UID {
            "continue"
        } else {
            "initiate"
        };
        let request = serde_json::to_string(&HandshakeRequest {
            cmd: start_command,
            uid: self.uid(),
        })?;
        self.send_request(&request).await?;
        let handshake_timeout = *self.timeout.lock().await;
        let response = self.get_response(handshake_timeout).await?;
        if response.is_empty() {
            return Err(Sl4aError::Protocol("no response from handshake"));
        }
        let result: HandshakeResponse = serde_json::from_str(&response)?;
        if result.status {
            self.uid.store(result.uid, Ordering::SeqCst);
        } else {
            tracing::warn!(ports = %self.ports, "uid not received for connection");
            self.uid.store(UNKNOWN_UID, Ordering::SeqCst);
        }
        debug!(ports = %self.ports, "created connection");
        Ok(())
    }

    /// The ports this connection was established over.
    pub fn ports(&self) -> Ports {
        self.ports
    }

    /// The session UID assigned by the agent, or [`UNKNOWN_UID`].
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::SeqCst)
    }

    /// Allocates the next request ticket for this connection.
    pub fn next_ticket(&self) -> u64 {
        self.ticket_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Sets the timeout applied to subsequent reads on this connection.
    pub async fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock().await = timeout;
    }

    /// Sends a single newline-terminated line over the connection.
    pub async fn send_request(&self, request: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(request.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        debug!(%request, "sent");
        Ok(())
    }

    /// Reads one newline-terminated response.
    ///
    /// An empty string means the peer closed the stream without sending
    /// anything (treated as "no response" by callers); a deadline exceeded
    /// surfaces as [`Sl4aError::RpcTimeout`].
    pub async fn get_response(&self, deadline: Duration) -> Result<String> {
        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        match tokio::time::timeout(deadline, reader.read_line(&mut line)).await {
            Err(_) => Err(Sl4aError::RpcTimeout(format!(
                "no response within {deadline:?}"
            ))),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) => Ok(String::new()),
            Ok(Ok(_)) => {
                let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
                debug!(response = %trimmed, "received");
                Ok(trimmed)
            }
        }
    }

    /// Sends a request and waits for the agent's reply, using this
    /// connection's currently configured timeout.
    pub async fn call_raw(&self, request: &str) -> Result<String> {
        self.send_request(request).await?;
        let timeout = *self.timeout.lock().await;
        self.get_response(timeout).await
    }

    /// Parses a raw JSON-RPC-ish response body.
    pub fn parse_response(body: &str) -> Result<Value> {
        Ok(serde_json::from_str(body)?)
    }

    /// Closes the connection and removes the device-side port forward.
    ///
    /// Idempotent: a connection may be closed twice if a forced shutdown
    /// (pool termination) races with its caller's own cleanup, so a second
    /// call is a no-op rather than a double-removal of the port forward.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.adb.remove_tcp_forward(self.ports.forwarded_port).await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("ports", &self.ports)
            .field("uid", &self.uid())
            .finish()
    }
}
