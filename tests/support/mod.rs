//! Shared test doubles: an `Adb` collaborator backed by a real loopback
//! socket, and a scripted mock agent speaking the line-based handshake/RPC
//! protocol on the other end of it.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sl4a_rpc::{Adb, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// One scripted reply to the next request line the agent reads.
pub enum Step {
    /// Write an empty line, simulating "no response for this rpc" (the
    /// client retries on this).
    Blank,
    /// Echo the request's own `id` back with this result value.
    Result(Value),
    /// Write this exact line, verbatim, ignoring the request entirely.
    Raw(String),
}

/// An `Adb` double whose `tcp_forward` always resolves to the loopback
/// port a [`spawn_mock_agent`] is actually listening on, regardless of the
/// hinted device/host ports.
pub struct LoopbackAdb {
    serial: String,
    agent_port: u16,
    shell_responses: HashMap<&'static str, String>,
}

impl LoopbackAdb {
    pub fn new(serial: impl Into<String>, agent_port: u16) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            agent_port,
            shell_responses: HashMap::new(),
        })
    }

    /// Like [`LoopbackAdb::new`], but `shell` answers with the first
    /// response whose key is a substring of the command, falling back to
    /// an empty string otherwise.
    pub fn with_shell(
        serial: impl Into<String>,
        agent_port: u16,
        shell_responses: &[(&'static str, &str)],
    ) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            agent_port,
            shell_responses: shell_responses
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect(),
        })
    }
}

#[async_trait]
impl Adb for LoopbackAdb {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn tcp_forward(&self, _host_port: u16, _device_port: u16) -> Result<u16> {
        Ok(self.agent_port)
    }

    async fn remove_tcp_forward(&self, _host_port: u16) -> Result<()> {
        Ok(())
    }

    async fn list_forwards(&self) -> Result<String> {
        Ok(format!(
            "{} tcp:{} tcp:{}",
            self.serial, self.agent_port, self.agent_port
        ))
    }

    async fn shell(&self, command: &str) -> Result<String> {
        for (needle, response) in &self.shell_responses {
            if command.contains(needle) {
                return Ok(response.clone());
            }
        }
        Ok(String::new())
    }

    async fn devices(&self) -> Result<String> {
        Ok(format!("{}\tdevice\n", self.serial))
    }

    async fn is_root(&self) -> Result<bool> {
        Ok(true)
    }

    async fn ensure_root(&self) -> Result<bool> {
        Ok(true)
    }

    async fn version_number(&self) -> Result<u32> {
        Ok(40)
    }
}

/// Starts a loopback TCP listener that accepts one connection, performs the
/// session handshake, then answers each subsequent request line with the
/// next step from `steps` (falling back to a null result for any request
/// past the end of the script).
///
/// Returns the port it bound to; the accept/serve loop runs on a spawned
/// task for the lifetime of the test process.
pub async fn spawn_mock_agent(uid: i64, steps: Vec<Step>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let steps = Arc::new(Mutex::new(VecDeque::from(steps)));

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Handshake.
        let mut line = String::new();
        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
            return;
        }
        let handshake_reply = serde_json::json!({"status": true, "uid": uid}).to_string();
        write_half
            .write_all(format!("{handshake_reply}\n").as_bytes())
            .await
            .unwrap();
        write_half.flush().await.unwrap();

        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            let request: Value = match serde_json::from_str(line.trim_end()) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let id = request.get("id").and_then(|v| v.as_u64()).unwrap_or(0);

            let step = steps.lock().pop_front();
            let outgoing = match step {
                None => serde_json::json!({"id": id, "result": Value::Null, "error": Value::Null})
                    .to_string(),
                Some(Step::Blank) => String::new(),
                Some(Step::Result(result)) => {
                    serde_json::json!({"id": id, "result": result, "error": Value::Null})
                        .to_string()
                }
                Some(Step::Raw(raw)) => raw,
            };
            if write_half
                .write_all(format!("{outgoing}\n").as_bytes())
                .await
                .is_err()
            {
                return;
            }
            if write_half.flush().await.is_err() {
                return;
            }
        }
    });

    port
}
