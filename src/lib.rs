//! A concurrency core for driving an on-device JSON-RPC scripting agent
//! (SL4A) over an ADB port forward.
//!
//! ## Architecture
//!
//! - [`adb`] — the collaborator trait over ADB shell/port-forward operations.
//! - [`port`] — the three-port tuple threaded through connection setup.
//! - [`connection`] — a single framed TCP connection and its handshake.
//! - [`rpc_client`] — the connection pool and retrying RPC call discipline.
//! - [`dispatcher`] — event polling, queuing, and handler dispatch.
//! - [`session`] — one SL4A session's lifecycle.
//! - [`manager`] — the per-device-serial session registry and agent lifecycle.
//! - [`reporter`] — the bounded diagnostic probe chain run after failures.
//!
//! Sessions are obtained through [`manager::get_or_create_manager`], since
//! only one manager may exist per device serial at a time.

pub mod adb;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod port;
pub mod reporter;
pub mod rpc_client;
pub mod session;

pub use adb::Adb;
pub use connection::Connection;
pub use dispatcher::{Event, EventDispatcher};
pub use error::{Result, Sl4aError};
pub use manager::{get_or_create_manager, Sl4aManager};
pub use port::Ports;
pub use reporter::ErrorReporter;
pub use rpc_client::{AsyncRpcClient, RpcClient};
pub use session::Sl4aSession;

use std::time::Duration;

/// Tunable limits applied across a manager and the sessions it creates.
///
/// Mirrors the teacher pattern of a single `Config` struct with a
/// `Default` impl and a consuming `with_*` builder, rather than a long
/// argument list.
#[derive(Debug, Clone)]
pub struct Sl4aConfig {
    /// The maximum number of connections a session's RPC client may open.
    pub max_connections: usize,
    /// The timeout applied to an RPC call when no per-call override is given.
    pub rpc_timeout: Duration,
    /// The number of attempts an RPC call makes before giving up.
    pub retries: u32,
    /// The timeout applied to the session-setup handshake.
    pub handshake_timeout: Duration,
    /// The poll duration, in milliseconds, passed to the agent's
    /// `eventWait` RPC.
    pub event_wait_ms: u64,
    /// The RPC-level timeout wrapped around each `eventWait` call; longer
    /// than `event_wait_ms` itself to allow for the round trip.
    pub event_rpc_timeout: Duration,
    /// How many concurrent diagnostic reports a manager's error reporter
    /// will generate before refusing further requests.
    pub reporter_max_reports: u64,
    /// How long a connection checkout backs off before retrying against a
    /// full pool.
    pub checkout_backoff: Duration,
    /// How often [`reporter::ErrorReporter::finalize`] polls while
    /// draining in-flight reports.
    pub reporter_drain_poll: Duration,
    /// How often [`manager::Sl4aManager`] re-polls for a newly launched
    /// server, or for closed servers to disappear.
    pub discovery_poll_interval: Duration,
    /// The upper bound on how long either of the above polls may run.
    pub discovery_timeout: Duration,
}

impl Default for Sl4aConfig {
    fn default() -> Self {
        Self {
            max_connections: rpc_client::DEFAULT_MAX_CONNECTIONS,
            rpc_timeout: connection::SOCKET_TIMEOUT,
            retries: rpc_client::DEFAULT_RETRIES,
            handshake_timeout: connection::SOCKET_TIMEOUT,
            event_wait_ms: 60_000,
            event_rpc_timeout: Duration::from_secs(120),
            reporter_max_reports: 1,
            checkout_backoff: Duration::from_millis(10),
            reporter_drain_poll: Duration::from_millis(100),
            discovery_poll_interval: Duration::from_millis(250),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

impl Sl4aConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection pool's cap.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the default per-call RPC timeout.
    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// Set the number of attempts an RPC call makes before giving up.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the session-setup handshake timeout.
    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Set the poll duration passed to `eventWait`, in milliseconds.
    pub fn with_event_wait_ms(mut self, event_wait_ms: u64) -> Self {
        self.event_wait_ms = event_wait_ms;
        self
    }

    /// Set the RPC-level timeout wrapped around each `eventWait` call.
    pub fn with_event_rpc_timeout(mut self, event_rpc_timeout: Duration) -> Self {
        self.event_rpc_timeout = event_rpc_timeout;
        self
    }

    /// Set the error reporter's concurrent-report cap.
    pub fn with_reporter_max_reports(mut self, reporter_max_reports: u64) -> Self {
        self.reporter_max_reports = reporter_max_reports;
        self
    }

    /// Set the connection checkout backoff.
    pub fn with_checkout_backoff(mut self, checkout_backoff: Duration) -> Self {
        self.checkout_backoff = checkout_backoff;
        self
    }

    /// Set the error reporter's drain poll interval.
    pub fn with_reporter_drain_poll(mut self, reporter_drain_poll: Duration) -> Self {
        self.reporter_drain_poll = reporter_drain_poll;
        self
    }

    /// Set the manager's server-discovery poll interval.
    pub fn with_discovery_poll_interval(mut self, discovery_poll_interval: Duration) -> Self {
        self.discovery_poll_interval = discovery_poll_interval;
        self
    }

    /// Set the manager's server-discovery timeout.
    pub fn with_discovery_timeout(mut self, discovery_timeout: Duration) -> Self {
        self.discovery_timeout = discovery_timeout;
        self
    }
}
