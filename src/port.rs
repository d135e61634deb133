//! The three-port tuple threaded through connection setup.

use std::fmt;

/// The three ports involved in a single connection to the on-device agent.
///
/// A value of `0` for any field means "let the OS choose"; callers treat
/// these as hints, not guarantees, since the requested port may already be
/// taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ports {
    /// The port on the host this client is bound to.
    pub client_port: u16,
    /// The port on the host forwarded to the device via ADB.
    pub forwarded_port: u16,
    /// The port on the device the agent's server is listening on.
    pub server_port: u16,
}

impl Ports {
    /// Creates a new port tuple from explicit values.
    pub fn new(client_port: u16, forwarded_port: u16, server_port: u16) -> Self {
        Self {
            client_port,
            forwarded_port,
            server_port,
        }
    }
}

impl fmt::Display for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            self.client_port, self.forwarded_port, self.server_port
        )
    }
}
