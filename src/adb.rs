//! The collaborator trait standing in for `adb` shell and port-forwarding
//! operations, plus the shell commands used to drive the on-device agent.

use async_trait::async_trait;

use crate::error::Result;

/// Package name of the on-device scripting agent.
pub const AGENT_PKG_NAME: &str = "com.googlecode.android_scripting";

/// Launches the agent's RPC server, hinting at a device port to use.
pub fn launch_server_cmd(device_port: u16) -> String {
    format!(
        "am startservice -a com.googlecode.android_scripting.action.LAUNCH_SERVER \
         --ei com.googlecode.android_scripting.extra.USE_SERVICE_PORT {device_port} \
         com.googlecode.android_scripting/.service.ScriptingLayerService"
    )
}

/// Closes a single agent RPC server by its proxy port.
pub fn close_server_cmd(proxy_port: u16) -> String {
    format!(
        "am startservice -a com.googlecode.android_scripting.action.KILL_PROCESS \
         --ei com.googlecode.android_scripting.extra.PROXY_PORT {proxy_port} \
         com.googlecode.android_scripting/.service.ScriptingLayerService"
    )
}

/// Lists listening TCP ports owned by the agent process, when root.
pub const ROOT_FIND_PORT_CMD: &str = concat!(
    "ss -l -p -n | ",
    "grep \"tcp.*droid_scripting\" | ",
    "tr -s \" \" | ",
    "cut -d \" \" -f 5 | ",
    "sed s/.*://g"
);

/// Lists listening TCP ports that look like the agent, without root.
///
/// Can produce false positives, since the process name isn't visible
/// without root.
pub const USER_FIND_PORT_CMD: &str = concat!(
    "ss -l -p -n | ",
    "grep -e \"tcp.*::ffff:127\\.0\\.0\\.1:\" | ",
    "tr -s \" \" | ",
    "cut -d \" \" -f 5 | ",
    "sed s/.*://g"
);

/// Starts the agent's scripting service if it isn't already running.
pub const START_SERVICE_CMD: &str =
    "am startservice com.googlecode.android_scripting/.service.ScriptingLayerService";

/// A collaborator over one Android device's ADB connection.
///
/// Implementations own the actual `adb` subprocess plumbing; this crate
/// only depends on the surface below.
#[async_trait]
pub trait Adb: Send + Sync {
    /// The device serial this collaborator is bound to.
    fn serial(&self) -> &str;

    /// Forwards `device_port` on the device to `host_port` on the host.
    ///
    /// Pass `host_port = 0` to let the OS choose. Returns the host port
    /// actually bound.
    async fn tcp_forward(&self, host_port: u16, device_port: u16) -> Result<u16>;

    /// Removes a previously established port forward.
    async fn remove_tcp_forward(&self, host_port: u16) -> Result<()>;

    /// Lists all active port forwards, in `adb forward --list` format.
    async fn list_forwards(&self) -> Result<String>;

    /// Runs a shell command on the device and returns its stdout.
    async fn shell(&self, command: &str) -> Result<String>;

    /// Returns the output of `adb devices`.
    async fn devices(&self) -> Result<String>;

    /// Returns whether the ADB daemon is already running as root.
    async fn is_root(&self) -> Result<bool>;

    /// Requests a restart of `adbd` as root, returning the new root state.
    async fn ensure_root(&self) -> Result<bool>;

    /// The numeric version of the host's `adb` binary, e.g. `37` for `1.0.37`.
    async fn version_number(&self) -> Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_server_cmd_embeds_the_hinted_port() {
        let cmd = launch_server_cmd(1234);
        assert!(cmd.contains("1234"));
        assert!(cmd.contains("LAUNCH_SERVER"));
        assert!(cmd.contains(AGENT_PKG_NAME));
    }

    #[test]
    fn close_server_cmd_embeds_the_proxy_port() {
        let cmd = close_server_cmd(4321);
        assert!(cmd.contains("4321"));
        assert!(cmd.contains("KILL_PROCESS"));
    }

    #[test]
    fn root_and_user_find_port_commands_differ() {
        assert_ne!(ROOT_FIND_PORT_CMD, USER_FIND_PORT_CMD);
        assert!(ROOT_FIND_PORT_CMD.contains("droid_scripting"));
        assert!(USER_FIND_PORT_CMD.contains("127.0.0.1"));
    }
}
