//! Error types for the SL4A RPC stack.

use thiserror::Error;

/// The crate's error taxonomy.
///
/// Mirrors the shape of the original exception hierarchy (connection,
/// protocol, API, timeout, start-up) onto a flat `thiserror` enum rather
/// than a class tree.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Sl4aError {
    /// Failed to connect, or lost connection, to the on-device agent.
    #[error("connection error: {0}")]
    Connection(String),

    /// Something went wrong in the session-setup or RPC framing protocol.
    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// The remote agent reported an error executing the RPC.
    #[error("error in rpc {rpc_name} {code}:{message}")]
    Api {
        /// Error code returned by the agent. Not a process exit code.
        code: i64,
        /// Human-readable message from the agent.
        message: String,
        /// Extra structured data attached to the error, if any.
        data: serde_json::Value,
        /// Name of the RPC method that was called.
        rpc_name: String,
    },

    /// An RPC did not complete before its timeout elapsed.
    #[error("rpc timed out: {0}")]
    RpcTimeout(String),

    /// The agent could not be started.
    #[error("failed to start sl4a: {0}")]
    Start(String),

    /// The agent is not installed on the target device.
    #[error("sl4a is not installed: {0}")]
    NotInstalled(String),

    /// A call was made against a session that has already been terminated.
    #[error("this sl4a session has already been terminated")]
    Terminated,

    /// A pop or wait call timed out without finding a matching event.
    #[error("empty queue: {0}")]
    EmptyQueue(String),

    /// An operation was attempted in the wrong dispatcher lifecycle state.
    #[error("illegal dispatcher state: {0}")]
    IllegalState(&'static str),

    /// A handler for this event name is already registered.
    #[error("a handler for {0} is already registered")]
    Duplicate(String),

    /// The underlying ADB collaborator reported a failure.
    #[error("adb error: {0}")]
    Adb(String),

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to encode or decode a JSON frame.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Sl4aError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_message_includes_rpc_name_and_code() {
        let err = Sl4aError::Api {
            code: -2,
            message: "bad params".to_string(),
            data: serde_json::Value::Null,
            rpc_name: "someRpc".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("someRpc"));
        assert!(rendered.contains("-2"));
        assert!(rendered.contains("bad params"));
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: Sl4aError = io_err.into();
        assert!(matches!(err, Sl4aError::Io(_)));
    }

    #[test]
    fn json_error_converts_via_from() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Sl4aError = json_err.into();
        assert!(matches!(err, Sl4aError::Json(_)));
    }

    #[test]
    fn terminated_has_a_stable_message() {
        assert_eq!(
            Sl4aError::Terminated.to_string(),
            "this sl4a session has already been terminated"
        );
    }

    #[test]
    fn empty_queue_message_includes_detail() {
        let err = Sl4aError::EmptyQueue("no event named Foo".to_string());
        assert!(err.to_string().contains("no event named Foo"));
    }

    #[test]
    fn duplicate_message_includes_event_name() {
        let err = Sl4aError::Duplicate("Foo".to_string());
        assert!(err.to_string().contains("Foo"));
    }
}
