//! Unified error handling for the agent.
//!
//! Low-level failures are classified at the I/O boundary into one
//! [`AgentError`] kind; everything above pattern-matches the kind and
//! never the underlying cause. Reconnect policy, logging and the
//! control-plane error surface all key off these kinds.

use thiserror::Error;

/// The agent-wide error taxonomy.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Invalid or missing configuration; fatal for the affected subsystem.
    #[error("config error: {0}")]
    Config(String),

    /// DNS, TCP or proxy failure. Retried under auto-reconnect.
    #[error("transport error: {0}")]
    Transport(String),

    /// TLS handshake or certificate validation failure.
    #[error("tls error: {0}")]
    Tls(String),

    /// Malformed IRC line or framing violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SASL, server password, control-plane HMAC or mesh challenge
    /// failure. Never auto-retried.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Keepalive, connect or handshake deadline missed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// API called from a state where it is not legal.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation cancelled by shutdown or caller.
    #[error("cancelled")]
    Cancelled,

    /// Access-database check failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl AgentError {
    /// Stable machine-readable code for logs and the control plane.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Transport(_) => "transport",
            Self::Tls(_) => "tls",
            Self::Protocol(_) => "protocol",
            Self::AuthFailed(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::PermissionDenied(_) => "permission_denied",
        }
    }

    /// Whether auto-reconnect may retry after this failure.
    ///
    /// Timeouts and protocol faults are treated as transport-class;
    /// authentication failures halt until configuration changes.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Protocol(_)
        )
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> AgentError {
        if e.kind() == std::io::ErrorKind::TimedOut {
            AgentError::Timeout(e.to_string())
        } else {
            AgentError::Transport(e.to_string())
        }
    }
}

impl From<munin_proto::ProtocolError> for AgentError {
    fn from(e: munin_proto::ProtocolError) -> AgentError {
        AgentError::Protocol(e.to_string())
    }
}

/// Agent-wide result alias.
pub type AgentResult<T> = Result<T, AgentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(AgentError::Config("x".into()).error_code(), "config");
        assert_eq!(AgentError::Cancelled.error_code(), "cancelled");
        assert_eq!(
            AgentError::AuthFailed("sasl".into()).error_code(),
            "auth_failed"
        );
    }

    #[test]
    fn retry_policy_follows_kind() {
        assert!(AgentError::Transport("refused".into()).is_retriable());
        assert!(AgentError::Timeout("ping".into()).is_retriable());
        assert!(AgentError::Protocol("bad frame".into()).is_retriable());
        assert!(!AgentError::AuthFailed("904".into()).is_retriable());
        assert!(!AgentError::Cancelled.is_retriable());
        assert!(!AgentError::InvalidState("connect".into()).is_retriable());
    }

    #[test]
    fn io_timeout_maps_to_timeout() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(AgentError::from(e).error_code(), "timeout");
        let e = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no");
        assert_eq!(AgentError::from(e).error_code(), "transport");
    }
}
