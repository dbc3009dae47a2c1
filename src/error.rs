//! Typed errors surfaced by the engine.

use thiserror::Error;

/// Failure categories reported by the host dialer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialErrorKind {
    Blocked,
    HostUnreachable,
    Timeout,
    Refused,
    Cancelled,
}

impl DialErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DialErrorKind::Blocked => "blocked",
            DialErrorKind::HostUnreachable => "host_unreachable",
            DialErrorKind::Timeout => "timeout",
            DialErrorKind::Refused => "refused",
            DialErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {}", issues.join("; "))]
    InvalidConfiguration { issues: Vec<String> },

    #[error("network settings failed: {0}")]
    NetworkSettingsFailed(String),

    #[error("engine start failed: {0}")]
    EngineStartFailed(String),

    /// Recoverable: closes the affected flow, never stops the engine.
    #[error("dial to {host}:{port} failed ({})", kind.as_str())]
    DialFailed {
        kind: DialErrorKind,
        host: String,
        port: u16,
    },

    /// Policy decision scoped to a single flow.
    #[error("host {host} blocked by policy")]
    Blocked { host: String },
}

impl EngineError {
    /// Fatal errors halt the engine; everything else closes one flow at most.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidConfiguration { .. }
                | EngineError::NetworkSettingsFailed(_)
                | EngineError::EngineStartFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_failures_are_not_fatal() {
        let error = EngineError::DialFailed {
            kind: DialErrorKind::Refused,
            host: "example.com".into(),
            port: 443,
        };
        assert!(!error.is_fatal());
        assert!(error.to_string().contains("refused"));
    }

    #[test]
    fn configuration_issues_join_in_message() {
        let error = EngineError::InvalidConfiguration {
            issues: vec!["mtu out of range".into(), "bad ipv4 address".into()],
        };
        assert!(error.is_fatal());
        assert!(error.to_string().contains("mtu out of range"));
        assert!(error.to_string().contains("bad ipv4 address"));
    }
}
