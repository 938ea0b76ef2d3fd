//! Error types for a probe session.

use thiserror::Error;

/// Everything that can abort a trace.
///
/// Hop timeouts are deliberately absent: an unanswered probe is an ordinary
/// outcome of the bounded receive, not an error.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("cannot resolve destination {host}: {reason}")]
    Resolution { host: String, reason: String },

    #[error("insufficient privileges for raw sockets (run as root or grant CAP_NET_RAW): {0}")]
    Permission(#[source] std::io::Error),

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TraceError {
    /// Classify a socket error raised while acquiring a hop's sockets.
    pub fn from_socket(context: &'static str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            TraceError::Permission(source)
        } else {
            TraceError::Io { context, source }
        }
    }

    /// Errors that can only happen before the first probe is sent.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::Resolution { .. } | Self::Permission(_) | Self::InvalidConfig(_)
        )
    }
}
