use thiserror::Error;

/// Convenience alias for `Result<T, HeronError>`.
pub type HeronResult<T> = Result<T, HeronError>;

/// Top-level error type that all layer errors convert into.
#[derive(Error, Debug)]
pub enum HeronError {
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("query error: {0}")]
    Query(#[from] QueryError),

    #[error("write error: {0}")]
    Write(#[from] WriteError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Should never occur in production. Carries a stable code for
    /// post-mortem grepping.
    #[error("internal [{code}]: {message}")]
    Internal { code: &'static str, message: String },
}

impl HeronError {
    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        HeronError::Internal {
            code,
            message: message.into(),
        }
    }
}

/// Errors attributable to a single upstream peer. These are recovered
/// into the response's `failed` map; the request proceeds without the
/// peer.
#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("peer {id} is offline: {reason}")]
    Offline { id: String, reason: String },

    #[error("peer {id} has no {table} store (not yet updated)")]
    TableNotLoaded { id: String, table: String },

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("remote answered with an invalid result: {0}")]
    InvalidResult(String),
}

/// Request-scoped errors surfaced through `Response::error`.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("table {0} does not exist")]
    UnknownTable(String),

    #[error("bad request: table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("bad request: invalid regular expression: {0}")]
    BadRegex(String),

    /// All requested backends failed; the message is the first requested
    /// backend's failure.
    #[error("{0}")]
    AllBackendsFailed(String),

    #[error("request canceled")]
    Canceled,
}

/// Socket-level failures while flushing a response.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Fixed-16 framing promised a byte count the body did not honor.
    #[error("response length mismatch: header announced {announced}, wrote {written}")]
    LengthMismatch { announced: u64, written: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_error_into_heron() {
        let err: HeronError = PeerError::Offline {
            id: "p1".into(),
            reason: "conn refused".into(),
        }
        .into();
        assert!(err.to_string().contains("p1"));
        assert!(err.to_string().contains("conn refused"));
    }

    #[test]
    fn test_all_backends_failed_is_bare_message() {
        // The wire body for a 502 is the raw peer message, nothing else.
        let err = QueryError::AllBackendsFailed("down".into());
        assert_eq!(err.to_string(), "down");
    }

    #[test]
    fn test_internal_carries_code() {
        let err = HeronError::internal("E-RESP-001", "impossible state");
        assert!(err.to_string().contains("E-RESP-001"));
    }
}
