/// Unified error handling for the router.
///
/// Retry loops in the read and write pipelines match on these variants
/// rather than on a type hierarchy: transport errors, `ShardConfigStale`
/// and `NotMaster` are recovered locally, everything else surfaces to the
/// client as a reply document.
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Transport-level failure talking to a backend or a client.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Backend reported that a cursor is gone.
    #[error("cursor not found: {0}")]
    CursorNotFound(String),

    /// Backend returned a structured error on a query.
    #[error("query failure: {0}")]
    QueryFailure(String),

    /// Backend believes our topology is older than its own.
    #[error("shard config stale: {0}")]
    ShardConfigStale(String),

    /// Backend refused a write because it is no longer primary.
    #[error("not master")]
    NotMaster,

    /// Backend is permanently incapable of operating as a primary.
    #[error("permanent failure on {addr}: {message}")]
    PermanentFailure { addr: String, message: String },

    /// DNS / resolve / transient lookup failure.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// No alive backend satisfies the selection rules.
    #[error("no suitable backend: {0}")]
    NoSuitableBackend(String),

    /// No topology snapshot has been fetched yet.
    #[error("no shard config available yet")]
    NoShardConfig,

    /// Topology snapshot is internally inconsistent.
    #[error("shard config broken: {0}")]
    ShardConfigBroken(String),

    /// Client sent a malformed or rejected request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Privilege check failed.
    #[error("unauthorized")]
    Unauthorized,

    /// Reachable path we refuse to execute.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Backend violated the wire protocol.
    #[error("backend internal error: {0}")]
    BackendInternal(String),

    /// Operation exceeded its deadline.
    #[error("timeout while {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Error::BadRequest(msg.into())
    }

    pub fn backend_internal<S: Into<String>>(msg: S) -> Self {
        Error::BackendInternal(msg.into())
    }

    /// True if retrying the operation (possibly against another backend or
    /// with a refreshed topology) may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout(_)
                | Error::Connectivity(_)
                | Error::ShardConfigStale(_)
                | Error::NotMaster
        )
    }

    /// True if the error was reported by a backend in a sane, structured way
    /// (as opposed to a transport failure or a protocol violation). Hedging
    /// must not mask these.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::CursorNotFound(_)
                | Error::QueryFailure(_)
                | Error::ShardConfigStale(_)
                | Error::NotMaster
                | Error::PermanentFailure { .. }
        )
    }

    /// Numeric code used when the error is rendered into a command reply.
    pub fn code(&self) -> i32 {
        match self {
            Error::CursorNotFound(_) => 43,
            Error::NotMaster => 10058,
            Error::Unauthorized => 13,
            Error::BadRequest(_) => 8,
            Error::NotImplemented(_) => 59,
            Error::NoShardConfig | Error::ShardConfigBroken(_) => 71,
            _ => 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(Error::NotMaster.is_recoverable());
        assert!(Error::ShardConfigStale("old".into()).is_recoverable());
        assert!(Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "x")).is_recoverable());
        assert!(!Error::BadRequest("nope".into()).is_recoverable());
        assert!(!Error::Unauthorized.is_recoverable());
    }

    #[test]
    fn test_client_errors_not_masked_by_hedging() {
        assert!(Error::QueryFailure("bad $where".into()).is_client_error());
        assert!(Error::NotMaster.is_client_error());
        assert!(!Error::Timeout("query".into()).is_client_error());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "x")).is_client_error());
    }

    #[test]
    fn test_display() {
        let e = Error::NoSuitableBackend("shard rs0".into());
        assert_eq!(e.to_string(), "no suitable backend: shard rs0");
    }
}
