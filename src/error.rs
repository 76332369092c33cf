//! Error kinds for the hive overlay
//!
//! Every recoverable failure carries one of these kinds so handlers can pick
//! the drop/log policy without string matching. Network- and peer-induced
//! errors are recovered locally; only `Invariant` is surfaced to the operator.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HiveError {
    /// Frame or payload failed structural validation. Drop + debug log.
    #[error("malformed: {0}")]
    Malformed(String),

    /// Sender is not an active member on a member-only channel. Drop.
    #[error("unauthorised: {0}")]
    Unauthorised(String),

    /// A bounded counter or bucket refused the event. Drop + warn.
    #[error("rate limited: {0}")]
    RateLimited(&'static str),

    /// Older version, expired ticket or consumed challenge. Drop.
    #[error("stale: {0}")]
    Stale(&'static str),

    /// Intent lost its tie-break; the abort has been broadcast.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Bridge open, executor missing or peer offline. Fails the current
    /// action only, never the process.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// A bounded timeout expired.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// Internal inconsistency. Logged at error level; side effects are
    /// not executed.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("store: {0}")]
    Store(#[from] sled::Error),

    #[error("storage encoding: {0}")]
    Encoding(#[from] Box<bincode::ErrorKind>),

    #[error("host rpc: {0}")]
    Rpc(String),
}

impl HiveError {
    /// Bridge calls treat expiry as the executor being unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, HiveError::Unavailable(_) | HiveError::Timeout(_))
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(e: serde_json::Error) -> Self {
        HiveError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HiveError>;
