//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the dryer-control path returns
//! `Result<T, DryerError>` so callers can match on the kind of failure
//! (the Supervisor, for example, treats `Upstream`/`Timeout`/`Unreachable`
//! very differently from `Fatal`). `anyhow` is reserved for the CLI/config
//! edges, where a human just needs a readable chain of context.

use derive_more::{Display, Error};

#[derive(Debug, Display, Error, Clone)]
pub enum DryerError {
    /// Could not reach Moonraker at all (connection refused, DNS, etc).
    #[display("moonraker unreachable: {_0}")]
    Unreachable(String),

    /// A Moonraker call exceeded its deadline.
    #[display("moonraker call timed out after {_0:?}")]
    Timeout(std::time::Duration),

    /// Moonraker responded, but not with a success status.
    #[display("moonraker returned an error response: {_0}")]
    Upstream(String),

    /// A field we expected Moonraker (or its config) to report was absent.
    #[display("expected data missing from moonraker: {_0}")]
    ConfigMissing(String),

    /// A dryer, preset, or link does not exist in the store.
    #[display("not found: {_0}")]
    NotFound(String),

    /// An operation was attempted from a state that does not support it
    /// (e.g. deriving a soft-motion start angle with no pulse-width reading
    /// at all yet).
    #[display("invalid state: {_0}")]
    InvalidState(String),

    /// Anything else: surfaced to the caller only so the process can log
    /// and shut down cleanly, never expected to be matched on.
    #[display("fatal error: {_0}")]
    Fatal(String),
}

impl From<std::io::Error> for DryerError {
    fn from(err: std::io::Error) -> Self {
        DryerError::Fatal(err.to_string())
    }
}

impl From<serde_json::Error> for DryerError {
    fn from(err: serde_json::Error) -> Self {
        DryerError::Upstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DryerError>;
