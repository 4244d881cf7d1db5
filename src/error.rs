//! Error kinds shared across the crate's components.

use std::{fmt, sync::Arc};

use snafu::Snafu;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by [`BatchBuilder`](crate::BatchBuilder),
/// [`AliveKeeper`](crate::AliveKeeper), and
/// [`BatchSubscriber`](crate::BatchSubscriber).
#[derive(Debug, Clone, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The user's batch call returned no response matching the request's
    /// key.
    #[snafu(display("batch call returned no response for key {key}"))]
    MissingResponse {
        /// `Debug` rendering of the offending key.
        key: String,
    },

    /// The user's batch call itself failed; every pending request in that
    /// batch fails with this cause.
    #[snafu(display("batch call failed: {source}"))]
    BatchFailed {
        /// The underlying failure reported by the user's batch operation.
        /// Shared (not boxed) because every mailbox in the offending batch
        /// is resolved with the same error value.
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// A suspension point observed cancellation of a merged token.
    #[snafu(display("operation was cancelled"))]
    Cancelled,

    /// [`Agent::enqueue`](crate::agent::Agent) or
    /// [`MailboxAgent::enqueue`](crate::agent::MailboxAgent) could not
    /// accept an item because the inbound channel has been closed.
    #[snafu(display("inbound queue is no longer accepting items"))]
    QueueFull,
}

impl Error {
    /// Builds a [`Error::MissingResponse`] from any `Debug`-able key.
    pub fn missing_response(key: impl fmt::Debug) -> Self {
        Error::MissingResponse {
            key: format!("{key:?}"),
        }
    }

    /// Builds a [`Error::BatchFailed`] from any error implementation.
    pub fn batch_failed(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::BatchFailed {
            source: Arc::new(source),
        }
    }

    /// True if this error represents the batch call itself failing (as
    /// opposed to a per-key missing-response failure).
    #[must_use]
    pub fn is_batch_failure(&self) -> bool {
        matches!(self, Error::BatchFailed { .. })
    }
}
