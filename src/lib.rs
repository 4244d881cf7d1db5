//! Concurrent primitives for driving batched, long-lived interactions with
//! external data sources whose items have bounded lifetime claims.
//!
//! Three coordination components, built on top of a handful of smaller
//! pieces:
//!
//! - [`BatchBuilder`][batch_builder::BatchBuilder] coalesces many concurrent
//!   single-item requests into bounded-size batched calls, and demultiplexes
//!   the responses back to the individual callers.
//! - [`AliveKeeper`][alive_keeper::AliveKeeper] runs a periodic touch
//!   (renew-claim) loop per registered item and an on-demand delete
//!   (release-claim) path, both served through `BatchBuilder`s.
//! - [`BatchSubscriber`][subscriber::BatchSubscriber] drives a poll / touch /
//!   delete source: it pulls batches of messages, registers each with an
//!   `AliveKeeper`, dispatches them to a handler under a concurrency limit,
//!   and deletes the receipt on success.
//!
//! This crate promises at-least-once delivery, not exactly-once: touch and
//! delete calls may be retried.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions, clippy::type_complexity)]

#[macro_use]
extern crate tracing;

pub mod agent;
pub mod alive_keeper;
pub mod batch_builder;
pub mod error;
pub mod read_many;
pub mod settings;
pub mod signal;
pub mod subscriber;
pub mod sync_policy;
pub mod time;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use agent::{Agent, MailboxAgent};
pub use alive_keeper::AliveKeeper;
pub use batch_builder::{BatchBuilder, BatchOperation, BatchOperationError};
pub use error::{Error, Result};
pub use settings::{AliveKeeperSettings, BatchBuilderSettings, BatchSubscriberSettings};
pub use signal::ManualResetSignal;
pub use subscriber::{BatchSubscriber, Handler, Poller};
pub use sync_policy::{SyncPolicy, SyncPolicyKind};
pub use time::TimeSource;
