//! Settings structs for each of the three coordination components.
//!
//! Every field has a floor; values supplied below the floor are silently
//! clamped up at construction, matching `vector_buffers::config`'s
//! `BufferConfig` convention of validating once, at the edge, rather than
//! threading fallible construction through the rest of the crate.

use std::time::Duration;

use crate::sync_policy::SyncPolicyKind;

const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(10);
const MIN_TOUCH_INTERVAL: Duration = Duration::from_millis(10);

fn at_least(value: usize, floor: usize) -> usize {
    value.max(floor)
}

fn at_least_duration(value: Duration, floor: Duration) -> Duration {
    value.max(floor)
}

/// Settings for a [`BatchBuilder`](crate::BatchBuilder).
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct BatchBuilderSettings {
    /// Maximum number of mailboxes collected into a single `runBatch` call.
    pub batch_size: usize,
    /// How long to keep accumulating a batch after the first mailbox
    /// arrives, before dispatching what has been collected so far.
    pub batch_delay: Duration,
    /// Maximum number of in-flight `runBatch` calls.
    pub concurrency: usize,
}

impl BatchBuilderSettings {
    /// Builds settings, clamping `batch_size` and `concurrency` up to 1 if
    /// given as 0.
    #[must_use]
    pub fn new(batch_size: usize, batch_delay: Duration, concurrency: usize) -> Self {
        Self {
            batch_size: at_least(batch_size, 1),
            batch_delay,
            concurrency: at_least(concurrency, 1),
        }
    }
}

impl Default for BatchBuilderSettings {
    fn default() -> Self {
        Self::new(100, Duration::ZERO, 1)
    }
}

/// Settings for an [`AliveKeeper`](crate::AliveKeeper).
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct AliveKeeperSettings {
    /// Interval between successful touches of a registered item.
    pub touch_interval: Duration,
    /// Maximum number of items per touch `runBatch` call.
    pub touch_batch_size: usize,
    /// Accumulation window for the touch `BatchBuilder`.
    pub touch_batch_delay: Duration,
    /// Maximum number of items per delete `runBatch` call.
    pub delete_batch_size: usize,
    /// Delay before retrying a failed touch or delete.
    pub retry_interval: Duration,
    /// Number of consecutive failures tolerated before giving up on an
    /// item's touch loop (touch) or failing the caller (delete).
    pub retry_limit: usize,
    /// Shared concurrency bound for both the touch and delete
    /// `BatchBuilder`s.
    pub concurrency: usize,
    /// Mutual-exclusion/alternation policy between touch and delete
    /// batches.
    pub sync_policy: SyncPolicyKind,
}

impl AliveKeeperSettings {
    /// Builds settings, clamping every floor described in the crate's
    /// external interface table and forcing [`SyncPolicyKind::Safe`] when
    /// `concurrency <= 1`.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        touch_interval: Duration,
        touch_batch_size: usize,
        touch_batch_delay: Duration,
        delete_batch_size: usize,
        retry_interval: Duration,
        retry_limit: usize,
        concurrency: usize,
        sync_policy: SyncPolicyKind,
    ) -> Self {
        let concurrency = at_least(concurrency, 1);
        Self {
            touch_interval: at_least_duration(touch_interval, Duration::ZERO),
            touch_batch_size: at_least(touch_batch_size, 1),
            touch_batch_delay,
            delete_batch_size: at_least(delete_batch_size, 1),
            retry_interval: at_least_duration(retry_interval, Duration::ZERO),
            retry_limit,
            concurrency,
            sync_policy: if concurrency <= 1 {
                SyncPolicyKind::Safe
            } else {
                sync_policy
            },
        }
    }
}

impl Default for AliveKeeperSettings {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(1),
            100,
            Duration::ZERO,
            100,
            Duration::from_secs(1),
            3,
            1,
            SyncPolicyKind::Safe,
        )
    }
}

/// Settings for a [`BatchSubscriber`](crate::BatchSubscriber).
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct BatchSubscriberSettings {
    /// Number of handler tasks permitted to run concurrently.
    pub handler_count: usize,
    /// Shared concurrency bound passed through to the internal
    /// `AliveKeeper`.
    pub batch_concurrency: usize,
    /// Consecutive-failure limit passed through to the internal
    /// `AliveKeeper`.
    pub retry_limit: usize,
    /// Retry delay passed through to the internal `AliveKeeper`; floored at
    /// 10ms.
    pub retry_interval: Duration,
    /// Maximum items per delete batch.
    pub delete_batch_size: usize,
    /// Maximum items per touch batch.
    pub touch_batch_size: usize,
    /// Touch interval passed through to the internal `AliveKeeper`;
    /// floored at 10ms.
    pub touch_interval: Duration,
    /// Accumulation window for touch batches.
    pub touch_batch_delay: Duration,
    /// Whether touch and delete batches alternate (mutually exclusive) or
    /// run unrestricted relative to one another.
    pub alternate_batches: bool,
    /// Whether a successful handler invocation waits for its delete to
    /// complete, or fires it and moves on.
    pub asynchronous_deletes: bool,
    /// Capacity of the bounded channel between the poller and runner
    /// fan-outs.
    pub internal_queue_size: usize,
    /// Number of concurrent in-flight `receive` calls.
    pub poller_count: usize,
}

impl BatchSubscriberSettings {
    /// Builds settings, clamping every floor described in the crate's
    /// external interface table.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handler_count: usize,
        batch_concurrency: usize,
        retry_limit: usize,
        retry_interval: Duration,
        delete_batch_size: usize,
        touch_batch_size: usize,
        touch_interval: Duration,
        touch_batch_delay: Duration,
        alternate_batches: bool,
        asynchronous_deletes: bool,
        internal_queue_size: usize,
        poller_count: usize,
    ) -> Self {
        Self {
            handler_count: at_least(handler_count, 1),
            batch_concurrency: at_least(batch_concurrency, 1),
            retry_limit,
            retry_interval: at_least_duration(retry_interval, MIN_RETRY_INTERVAL),
            delete_batch_size: at_least(delete_batch_size, 1),
            touch_batch_size: at_least(touch_batch_size, 1),
            touch_interval: at_least_duration(touch_interval, MIN_TOUCH_INTERVAL),
            touch_batch_delay,
            alternate_batches,
            asynchronous_deletes,
            internal_queue_size: at_least(internal_queue_size, 1),
            poller_count: at_least(poller_count, 1),
        }
    }

    /// The `SyncPolicyKind` this subscriber's internal `AliveKeeper` should
    /// use: `Alternating` when `alternate_batches` is set, `Unrestricted`
    /// otherwise (clamped to `Safe` by `AliveKeeperSettings::new` if
    /// `batch_concurrency <= 1`).
    #[must_use]
    pub fn sync_policy(&self) -> SyncPolicyKind {
        if self.alternate_batches {
            SyncPolicyKind::Alternating
        } else {
            SyncPolicyKind::Unrestricted
        }
    }
}

impl Default for BatchSubscriberSettings {
    fn default() -> Self {
        Self::new(
            4,
            1,
            3,
            Duration::from_secs(1),
            100,
            100,
            Duration::from_secs(1),
            Duration::ZERO,
            false,
            false,
            100,
            1,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_builder_settings_clamp_zero_up() {
        let settings = BatchBuilderSettings::new(0, Duration::ZERO, 0);
        assert_eq!(settings.batch_size, 1);
        assert_eq!(settings.concurrency, 1);
    }

    #[test]
    fn alive_keeper_settings_force_safe_under_concurrency_one() {
        let settings = AliveKeeperSettings::new(
            Duration::from_secs(1),
            10,
            Duration::ZERO,
            10,
            Duration::from_secs(1),
            3,
            1,
            SyncPolicyKind::Alternating,
        );
        assert_eq!(settings.sync_policy, SyncPolicyKind::Safe);
    }

    #[test]
    fn alive_keeper_settings_respect_requested_policy_above_one() {
        let settings = AliveKeeperSettings::new(
            Duration::from_secs(1),
            10,
            Duration::ZERO,
            10,
            Duration::from_secs(1),
            3,
            4,
            SyncPolicyKind::Alternating,
        );
        assert_eq!(settings.sync_policy, SyncPolicyKind::Alternating);
    }

    #[test]
    fn batch_subscriber_settings_floor_retry_and_touch_intervals() {
        let settings = BatchSubscriberSettings::new(
            1,
            1,
            3,
            Duration::from_millis(1),
            1,
            1,
            Duration::from_millis(1),
            Duration::ZERO,
            false,
            false,
            1,
            1,
        );
        assert_eq!(settings.retry_interval, MIN_RETRY_INTERVAL);
        assert_eq!(settings.touch_interval, MIN_TOUCH_INTERVAL);
    }
}
