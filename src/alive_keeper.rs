//! Per-item periodic upkeep ("touch") and on-demand release ("delete"),
//! built on [`BatchBuilder`] and [`SyncPolicy`].
//!
//! The registry is a single `parking_lot::Mutex<HashMap<Key, InFlight>>`,
//! following the same "one concurrent map, no back-pointers" shape
//! `vector_buffers`'s acknowledgement bookkeeping
//! (`topology/acks.rs`'s `PendingMarker`/`EligibleMarker` tracking) uses for
//! its own id → state mapping.

use std::{collections::HashMap, hash::Hash, sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    batch_builder::{BatchOperation, BatchOperationError},
    error::{Error, Result},
    settings::AliveKeeperSettings,
    sync_policy::SyncPolicy,
    time::TimeSource,
    BatchBuilder,
};

struct InFlight {
    cancel: CancellationToken,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Touch,
    Delete,
}

/// Filters a batch down to items still present in the registry, gates the
/// user operation behind the keeper's [`SyncPolicy`], and short-circuits to
/// an empty result without invoking the user callback when nothing survives
/// filtering.
struct GatedOperation<Item, Key, Op> {
    registry: Arc<Mutex<HashMap<Key, InFlight>>>,
    key_fn: Arc<dyn Fn(&Item) -> Key + Send + Sync>,
    policy: SyncPolicy,
    side: Side,
    inner: Op,
}

#[async_trait]
impl<Item, Key, Op> BatchOperation<Item, Item> for GatedOperation<Item, Key, Op>
where
    Item: Send + 'static,
    Key: Eq + Hash + Send + Sync + 'static,
    Op: BatchOperation<Item, Item>,
{
    async fn run_batch(
        &self,
        requests: Vec<Item>,
    ) -> std::result::Result<Vec<Item>, BatchOperationError> {
        let filtered: Vec<Item> = {
            let registry = self.registry.lock();
            let key_fn = self.key_fn.as_ref();
            requests
                .into_iter()
                .filter(|item| registry.contains_key(&key_fn(item)))
                .collect()
        };
        if filtered.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = match self.side {
            Side::Touch => self.policy.enter_touch().await,
            Side::Delete => self.policy.enter_delete().await,
        };
        self.inner.run_batch(filtered).await
    }
}

/// Runs a periodic touch loop per registered item and an on-demand delete
/// path, both served through two [`BatchBuilder`]s sharing a
/// [`SyncPolicy`].
pub struct AliveKeeper<Item, Key> {
    registry: Arc<Mutex<HashMap<Key, InFlight>>>,
    touch_builder: Arc<BatchBuilder<Item, Item, Key>>,
    delete_builder: Option<Arc<BatchBuilder<Item, Item, Key>>>,
    key_fn: Arc<dyn Fn(&Item) -> Key + Send + Sync>,
    settings: AliveKeeperSettings,
    time_source: Arc<dyn TimeSource>,
    disposal_token: CancellationToken,
    disposing: Arc<std::sync::atomic::AtomicBool>,
    disposed: std::sync::atomic::AtomicBool,
}

impl<Item, Key> AliveKeeper<Item, Key>
where
    Item: Clone + Send + Sync + 'static,
    Key: Eq + Hash + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Builds an `AliveKeeper`. `key_of` derives the registry key (and
    /// `BatchBuilder` fingerprint) from an item; `touch_op` renews a batch
    /// of items; `delete_op`, if given, releases a batch of items.
    #[must_use]
    pub fn new<KeyOf, TouchOp, DeleteOp>(
        settings: AliveKeeperSettings,
        key_of: KeyOf,
        touch_op: TouchOp,
        delete_op: Option<DeleteOp>,
        time_source: Arc<dyn TimeSource>,
    ) -> Self
    where
        KeyOf: Fn(&Item) -> Key + Send + Sync + 'static,
        TouchOp: BatchOperation<Item, Item>,
        DeleteOp: BatchOperation<Item, Item>,
    {
        let registry = Arc::new(Mutex::new(HashMap::new()));
        let key_fn: Arc<dyn Fn(&Item) -> Key + Send + Sync> = Arc::new(key_of);
        let sync_policy = SyncPolicy::select(settings.sync_policy, settings.concurrency);

        let touch_builder_settings = crate::settings::BatchBuilderSettings::new(
            settings.touch_batch_size,
            settings.touch_batch_delay,
            settings.concurrency,
        );
        let touch_operation = GatedOperation {
            registry: Arc::clone(&registry),
            key_fn: Arc::clone(&key_fn),
            policy: sync_policy.clone(),
            side: Side::Touch,
            inner: touch_op,
        };
        let touch_key_fn = Arc::clone(&key_fn);
        let touch_key_fn_resp = Arc::clone(&key_fn);
        let touch_builder = Arc::new(BatchBuilder::new(
            touch_builder_settings,
            move |item: &Item| (touch_key_fn.as_ref())(item),
            move |item: &Item| (touch_key_fn_resp.as_ref())(item),
            touch_operation,
            Arc::clone(&time_source),
        ));

        let delete_builder = delete_op.map(|delete_op| {
            let delete_builder_settings = crate::settings::BatchBuilderSettings::new(
                settings.delete_batch_size,
                Duration::ZERO,
                settings.concurrency,
            );
            let delete_operation = GatedOperation {
                registry: Arc::clone(&registry),
                key_fn: Arc::clone(&key_fn),
                policy: sync_policy.clone(),
                side: Side::Delete,
                inner: delete_op,
            };
            let delete_key_fn = Arc::clone(&key_fn);
            let delete_key_fn_resp = Arc::clone(&key_fn);
            Arc::new(BatchBuilder::new(
                delete_builder_settings,
                move |item: &Item| (delete_key_fn.as_ref())(item),
                move |item: &Item| (delete_key_fn_resp.as_ref())(item),
                delete_operation,
                Arc::clone(&time_source),
            ))
        });

        Self {
            registry,
            touch_builder,
            delete_builder,
            key_fn,
            settings,
            time_source,
            disposal_token: CancellationToken::new(),
            disposing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            disposed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn key_of(&self, item: &Item) -> Key {
        (self.key_fn.as_ref())(item)
    }

    /// Starts a touch loop for `item`. No-op if already registered or if
    /// the keeper is disposing.
    pub fn register(&self, item: Item, token: Option<CancellationToken>) {
        if self.disposing.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let key = self.key_of(&item);
        let item_token = {
            let mut registry = self.registry.lock();
            if registry.contains_key(&key) {
                return;
            }
            let item_token = self.merged_token(token);
            registry.insert(
                key.clone(),
                InFlight {
                    cancel: item_token.clone(),
                },
            );
            item_token
        };

        let registry = Arc::clone(&self.registry);
        let touch_builder = Arc::clone(&self.touch_builder);
        let touch_interval = self.settings.touch_interval;
        let retry_interval = self.settings.retry_interval;
        let retry_limit = self.settings.retry_limit;
        let time_source = Arc::clone(&self.time_source);

        tokio::spawn(async move {
            let mut consecutive_failures = 0usize;
            loop {
                let wait = if consecutive_failures == 0 {
                    touch_interval
                } else {
                    retry_interval
                };
                if time_source.delay(wait, &item_token).await.is_err() {
                    break;
                }
                if !registry.lock().contains_key(&key) {
                    break;
                }
                match touch_builder.request(item.clone()).await {
                    Ok(_response) => consecutive_failures = 0,
                    Err(error) => {
                        consecutive_failures += 1;
                        if consecutive_failures > retry_limit {
                            error!(?key, %error, "touch retries exhausted, deactivating item");
                            break;
                        }
                        warn!(?key, %error, "touch failed, retrying");
                    }
                }
            }
            registry.lock().remove(&key);
            // Releases `merged_token`'s forwarding task(s): the touch loop
            // may exit here without ever going through `deactivate` (e.g.
            // retries exhausted), so this item's token must be cancelled
            // on every exit path, not just the external ones.
            item_token.cancel();
        });
    }

    /// Releases `item` through the delete `BatchBuilder`, retrying up to
    /// `retryLimit` times, then deactivates it. Resolves immediately if the
    /// item is not registered. Fails with the last observed error if every
    /// attempt fails or the keeper is disposing and an attempt fails.
    pub async fn delete(&self, item: Item, token: Option<CancellationToken>) -> Result<()> {
        let key = self.key_of(&item);
        if !self.registry.lock().contains_key(&key) {
            return Ok(());
        }
        let Some(delete_builder) = &self.delete_builder else {
            self.deactivate(&key);
            return Ok(());
        };

        let merged_token = self.merged_token(token);
        let mut attempt = 0usize;
        let result = loop {
            match delete_builder.request(item.clone()).await {
                Ok(_response) => {
                    self.deactivate(&key);
                    break Ok(());
                }
                Err(error) => {
                    if self.disposing.load(std::sync::atomic::Ordering::SeqCst)
                        || attempt >= self.settings.retry_limit
                    {
                        break Err(error);
                    }
                    attempt += 1;
                    if self
                        .time_source
                        .delay(self.settings.retry_interval, &merged_token)
                        .await
                        .is_err()
                    {
                        break Err(Error::Cancelled);
                    }
                }
            }
        };
        // Releases the forwarding task(s) `merged_token` spun up: without
        // this, each `delete` call would leak one task per caller-supplied
        // token (and one per call at all, for the disposal-token forward)
        // that would otherwise only exit at keeper disposal.
        merged_token.cancel();
        result
    }

    /// Deactivates `item` without attempting to delete it. Its touch loop
    /// observes the deactivation and exits on its next wake.
    pub fn forget(&self, item: &Item) {
        let key = self.key_of(item);
        self.deactivate(&key);
    }

    fn deactivate(&self, key: &Key) {
        if let Some(entry) = self.registry.lock().remove(key) {
            entry.cancel.cancel();
        }
    }

    /// Cancels the keeper's internal disposal source and waits, with
    /// bounded exponential backoff capped at 1 s, until the registry is
    /// empty.
    pub async fn shutdown(&self) {
        self.disposing
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.disposal_token.cancel();
        let mut backoff = Duration::from_millis(10);
        loop {
            if self.registry.lock().is_empty() {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }

    /// Synchronous shutdown plus resource release. Idempotent.
    pub async fn dispose(&self) {
        if self
            .disposed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.shutdown().await;
        self.touch_builder.dispose().await;
        if let Some(delete_builder) = &self.delete_builder {
            delete_builder.dispose().await;
        }
    }

    fn merged_token(&self, caller: Option<CancellationToken>) -> CancellationToken {
        let item_token = CancellationToken::new();
        forward(self.disposal_token.clone(), item_token.clone());
        if let Some(caller) = caller {
            forward(caller, item_token.clone());
        }
        item_token
    }
}

/// Cancels `target` when `source` cancels. The forwarding task is itself
/// bounded by `target`'s own lifetime: once `target` is cancelled by any
/// other means (the item's touch loop ending, `deactivate`, or `delete`
/// concluding), this task has nothing left to do and exits instead of
/// waiting on `source` — which for the keeper's own disposal token may
/// otherwise never fire for the lifetime of the process.
fn forward(source: CancellationToken, target: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = source.cancelled() => target.cancel(),
            () = target.cancelled() => {},
        }
    });
}
