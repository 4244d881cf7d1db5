//! Drives a poll / touch / delete source: pulls batches of messages,
//! registers each receipt with an [`AliveKeeper`], dispatches messages to a
//! user handler under a concurrency limit, and deletes the receipt on
//! success.
//!
//! The poller and runner loops are each an [`Agent`] whose step function
//! forks one unit of work per iteration behind a semaphore — the same
//! "acquire, spawn, let the forked task hold the permit" shape
//! [`BatchBuilder`]'s reader loop uses for its own admission gate, applied
//! here to `pollerCount`/`handlerCount` instead of `concurrency`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    agent::{Agent, StepOutcome},
    alive_keeper::AliveKeeper,
    batch_builder::{BatchOperation, BatchOperationError},
    error::Result,
    settings::{AliveKeeperSettings, BatchSubscriberSettings},
    time::TimeSource,
};

/// The external source a [`BatchSubscriber`] pulls from: receives batches
/// of messages and renews or releases their receipts in bulk.
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    /// The unit of work delivered to the user handler.
    type Message: Send + 'static;
    /// An opaque handle identifying a transient ownership of a message.
    type Receipt: Clone + Send + Sync + 'static;

    /// Derives a message's receipt. Pure and total.
    fn receipt_for(&self, message: &Self::Message) -> Self::Receipt;

    /// A stable string identity for a receipt, used as the
    /// [`AliveKeeper`] registry key.
    fn identity_of(&self, receipt: &Self::Receipt) -> String;

    /// Pulls the next batch of messages. May return an empty list; must
    /// honor cancellation.
    async fn receive(
        &self,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<Self::Message>, BatchOperationError>;

    /// Releases a batch of receipts, returning the successfully-deleted
    /// subset.
    async fn delete(
        &self,
        receipts: Vec<Self::Receipt>,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<Self::Receipt>, BatchOperationError>;

    /// Renews a batch of receipts, returning the successfully-touched
    /// subset.
    async fn touch(
        &self,
        receipts: Vec<Self::Receipt>,
        token: &CancellationToken,
    ) -> std::result::Result<Vec<Self::Receipt>, BatchOperationError>;
}

/// The user callback invoked per message.
#[async_trait]
pub trait Handler<Message>: Send + Sync + 'static {
    /// Processes one message. Failure is logged and results in `forget` of
    /// its receipt; it never terminates the subscriber.
    async fn handle(&self, message: Message, token: CancellationToken) -> Result<()>;
}

#[async_trait]
impl<Message, F, Fut> Handler<Message> for F
where
    F: Fn(Message, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send,
    Message: Send + 'static,
{
    async fn handle(&self, message: Message, token: CancellationToken) -> Result<()> {
        self(message, token).await
    }
}

struct PollerTouchOperation<P: Poller> {
    poller: Arc<P>,
    token: CancellationToken,
}

#[async_trait]
impl<P: Poller> BatchOperation<P::Receipt, P::Receipt> for PollerTouchOperation<P> {
    async fn run_batch(
        &self,
        requests: Vec<P::Receipt>,
    ) -> std::result::Result<Vec<P::Receipt>, BatchOperationError> {
        self.poller.touch(requests, &self.token).await
    }
}

struct PollerDeleteOperation<P: Poller> {
    poller: Arc<P>,
    token: CancellationToken,
}

#[async_trait]
impl<P: Poller> BatchOperation<P::Receipt, P::Receipt> for PollerDeleteOperation<P> {
    async fn run_batch(
        &self,
        requests: Vec<P::Receipt>,
    ) -> std::result::Result<Vec<P::Receipt>, BatchOperationError> {
        self.poller.delete(requests, &self.token).await
    }
}

struct Burrito<P: Poller> {
    message: P::Message,
    receipt: P::Receipt,
}

/// Polls a [`Poller`] and dispatches messages to a [`Handler`] under a
/// concurrency limit, renewing and releasing receipts through an internal
/// [`AliveKeeper`].
pub struct BatchSubscriber<P: Poller> {
    keeper: Arc<AliveKeeper<P::Receipt, String>>,
    burrito_tx: Option<mpsc::Sender<Burrito<P>>>,
    poller_agent: Agent,
    runner_agent: Agent,
    token: CancellationToken,
    disposed: std::sync::atomic::AtomicBool,
}

impl<P: Poller> BatchSubscriber<P> {
    /// Builds and starts a `BatchSubscriber` over `poller`, dispatching
    /// received messages to `handler`.
    #[must_use]
    pub fn new<H>(
        poller: P,
        handler: H,
        settings: BatchSubscriberSettings,
        time_source: Arc<dyn TimeSource>,
    ) -> Self
    where
        H: Handler<P::Message>,
    {
        let poller = Arc::new(poller);
        let handler = Arc::new(handler);
        let token = CancellationToken::new();

        let keeper_settings = AliveKeeperSettings::new(
            settings.touch_interval,
            settings.touch_batch_size,
            settings.touch_batch_delay,
            settings.delete_batch_size,
            settings.retry_interval,
            settings.retry_limit,
            settings.batch_concurrency,
            settings.sync_policy(),
        );
        let identity_poller = Arc::clone(&poller);
        let keeper = Arc::new(AliveKeeper::new(
            keeper_settings,
            move |receipt: &P::Receipt| identity_poller.identity_of(receipt),
            PollerTouchOperation {
                poller: Arc::clone(&poller),
                token: token.clone(),
            },
            Some(PollerDeleteOperation {
                poller: Arc::clone(&poller),
                token: token.clone(),
            }),
            Arc::clone(&time_source),
        ));

        let (burrito_tx, burrito_rx) = mpsc::channel::<Burrito<P>>(settings.internal_queue_size);
        let burrito_rx = Arc::new(tokio::sync::Mutex::new(burrito_rx));

        let poller_semaphore = Arc::new(Semaphore::new(settings.poller_count));
        let poller_token = token.clone();
        let poller_for_loop = Arc::clone(&poller);
        let keeper_for_register = Arc::clone(&keeper);
        let burrito_tx_loop = burrito_tx.clone();
        let mut poller_agent = Agent::new(move |_token| {
            let poller = Arc::clone(&poller_for_loop);
            let keeper = Arc::clone(&keeper_for_register);
            let semaphore = Arc::clone(&poller_semaphore);
            let token = poller_token.clone();
            let burrito_tx = burrito_tx_loop.clone();
            async move {
                let permit = tokio::select! {
                    biased;
                    () = token.cancelled() => return Ok(StepOutcome::Stop),
                    permit = Arc::clone(&semaphore).acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    return Ok(StepOutcome::Stop);
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    match poller.receive(&token).await {
                        Ok(messages) => {
                            for message in messages {
                                let receipt = poller.receipt_for(&message);
                                keeper.register(receipt.clone(), None);
                                if burrito_tx.send(Burrito { message, receipt }).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(error) => {
                            warn!(%error, "poll failed");
                        }
                    }
                });
                Ok(StepOutcome::Continue)
            }
        });

        let handler_semaphore = Arc::new(Semaphore::new(settings.handler_count));
        let runner_token = token.clone();
        let runner_handler = Arc::clone(&handler);
        let runner_keeper = Arc::clone(&keeper);
        let runner_rx = Arc::clone(&burrito_rx);
        let asynchronous_deletes = settings.asynchronous_deletes;
        let mut runner_agent = Agent::new(move |_token| {
            let token = runner_token.clone();
            let handler = Arc::clone(&runner_handler);
            let keeper = Arc::clone(&runner_keeper);
            let rx = Arc::clone(&runner_rx);
            let semaphore = Arc::clone(&handler_semaphore);
            async move {
                // Reads drive the loop's own exit: once the supervisor
                // drops its sender and every buffered burrito has been
                // taken, `recv` yields `None` and draining is complete.
                // Cancellation is not raced here, so buffered work is
                // always drained before the loop stops.
                let burrito = rx.lock().await.recv().await;
                let Some(burrito) = burrito else {
                    return Ok(StepOutcome::Stop);
                };
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    return Ok(StepOutcome::Stop);
                };
                tokio::spawn(async move {
                    let _permit = permit;
                    let handler_token = token.child_token();
                    match handler.handle(burrito.message, handler_token).await {
                        Ok(()) => {
                            if asynchronous_deletes {
                                let keeper = Arc::clone(&keeper);
                                tokio::spawn(async move {
                                    if let Err(error) = keeper.delete(burrito.receipt, None).await {
                                        warn!(%error, "asynchronous delete failed");
                                    }
                                });
                            } else if let Err(error) = keeper.delete(burrito.receipt, None).await {
                                warn!(%error, "delete failed");
                            }
                        }
                        Err(error) => {
                            warn!(%error, "handler failed, forgetting receipt");
                            keeper.forget(&burrito.receipt);
                        }
                    }
                });
                Ok(StepOutcome::Continue)
            }
        });

        poller_agent.start();
        runner_agent.start();

        Self {
            keeper,
            burrito_tx: Some(burrito_tx),
            poller_agent,
            runner_agent,
            token,
            disposed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Cancels the subscriber, stops the poller, closes the internal
    /// channel, waits for the runner to drain, then disposes the internal
    /// keeper. Idempotent.
    pub async fn dispose(&mut self) {
        if self
            .disposed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        self.token.cancel();
        self.poller_agent.dispose().await;
        self.burrito_tx.take();
        self.runner_agent.dispose().await;
        self.keeper.dispose().await;
    }
}
