//! A supervised cooperative background loop.
//!
//! `Agent` carries a step function rather than participating in a trait
//! hierarchy (no inheritance in this crate's core, per its design notes);
//! `MailboxAgent<M>` is the same loop with an unbounded inbound queue
//! bolted on for single-reader draining, which is what
//! [`BatchSubscriber`](crate::subscriber::BatchSubscriber) uses for its
//! poller and runner sub-loops.

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    signal::ManualResetSignal,
};

/// What a step function asks the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Run another iteration.
    Continue,
    /// End the loop normally.
    Stop,
}

type StepFn = Box<
    dyn FnMut(CancellationToken) -> Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send>>
        + Send,
>;

/// A supervised background loop built from a user-supplied step function.
///
/// Agents are created in a *not started* state: construction never spawns a
/// task, so composite structures can wire up their dependencies before
/// [`start`](Agent::start) releases the loop.
pub struct Agent {
    step: Option<StepFn>,
    token: CancellationToken,
    done: Arc<ManualResetSignal>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl Agent {
    /// Builds a not-started agent from a step function. The step function
    /// receives the agent's own cancellation token (a child of, or equal
    /// to, whatever token governs disposal) on every iteration.
    pub fn new<F, Fut>(mut step: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        let boxed: StepFn = Box::new(move |token| Box::pin(step(token)));
        Self {
            step: Some(boxed),
            token: CancellationToken::new(),
            done: Arc::new(ManualResetSignal::default()),
            handle: None,
        }
    }

    /// Releases the loop. Calling this more than once is a no-op.
    pub fn start(&mut self) {
        let Some(mut step) = self.step.take() else {
            return;
        };
        let token = self.token.clone();
        let done = Arc::clone(&self.done);
        self.handle = Some(tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    break;
                }
                match step(token.clone()).await {
                    Ok(StepOutcome::Continue) => continue,
                    Ok(StepOutcome::Stop) => break,
                    Err(Error::Cancelled) => break,
                    Err(other) => {
                        warn!(error = %other, "agent step failed, retrying");
                        continue;
                    }
                }
            }
            done.set();
        }));
    }

    /// Completes once the loop has exited, whether it was ever started,
    /// cancelled, or ran to a natural `Stop`.
    pub async fn done(&self) {
        if self.handle.is_none() && self.step.is_some() {
            // Never started: nothing will ever run, so `done` would hang
            // forever waiting on a signal nothing sets. Treat an unstarted
            // agent's disposal as immediately done.
            return;
        }
        self.done.wait().await;
    }

    /// Signals cancellation and waits for the loop to exit. Idempotent.
    pub async fn dispose(&mut self) {
        self.token.cancel();
        if self.step.take().is_some() {
            // Was never started: nothing to await.
            self.done.set();
            return;
        }
        self.done().await;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// An [`Agent`] paired with an unbounded, single-reader inbound queue.
pub struct MailboxAgent<M> {
    agent: Agent,
    sender: mpsc::UnboundedSender<M>,
}

impl<M: Send + 'static> MailboxAgent<M> {
    /// Builds a not-started mailbox agent. `step` is handed the receiving
    /// half of the mailbox (to drain) and the agent's cancellation token on
    /// every construction; it owns draining discipline entirely.
    pub fn new<F, Fut>(make_step: F) -> Self
    where
        F: FnOnce(mpsc::UnboundedReceiver<M>) -> StepFnFor<Fut>,
        Fut: Future<Output = Result<StepOutcome>> + Send + 'static,
    {
        let (sender, receiver) = mpsc::unbounded_channel();
        let step = make_step(receiver);
        Self {
            agent: Agent::new(step),
            sender,
        }
    }

    /// Releases the loop.
    pub fn start(&mut self) {
        self.agent.start();
    }

    /// Enqueues an item for the loop to drain. Fails with
    /// [`Error::QueueFull`] if the inbound channel can no longer accept
    /// items (the loop has exited and dropped its receiver).
    pub fn enqueue(&self, item: M) -> Result<()> {
        self.sender.send(item).map_err(|_| Error::QueueFull)
    }

    /// Completes once the loop has exited.
    pub async fn done(&self) {
        self.agent.done().await;
    }

    /// Signals cancellation and waits for the loop to exit. Idempotent.
    pub async fn dispose(&mut self) {
        self.agent.dispose().await;
    }
}

/// A boxed step closure bound to a mailbox's receiver, as accepted by
/// [`MailboxAgent::new`].
pub type StepFnFor<Fut> = Box<dyn FnMut(CancellationToken) -> Fut + Send>;
