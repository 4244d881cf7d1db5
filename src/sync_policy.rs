//! Mutual-exclusion/alternation between two groups of batch callers
//! ("touch" and "delete").
//!
//! `Alternating`'s state machine follows a single-mutex, `Notify`-per-side
//! shape, the same discipline `vector_buffers`'s `PollNotify` uses for "one
//! mutex serializes state, a `Notify` wakes parked waiters" — generalized
//! here to two sides that take turns.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Which synchronization policy an [`AliveKeeper`](crate::AliveKeeper)
/// should use between its touch and delete `BatchBuilder`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicyKind {
    /// Touch and delete batches may run concurrently without bound.
    #[default]
    Unrestricted,
    /// At most one touch or delete batch runs at a time.
    Safe,
    /// Touch and delete batches run in parallel with themselves, but never
    /// with each other.
    Alternating,
}

/// Which of the two sides a caller belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Group {
    Touch,
    Delete,
}

#[derive(Debug, Default)]
struct GroupState {
    waiting: usize,
    active: usize,
    granted: usize,
}

#[derive(Debug)]
struct Alternating {
    inner: Mutex<AlternatingInner>,
    touch_notify: Notify,
    delete_notify: Notify,
}

#[derive(Debug)]
struct AlternatingInner {
    current: Option<Group>,
    touch: GroupState,
    delete: GroupState,
}

impl Alternating {
    fn new() -> Self {
        Self {
            inner: Mutex::new(AlternatingInner {
                current: None,
                touch: GroupState::default(),
                delete: GroupState::default(),
            }),
            touch_notify: Notify::new(),
            delete_notify: Notify::new(),
        }
    }

    async fn enter(&self, mine: Group) {
        loop {
            let notify = match mine {
                Group::Touch => &self.touch_notify,
                Group::Delete => &self.delete_notify,
            };
            // Create and arm the `Notified` future *before* the gate check
            // below is committed: `enable()` registers this waiter with
            // `notify` while we still hold `inner`'s lock, so a `leave()`
            // on another task can only call `notify_waiters()` (which it
            // does after taking the same lock) once this registration has
            // already happened. Without this, a `leave()` racing between
            // our gate check and the `.await` below would wake nobody and
            // we'd park forever.
            let notified = notify.notified();
            tokio::pin!(notified);

            let wait = {
                let mut inner = self.inner.lock();
                let (mine_state, other_waiting) = match mine {
                    Group::Touch => (&mut inner.touch, inner.delete.waiting),
                    Group::Delete => (&mut inner.delete, inner.touch.waiting),
                };

                let free_entry =
                    inner_current_is_free(inner.current, mine) && other_waiting == 0;
                let granted_entry = inner.current == Some(mine) && mine_state.granted > 0;

                if free_entry || granted_entry {
                    if granted_entry {
                        mine_state.granted -= 1;
                    }
                    mine_state.active += 1;
                    inner.current = Some(mine);
                    None
                } else {
                    mine_state.waiting += 1;
                    notified.as_mut().enable();
                    Some(())
                }
            };

            let Some(()) = wait else {
                return;
            };

            notified.await;

            // Re-check the gate after waking: another waiter of the same
            // group may have raced us, or the grant may have been consumed
            // already (spurious wakeups from `notify_waiters`).
            let mut inner = self.inner.lock();
            let mine_state = match mine {
                Group::Touch => &mut inner.touch,
                Group::Delete => &mut inner.delete,
            };
            if mine_state.waiting > 0 {
                mine_state.waiting -= 1;
            }
            drop(inner);
        }
    }

    fn leave(&self, mine: Group) {
        let mut inner = self.inner.lock();
        let mine_state = match mine {
            Group::Touch => &mut inner.touch,
            Group::Delete => &mut inner.delete,
        };
        debug_assert!(mine_state.active > 0);
        mine_state.active -= 1;

        if mine_state.active > 0 {
            return;
        }

        let other = match mine {
            Group::Touch => Group::Delete,
            Group::Delete => Group::Touch,
        };
        let other_state = match other {
            Group::Touch => &mut inner.touch,
            Group::Delete => &mut inner.delete,
        };

        if other_state.waiting > 0 {
            inner.current = Some(other);
            other_state.granted = other_state.waiting;
        } else {
            inner.current = None;
        }
        drop(inner);

        match other {
            Group::Touch => self.touch_notify.notify_waiters(),
            Group::Delete => self.delete_notify.notify_waiters(),
        }
    }
}

fn inner_current_is_free(current: Option<Group>, mine: Group) -> bool {
    match current {
        None => true,
        Some(group) => group == mine,
    }
}

/// The synchronization policy shared by an `AliveKeeper`'s touch and delete
/// `BatchBuilder`s.
#[derive(Clone)]
pub struct SyncPolicy {
    inner: Inner,
}

#[derive(Clone)]
enum Inner {
    Unrestricted,
    Safe(Arc<tokio::sync::Mutex<()>>),
    Alternating(Arc<Alternating>),
}

impl SyncPolicy {
    /// Selects a policy per the rule in this crate's settings: a
    /// `concurrency` of 1 or less forces `Safe` regardless of `kind`;
    /// otherwise the requested kind is used.
    #[must_use]
    pub fn select(kind: SyncPolicyKind, concurrency: usize) -> Self {
        let kind = if concurrency <= 1 {
            SyncPolicyKind::Safe
        } else {
            kind
        };
        Self::new(kind)
    }

    /// Builds a policy of exactly the given kind, with no concurrency-based
    /// override.
    #[must_use]
    pub fn new(kind: SyncPolicyKind) -> Self {
        let inner = match kind {
            SyncPolicyKind::Unrestricted => Inner::Unrestricted,
            SyncPolicyKind::Safe => Inner::Safe(Arc::new(tokio::sync::Mutex::new(()))),
            SyncPolicyKind::Alternating => Inner::Alternating(Arc::new(Alternating::new())),
        };
        Self { inner }
    }

    /// Acquires entry for a touch batch; must be paired with exactly one
    /// [`leave_touch`](SyncPolicy::leave_touch) on every exit path.
    pub async fn enter_touch(&self) -> SyncPolicyGuard {
        match &self.inner {
            Inner::Unrestricted => SyncPolicyGuard::Unrestricted,
            Inner::Safe(mutex) => {
                let guard = Arc::clone(mutex).lock_owned().await;
                SyncPolicyGuard::Safe(guard)
            }
            Inner::Alternating(state) => {
                state.enter(Group::Touch).await;
                SyncPolicyGuard::Alternating(Arc::clone(state), Group::Touch)
            }
        }
    }

    /// Acquires entry for a delete batch; must be paired with exactly one
    /// [`leave_delete`](SyncPolicy::leave_delete) on every exit path.
    pub async fn enter_delete(&self) -> SyncPolicyGuard {
        match &self.inner {
            Inner::Unrestricted => SyncPolicyGuard::Unrestricted,
            Inner::Safe(mutex) => {
                let guard = Arc::clone(mutex).lock_owned().await;
                SyncPolicyGuard::Safe(guard)
            }
            Inner::Alternating(state) => {
                state.enter(Group::Delete).await;
                SyncPolicyGuard::Alternating(Arc::clone(state), Group::Delete)
            }
        }
    }
}

/// RAII guard returned by [`SyncPolicy::enter_touch`] /
/// [`SyncPolicy::enter_delete`]; dropping it releases entry (equivalent to
/// the spec's explicit `leave_touch`/`leave_delete`).
pub enum SyncPolicyGuard {
    Unrestricted,
    Safe(tokio::sync::OwnedMutexGuard<()>),
    Alternating(Arc<Alternating>, Group),
}

impl Drop for SyncPolicyGuard {
    fn drop(&mut self) {
        if let SyncPolicyGuard::Alternating(state, group) = self {
            state.leave(*group);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn safe_policy_serializes_touch_and_delete() {
        let policy = SyncPolicy::new(SyncPolicyKind::Safe);
        let active = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let policy = policy.clone();
            let active = Arc::clone(&active);
            let max_observed = Arc::clone(&max_observed);
            handles.push(tokio::spawn(async move {
                let _guard = if i % 2 == 0 {
                    policy.enter_touch().await
                } else {
                    policy.enter_delete().await
                };
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn alternating_policy_never_runs_both_groups_at_once() {
        let policy = SyncPolicy::new(SyncPolicyKind::Alternating);
        let touch_active = Arc::new(AtomicUsize::new(0));
        let delete_active = Arc::new(AtomicUsize::new(0));
        let violation = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20 {
            let policy = policy.clone();
            let touch_active = Arc::clone(&touch_active);
            let delete_active = Arc::clone(&delete_active);
            let violation = Arc::clone(&violation);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    let _guard = policy.enter_touch().await;
                    touch_active.fetch_add(1, Ordering::SeqCst);
                    if delete_active.load(Ordering::SeqCst) > 0 {
                        violation.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    touch_active.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let _guard = policy.enter_delete().await;
                    delete_active.fetch_add(1, Ordering::SeqCst);
                    if touch_active.load(Ordering::SeqCst) > 0 {
                        violation.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    delete_active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(violation.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn alternating_policy_does_not_starve_waiting_group() {
        // S7: delete enters, touch blocks, a second delete blocks; leaving
        // the first delete admits touch (not the second delete); leaving
        // touch finally admits the second delete.
        let policy = SyncPolicy::new(SyncPolicyKind::Alternating);

        let delete1 = policy.enter_delete().await;

        let touch_policy = policy.clone();
        let touch_entered = Arc::new(tokio::sync::Notify::new());
        let touch_entered_clone = Arc::clone(&touch_entered);
        let touch_task = tokio::spawn(async move {
            let _guard = touch_policy.enter_touch().await;
            touch_entered_clone.notify_one();
            tokio::time::sleep(Duration::from_millis(20)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let delete2_policy = policy.clone();
        let delete2_task = tokio::spawn(async move { delete2_policy.enter_delete().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(
            !delete2_task.is_finished(),
            "second delete must stay blocked behind touch"
        );

        drop(delete1);
        touch_entered
            .notified()
            .await;
        assert!(
            !delete2_task.is_finished(),
            "second delete must not overtake the already-waiting touch"
        );

        touch_task.await.unwrap();
        let delete2_guard = tokio::time::timeout(Duration::from_millis(200), delete2_task)
            .await
            .expect("second delete should proceed once touch leaves")
            .unwrap();
        drop(delete2_guard);
    }
}

#[cfg(test)]
mod proptests {
    //! `Alternating`'s invariant 1 (touch and delete counters never both
    //! exceed zero, spec.md §8) under arbitrary interleavings of arrivals,
    //! checked by running each generated schedule to completion on a fresh
    //! runtime and asserting no caller ever observed the other side active.
    //! `proptest` drives a regular (synchronous) test function, since its
    //! macro-generated tests don't support `async fn`; each case spins up
    //! its own `tokio::runtime::Runtime` to drive the scenario.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::{SyncPolicy, SyncPolicyKind};

    /// Runs `schedule` (`true` = touch caller, `false` = delete caller)
    /// concurrently against one `Alternating` policy, returning the number
    /// of times a caller observed the other group active while holding its
    /// own entry.
    async fn run_schedule(schedule: Vec<bool>) -> usize {
        let policy = SyncPolicy::new(SyncPolicyKind::Alternating);
        let touch_active = Arc::new(AtomicUsize::new(0));
        let delete_active = Arc::new(AtomicUsize::new(0));
        let violations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for is_touch in schedule {
            let policy = policy.clone();
            let touch_active = Arc::clone(&touch_active);
            let delete_active = Arc::clone(&delete_active);
            let violations = Arc::clone(&violations);
            handles.push(tokio::spawn(async move {
                if is_touch {
                    let _guard = policy.enter_touch().await;
                    touch_active.fetch_add(1, Ordering::SeqCst);
                    if delete_active.load(Ordering::SeqCst) > 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                    touch_active.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let _guard = policy.enter_delete().await;
                    delete_active.fetch_add(1, Ordering::SeqCst);
                    if touch_active.load(Ordering::SeqCst) > 0 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                    delete_active.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        violations.load(Ordering::SeqCst)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn alternating_never_admits_both_groups_at_once(
            schedule in proptest::collection::vec(any::<bool>(), 1..60)
        ) {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            let violations = runtime.block_on(run_schedule(schedule));
            prop_assert_eq!(violations, 0);
        }
    }
}
