//! Single-assignment completion token handed to `Plugin::execute`.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

use parking_lot::Mutex;

/// How a [`Deferred`] settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Resolved,
    Rejected(String),
}

impl Outcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Outcome::Resolved)
    }
}

type SettleCallback = Box<dyn FnOnce(&Outcome) + Send>;

#[derive(Default)]
struct State {
    outcome: Option<Outcome>,
    callbacks: Vec<SettleCallback>,
    wakers: Vec<Waker>,
}

/// Cloneable handle to a value that settles exactly once.
///
/// Callbacks registered with [`Deferred::on_settled`] run synchronously on
/// whichever thread settles the token, or immediately if it already settled.
/// The token can also be `.await`ed.
#[derive(Clone, Default)]
pub struct Deferred {
    state: Arc<Mutex<State>>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolved() -> Self {
        let deferred = Self::new();
        deferred.resolve();
        deferred
    }

    /// Returns `false` if the token had already settled.
    pub fn resolve(&self) -> bool {
        self.settle(Outcome::Resolved)
    }

    pub fn reject(&self, reason: impl Into<String>) -> bool {
        self.settle(Outcome::Rejected(reason.into()))
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.state.lock().outcome.is_none()
    }

    pub fn same(&self, other: &Deferred) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        let mut state = self.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                callback(&outcome);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Composite token: resolves once every input resolved, rejects with the
    /// first rejection. An empty input resolves immediately.
    pub fn all<I>(tokens: I) -> Deferred
    where
        I: IntoIterator<Item = Deferred>,
    {
        let tokens: Vec<Deferred> = tokens.into_iter().collect();
        let combined = Deferred::new();
        if tokens.is_empty() {
            combined.resolve();
            return combined;
        }
        let remaining = Arc::new(AtomicUsize::new(tokens.len()));
        for token in tokens {
            let combined = combined.clone();
            let remaining = remaining.clone();
            token.on_settled(move |outcome| match outcome {
                Outcome::Resolved => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        combined.resolve();
                    }
                }
                Outcome::Rejected(reason) => {
                    combined.reject(reason.clone());
                }
            });
        }
        combined
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let (callbacks, wakers) = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            (
                std::mem::take(&mut state.callbacks),
                std::mem::take(&mut state.wakers),
            )
        };
        for callback in callbacks {
            callback(&outcome);
        }
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl Future for Deferred {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.state.lock();
        if let Some(outcome) = state.outcome.clone() {
            return Poll::Ready(outcome);
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn settles_only_once() {
        let deferred = Deferred::new();
        assert!(deferred.is_pending());
        assert!(deferred.resolve());
        assert!(!deferred.reject("late"));
        assert_eq!(deferred.outcome(), Some(Outcome::Resolved));
    }

    #[test]
    fn callbacks_run_on_settle_and_after() {
        let deferred = Deferred::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let before = hits.clone();
        deferred.on_settled(move |_| {
            before.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        deferred.resolve();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let after = hits.clone();
        deferred.on_settled(move |_| {
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn all_waits_for_every_token() {
        let a = Deferred::new();
        let b = Deferred::new();
        let combined = Deferred::all([a.clone(), b.clone()]);
        a.resolve();
        assert!(combined.is_pending());
        b.resolve();
        assert_eq!(combined.outcome(), Some(Outcome::Resolved));
    }

    #[test]
    fn all_rejects_on_first_rejection() {
        let a = Deferred::new();
        let b = Deferred::new();
        let combined = Deferred::all([a.clone(), b.clone()]);
        b.reject("nope");
        assert_eq!(combined.outcome(), Some(Outcome::Rejected("nope".into())));
        a.resolve();
        assert_eq!(combined.outcome(), Some(Outcome::Rejected("nope".into())));
    }

    #[test]
    fn all_of_nothing_is_resolved() {
        assert_eq!(
            Deferred::all(Vec::new()).outcome(),
            Some(Outcome::Resolved)
        );
    }

    #[tokio::test]
    async fn resolves_from_spawned_task() {
        let deferred = Deferred::new();
        let remote = deferred.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.resolve();
        });
        assert_eq!(deferred.await, Outcome::Resolved);
    }
}
