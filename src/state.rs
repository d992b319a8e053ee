//! Internal state machine and attempt broadcasting for singletons.
//!
//! A singleton's state lives in a [`Phase`] behind a read-write lock. Readers
//! of a published value only take the shared side; the exclusive side guards
//! transitions. The factory itself runs on a detached task with no lock held.
//!
//! Each construction attempt is an [`Attempt`]: a one-shot broadcast cell that
//! every caller waiting on that construction shares. Async callers wait on a
//! `tokio::sync::Notify`, blocking callers park on the attempt's address via
//! `parking_lot_core`. Whoever resolves the attempt first wins; later
//! resolutions are ignored.
//!
//! The construction task owns an [`AttemptGuard`], created before the task is
//! spawned. If the task goes away without committing a result (factory panic,
//! or a runtime that drops the task before polling it), dropping the guard
//! resets the state to `Empty` and wakes everybody with [`Outcome::Abandoned`].
//! Either way the guard marks the attempt finished when it goes.

use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use tokio::sync::Notify;

/// Observable lifecycle state of a singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SingletonState {
   /// No value and no construction in flight.
   Empty,
   /// A factory invocation is in flight.
   Constructing,
   /// The value is published.
   Ready,
   /// The last attempt failed; the next `get` retries.
   Failed,
   /// Torn down. Terminal.
   Disposed,
}

/// Shared handle to a singleton's phase.
pub(crate) type PhaseLock<T, E> = Arc<RwLock<Phase<T, E>>>;

pub(crate) enum Phase<T, E> {
   Empty,
   Constructing(Arc<Attempt<T, E>>),
   Ready(T),
   Failed(Arc<E>),
   Disposed,
}

impl<T, E> Phase<T, E> {
   pub(crate) fn state(&self) -> SingletonState {
      match self {
         Self::Empty => SingletonState::Empty,
         Self::Constructing(_) => SingletonState::Constructing,
         Self::Ready(_) => SingletonState::Ready,
         Self::Failed(_) => SingletonState::Failed,
         Self::Disposed => SingletonState::Disposed,
      }
   }

   #[inline]
   pub(crate) fn is_disposed(&self) -> bool {
      matches!(self, Self::Disposed)
   }

   /// Returns `true` if `attempt` is the construction currently in flight.
   fn is_running(&self, attempt: &Arc<Attempt<T, E>>) -> bool {
      matches!(self, Self::Constructing(current) if Arc::ptr_eq(current, attempt))
   }
}

/// Result of one construction attempt, as seen by its waiters.
pub(crate) enum Outcome<T, E> {
   Ready(T),
   Failed(Arc<E>),
   Disposed,
   Abandoned,
}

impl<T: Clone, E> Clone for Outcome<T, E> {
   fn clone(&self) -> Self {
      match self {
         Self::Ready(value) => Self::Ready(value.clone()),
         Self::Failed(err) => Self::Failed(Arc::clone(err)),
         Self::Disposed => Self::Disposed,
         Self::Abandoned => Self::Abandoned,
      }
   }
}

/// One in-flight factory invocation and the callers waiting on it.
pub(crate) struct Attempt<T, E> {
   id: u64,
   /// Set after `outcome` is written. Parked threads validate against it.
   resolved: AtomicBool,
   outcome: Mutex<Option<Outcome<T, E>>>,
   notify: Notify,
   /// Set once the construction task is gone, late-value release included.
   finished: AtomicBool,
   finished_notify: Notify,
}

impl<T: Clone, E> Attempt<T, E> {
   pub(crate) fn new(id: u64) -> Arc<Self> {
      Arc::new(Self {
         id,
         resolved: AtomicBool::new(false),
         outcome: Mutex::new(None),
         notify: Notify::new(),
         finished: AtomicBool::new(false),
         finished_notify: Notify::new(),
      })
   }

   #[inline]
   pub(crate) fn id(&self) -> u64 {
      self.id
   }

   /// Address used as the parking key for blocking waiters.
   #[inline]
   fn park_key(&self) -> usize {
      self.resolved.as_ptr() as usize
   }

   /// Publishes `outcome` to every waiter. Returns `false` if the attempt was
   /// already resolved, in which case `outcome` is dropped.
   pub(crate) fn resolve(&self, outcome: Outcome<T, E>) -> bool {
      {
         let mut slot = self.outcome.lock();
         if slot.is_some() {
            return false;
         }
         *slot = Some(outcome);
      }
      // Release pairs with the Acquire load in the park validation closure.
      self.resolved.store(true, Ordering::Release);
      self.notify.notify_waiters();
      // SAFETY: The address passed to unpark must match the one used for park.
      // Both sides use `park_key`.
      unsafe {
         parking_lot_core::unpark_all(self.park_key(), DEFAULT_UNPARK_TOKEN);
      }
      true
   }

   fn outcome(&self) -> Option<Outcome<T, E>> {
      self.outcome.lock().clone()
   }

   /// Waits for the attempt to resolve without blocking the executor.
   pub(crate) async fn wait(&self) -> Outcome<T, E> {
      loop {
         let notified = self.notify.notified();
         tokio::pin!(notified);
         // Register before checking, or a resolve between the check and the
         // await would be missed.
         notified.as_mut().enable();
         if let Some(outcome) = self.outcome() {
            return outcome;
         }
         notified.await;
      }
   }

   /// Parks the calling thread until the attempt resolves.
   pub(crate) fn wait_blocking(&self) -> Outcome<T, E> {
      loop {
         if let Some(outcome) = self.outcome() {
            return outcome;
         }
         // SAFETY: See `resolve`. The validation closure only touches an atomic
         // and never calls back into parking_lot.
         unsafe {
            let _ = parking_lot_core::park(
               self.park_key(),
               || !self.resolved.load(Ordering::Acquire),
               || {},
               |_, _| {},
               DEFAULT_PARK_TOKEN,
               None,
            );
         }
         // Spurious wakeups fall through to the re-check above.
      }
   }

   fn finish(&self) {
      self.finished.store(true, Ordering::Release);
      self.finished_notify.notify_waiters();
   }

   /// Waits until the construction task has completed or been dropped.
   pub(crate) async fn finished(&self) {
      loop {
         let notified = self.finished_notify.notified();
         tokio::pin!(notified);
         notified.as_mut().enable();
         if self.finished.load(Ordering::Acquire) {
            return;
         }
         notified.await;
      }
   }
}

/// RAII guard owned by the construction task.
///
/// Must be `commit`ted with the factory's result. If dropped instead, the
/// attempt is abandoned: the state goes back to `Empty` (so the next caller
/// retries) and all waiters observe [`Outcome::Abandoned`]. Dropping it also
/// marks the attempt finished, so keep it alive until the task is done.
pub(crate) struct AttemptGuard<T: Clone, E> {
   phase: PhaseLock<T, E>,
   attempt: Arc<Attempt<T, E>>,
   committed: bool,
}

impl<T: Clone, E> AttemptGuard<T, E> {
   #[inline]
   pub(crate) fn new(phase: PhaseLock<T, E>, attempt: Arc<Attempt<T, E>>) -> Self {
      Self {
         phase,
         attempt,
         committed: false,
      }
   }

   pub(crate) fn attempt_id(&self) -> u64 {
      self.attempt.id()
   }

   /// Publishes the factory's result.
   ///
   /// A value is only published if this attempt is still the one in flight.
   /// Otherwise the singleton was disposed underneath us, and the value is
   /// handed back so the caller can release it.
   pub(crate) fn commit(&mut self, result: Result<T, E>) -> Option<T> {
      if self.committed {
         return None;
      }
      self.committed = true;
      let attempt = &self.attempt;
      let mut phase = self.phase.write();
      let running = phase.is_running(attempt);

      match result {
         Ok(value) if running => {
            *phase = Phase::Ready(value.clone());
            drop(phase);
            attempt.resolve(Outcome::Ready(value));
            None
         }
         Ok(value) => {
            drop(phase);
            attempt.resolve(Outcome::Disposed);
            Some(value)
         }
         Err(err) => {
            let err = Arc::new(err);
            if running {
               *phase = Phase::Failed(Arc::clone(&err));
            }
            drop(phase);
            attempt.resolve(Outcome::Failed(err));
            None
         }
      }
   }
}

impl<T: Clone, E> Drop for AttemptGuard<T, E> {
   /// Runs when the construction task ends, however it ends.
   fn drop(&mut self) {
      if !self.committed {
         {
            let mut phase = self.phase.write();
            if phase.is_running(&self.attempt) {
               *phase = Phase::Empty;
            }
         }
         self.attempt.resolve(Outcome::Abandoned);
      }
      self.attempt.finish();
   }
}
