//! Lazily constructed, asynchronously initialized shared value.
//!
//! This module provides [`AsyncSingleton<T, E>`], a cell that builds its value
//! with a caller-supplied async factory the first time anyone asks for it.
//! Concurrent callers share one factory invocation; a failed invocation is
//! reported to all of them and retried on the next request; disposal is
//! idempotent and releases the value exactly once.
//!
//! Reading a published value only takes the shared side of the state lock.
//! The factory never runs under a lock. It runs on its own tokio task, so a
//! caller giving up on its wait (cancellation, or dropping the `get` future)
//! does not abort the construction other callers are waiting on.

use core::fmt;
use core::future::Future;
use core::mem;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::SingletonError;
use crate::release::{Release, Releaser};
use crate::state::{Attempt, AttemptGuard, Outcome, Phase, PhaseLock, SingletonState};

/// Type-erased async factory. Receives a token that is cancelled on disposal.
pub(crate) type Factory<T, E> =
   Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// State shared between the singleton handle and its construction tasks.
struct Shared<T, E> {
   phase: PhaseLock<T, E>,
   factory: Factory<T, E>,
   releaser: Option<Releaser<T>>,
   /// Cancelled once, on disposal. Factories get child tokens of it.
   shutdown: CancellationToken,
   /// Runtime captured at creation; used when the caller has none (blocking gets).
   runtime: Option<Handle>,
   attempts: AtomicU64,
}

enum Entry<T, E> {
   Ready(T),
   Waiting(Arc<Attempt<T, E>>),
}

/// A value that is constructed at most once at a time, asynchronously, and
/// shared by every caller.
///
/// `T` is handed out by clone, so it should be a cheap handle (an [`Arc`], a
/// client with internal reference counting, ...). Identity is preserved:
/// every caller gets a clone of the one published value.
///
/// # Examples
///
/// ```
/// use keyed_singleton::AsyncSingleton;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = AsyncSingleton::new(|_cancel| async {
///    Ok::<_, std::io::Error>(Arc::new(String::from("production")))
/// });
///
/// let first = config.get().await.unwrap();
/// let second = config.get().await.unwrap();
/// assert!(Arc::ptr_eq(&first, &second));
/// # }
/// ```
pub struct AsyncSingleton<T, E>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
{
   shared: Arc<Shared<T, E>>,
}

impl<T, E> AsyncSingleton<T, E>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
{
   /// Creates an empty singleton whose value needs no release on disposal.
   ///
   /// The factory receives a [`CancellationToken`] that is cancelled when the
   /// singleton is disposed; long-running factories should observe it.
   #[must_use]
   pub fn new<F, Fut>(factory: F) -> Self
   where
      F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
      Fut: Future<Output = Result<T, E>> + Send + 'static,
   {
      Self::from_parts(Arc::new(move |token| factory(token).boxed()), None)
   }

   /// Creates an empty singleton that releases its value on disposal.
   #[must_use]
   pub fn releasing<F, Fut>(factory: F) -> Self
   where
      T: Release,
      F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
      Fut: Future<Output = Result<T, E>> + Send + 'static,
   {
      Self::from_parts(
         Arc::new(move |token| factory(token).boxed()),
         Some(Releaser::of()),
      )
   }

   /// Creates a singleton that is already `Ready` with `value`.
   ///
   /// The factory is never called. `value` is not released on disposal; use
   /// [`AsyncSingleton::releasing_with_value`] for that.
   #[must_use]
   pub fn with_value(value: T) -> Self {
      let this = Self::from_parts(Self::never(), None);
      *this.shared.phase.write() = Phase::Ready(value);
      this
   }

   /// Creates a singleton that is already `Ready` with `value` and releases it
   /// on disposal.
   #[must_use]
   pub fn releasing_with_value(value: T) -> Self
   where
      T: Release,
   {
      let this = Self::from_parts(Self::never(), Some(Releaser::of()));
      *this.shared.phase.write() = Phase::Ready(value);
      this
   }

   /// Factory for singletons that start out `Ready`; it can never be reached.
   fn never() -> Factory<T, E> {
      Arc::new(|_: CancellationToken| futures::future::pending::<Result<T, E>>().boxed())
   }

   pub(crate) fn from_parts(factory: Factory<T, E>, releaser: Option<Releaser<T>>) -> Self {
      Self {
         shared: Arc::new(Shared {
            phase: Arc::new(RwLock::new(Phase::Empty)),
            factory,
            releaser,
            shutdown: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
            attempts: AtomicU64::new(0),
         }),
      }
   }

   /// Returns the current lifecycle state. Never blocks on construction.
   pub fn state(&self) -> SingletonState {
      self.shared.phase.read().state()
   }

   /// Checks if the value has been published.
   #[inline]
   pub fn is_ready(&self) -> bool {
      self.state() == SingletonState::Ready
   }

   /// Checks if the singleton has been disposed.
   #[inline]
   pub fn is_disposed(&self) -> bool {
      self.state() == SingletonState::Disposed
   }

   /// Returns the value if it is published, without starting or waiting for
   /// a construction.
   pub fn try_get(&self) -> Option<T> {
      match &*self.shared.phase.read() {
         Phase::Ready(value) => Some(value.clone()),
         _ => None,
      }
   }

   /// Gets the value, constructing it if needed.
   ///
   /// - If ready, returns the published value.
   /// - If a construction is in flight, waits for it and returns its outcome.
   /// - Otherwise starts a construction and waits for it.
   ///
   /// A factory error is returned as [`SingletonError::Factory`] to every
   /// caller waiting on that attempt; the next call starts a new attempt.
   pub async fn get(&self) -> Result<T, SingletonError<E>> {
      let attempt = match self.enter(Handle::try_current().ok())? {
         Entry::Ready(value) => return Ok(value),
         Entry::Waiting(attempt) => attempt,
      };
      let outcome = attempt.wait().await;
      self.settle(outcome)
   }

   /// Like [`AsyncSingleton::get`], but gives up with
   /// [`SingletonError::Cancelled`] once `cancel` fires.
   ///
   /// Cancelling only detaches this caller; the construction keeps running for
   /// everybody else.
   pub async fn get_with_cancellation(
      &self,
      cancel: &CancellationToken,
   ) -> Result<T, SingletonError<E>> {
      if cancel.is_cancelled() {
         return Err(SingletonError::Cancelled);
      }
      let attempt = match self.enter(Handle::try_current().ok())? {
         Entry::Ready(value) => return Ok(value),
         Entry::Waiting(attempt) => attempt,
      };
      let outcome = tokio::select! {
         biased;
         outcome = attempt.wait() => outcome,
         () = cancel.cancelled() => {
            trace!(attempt = attempt.id(), "caller stopped waiting for singleton value");
            return Err(SingletonError::Cancelled);
         }
      };
      self.settle(outcome)
   }

   /// Gets the value from synchronous code, parking the thread while a
   /// construction is in flight.
   ///
   /// The factory runs on the runtime that was current when the singleton was
   /// created. Must not be called from within an async context: parking a
   /// runtime worker can starve the very task it is waiting on.
   pub fn get_blocking(&self) -> Result<T, SingletonError<E>> {
      match self.enter(None)? {
         Entry::Ready(value) => Ok(value),
         Entry::Waiting(attempt) => {
            let outcome = attempt.wait_blocking();
            self.settle(outcome)
         }
      }
   }

   /// Fast path plus the `Empty -> Constructing` transition.
   fn enter(&self, runtime: Option<Handle>) -> Result<Entry<T, E>, SingletonError<E>> {
      if let Some(entry) = existing(&self.shared.phase.read()) {
         return entry;
      }

      let (attempt, runtime) = {
         let mut phase = self.shared.phase.write();
         // Re-check, someone may have started a construction meanwhile.
         if let Some(entry) = existing(&phase) {
            return entry;
         }
         let runtime = runtime
            .or_else(|| self.shared.runtime.clone())
            .ok_or(SingletonError::NoRuntime)?;
         let id = self.shared.attempts.fetch_add(1, Ordering::Relaxed) + 1;
         let attempt = Attempt::new(id);
         *phase = Phase::Constructing(Arc::clone(&attempt));
         (attempt, runtime)
      };
      debug!(attempt = attempt.id(), "starting singleton construction");

      // The guard exists before the task does. A runtime that is shutting down
      // drops the task unpolled, which abandons the attempt instead of leaving
      // it in flight forever. Spawned outside the lock for the same reason.
      let guard = AttemptGuard::new(Arc::clone(&self.shared.phase), Arc::clone(&attempt));
      drop(runtime.spawn(construct(Arc::clone(&self.shared), guard)));
      Ok(Entry::Waiting(attempt))
   }

   /// Maps an attempt outcome to the caller's result.
   fn settle(&self, outcome: Outcome<T, E>) -> Result<T, SingletonError<E>> {
      match outcome {
         Outcome::Ready(value) => {
            // Disposal flips the phase before it releases anything, so this
            // check keeps released values from escaping.
            if self.shared.phase.read().is_disposed() {
               Err(SingletonError::Disposed)
            } else {
               Ok(value)
            }
         }
         Outcome::Failed(err) => Err(SingletonError::Factory(err)),
         Outcome::Disposed => Err(SingletonError::Disposed),
         Outcome::Abandoned => Err(SingletonError::Abandoned),
      }
   }

   /// Moves to `Disposed`, returning the previous phase, or `None` if already
   /// disposed.
   fn begin_disposal(&self) -> Option<Phase<T, E>> {
      let previous = {
         let mut phase = self.shared.phase.write();
         if phase.is_disposed() {
            return None;
         }
         mem::replace(&mut *phase, Phase::Disposed)
      };
      self.shared.shutdown.cancel();
      debug!(state = ?previous.state(), "disposing singleton");
      Some(previous)
   }

   /// Disposes the singleton, releasing a published value with the blocking
   /// release path.
   ///
   /// Idempotent. An in-flight construction is abandoned: its factory sees
   /// its token cancelled, its waiters get [`SingletonError::Disposed`], and a
   /// value it still manages to produce is released by the construction task.
   pub fn dispose(&self) {
      match self.begin_disposal() {
         Some(Phase::Ready(value)) => {
            if let Some(releaser) = &self.shared.releaser {
               releaser.release(&value);
            }
         }
         Some(Phase::Constructing(attempt)) => {
            attempt.resolve(Outcome::Disposed);
         }
         _ => {}
      }
   }

   /// Disposes the singleton, releasing a published value with the async
   /// release path.
   ///
   /// Idempotent. Unlike [`AsyncSingleton::dispose`], this waits for an
   /// in-flight construction to wind down, so by the time it returns any value
   /// that construction produced has been released.
   pub async fn dispose_async(&self) {
      match self.begin_disposal() {
         Some(Phase::Ready(value)) => {
            if let Some(releaser) = &self.shared.releaser {
               releaser.release_async(&value).await;
            }
         }
         Some(Phase::Constructing(attempt)) => {
            attempt.resolve(Outcome::Disposed);
            attempt.finished().await;
            trace!(attempt = attempt.id(), "construction wound down after disposal");
         }
         _ => {}
      }
   }
}

/// Outcome of the fast path, if the phase alone decides the call.
fn existing<T: Clone, E>(phase: &Phase<T, E>) -> Option<Result<Entry<T, E>, SingletonError<E>>>
where
   E: std::error::Error + 'static,
{
   match phase {
      Phase::Ready(value) => Some(Ok(Entry::Ready(value.clone()))),
      Phase::Constructing(attempt) => Some(Ok(Entry::Waiting(Arc::clone(attempt)))),
      Phase::Disposed => Some(Err(SingletonError::Disposed)),
      Phase::Empty | Phase::Failed(_) => None,
   }
}

/// Body of the construction task.
async fn construct<T, E>(shared: Arc<Shared<T, E>>, mut guard: AttemptGuard<T, E>)
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
{
   let id = guard.attempt_id();
   let result = (shared.factory)(shared.shutdown.child_token()).await;
   if let Err(err) = &result {
      debug!(attempt = id, error = %err, "singleton construction failed");
   }
   if let Some(orphan) = guard.commit(result) {
      debug!(attempt = id, "value finished after disposal; releasing it");
      if let Some(releaser) = &shared.releaser {
         releaser.release_async(&orphan).await;
      }
   }
}

impl<T, E> Drop for AsyncSingleton<T, E>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
{
   fn drop(&mut self) {
      self.dispose();
   }
}

impl<T, E> fmt::Debug for AsyncSingleton<T, E>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
{
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AsyncSingleton")
         .field("state", &self.state())
         .finish_non_exhaustive()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_ready_path_only_takes_a_shared_read() {
      let singleton: AsyncSingleton<u32, std::io::Error> = AsyncSingleton::with_value(7);
      // Another reader holding the state does not hold up the ready path
      let _reader = singleton.shared.phase.read();
      assert_eq!(singleton.get_blocking().unwrap(), 7);
      assert_eq!(singleton.try_get(), Some(7));
      assert!(singleton.is_ready());
   }
}
