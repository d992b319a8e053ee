//! Release contract for cached values that hold external resources.
//!
//! A singleton built with `releasing` calls exactly one of the two release
//! paths on its value, exactly once: [`Release::release`] when torn down
//! through the blocking `dispose`/`remove` calls (or on drop), and
//! [`Release::release_async`] when torn down through `dispose_async`/
//! `remove_async`, or when a value finishes construction after teardown began.

use std::sync::Arc;

use futures::future::BoxFuture;

/// Teardown hook for values owned by a singleton.
///
/// # Examples
///
/// ```
/// use keyed_singleton::Release;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// struct Connection {
///    open: AtomicBool,
/// }
///
/// #[async_trait::async_trait]
/// impl Release for Connection {
///    fn release(&self) {
///       self.open.store(false, Ordering::SeqCst);
///    }
/// }
/// ```
#[async_trait::async_trait]
pub trait Release: Send + Sync {
   /// Releases held resources, blocking the calling thread if needed.
   fn release(&self);

   /// Releases held resources asynchronously.
   ///
   /// Defaults to [`Release::release`].
   async fn release_async(&self) {
      self.release();
   }
}

#[async_trait::async_trait]
impl<R: Release + ?Sized> Release for Arc<R> {
   fn release(&self) {
      (**self).release();
   }

   async fn release_async(&self) {
      (**self).release_async().await;
   }
}

/// Type-erased release hooks, so singletons over values without a
/// [`Release`] impl share one representation with those that have one.
pub(crate) struct Releaser<T> {
   blocking: fn(&T),
   deferred: for<'a> fn(&'a T) -> BoxFuture<'a, ()>,
}

impl<T: Release> Releaser<T> {
   pub(crate) fn of() -> Self {
      fn blocking<T: Release>(value: &T) {
         value.release();
      }
      fn deferred<T: Release>(value: &T) -> BoxFuture<'_, ()> {
         value.release_async()
      }
      Self {
         blocking: blocking::<T>,
         deferred: deferred::<T>,
      }
   }
}

impl<T> Releaser<T> {
   #[inline]
   pub(crate) fn release(&self, value: &T) {
      (self.blocking)(value);
   }

   #[inline]
   pub(crate) async fn release_async(&self, value: &T) {
      (self.deferred)(value).await;
   }
}

impl<T> Clone for Releaser<T> {
   fn clone(&self) -> Self {
      *self
   }
}

impl<T> Copy for Releaser<T> {}
