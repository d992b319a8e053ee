//! Error type shared by [`AsyncSingleton`](crate::AsyncSingleton) and
//! [`KeyedSingleton`](crate::KeyedSingleton).

use std::sync::Arc;

/// Why a `get` did not produce a value.
///
/// `E` is the factory's own error type. A factory failure is wrapped in an
/// [`Arc`] exactly once and the same allocation is handed to every caller that
/// waited on that construction attempt.
#[derive(Debug, thiserror::Error)]
pub enum SingletonError<E: std::error::Error + 'static> {
   /// The factory returned an error for this construction attempt.
   #[error("value construction failed: {0}")]
   Factory(#[source] Arc<E>),

   /// The caller's cancellation token fired before the value was available.
   #[error("wait for value was cancelled")]
   Cancelled,

   /// The singleton (or the whole cache) has been disposed.
   #[error("singleton has been disposed")]
   Disposed,

   /// The construction task ended without an outcome (factory panic or runtime shutdown).
   #[error("construction attempt was abandoned before completing")]
   Abandoned,

   /// Construction had to start, but no tokio runtime was reachable.
   #[error("no tokio runtime available to run the factory")]
   NoRuntime,
}

impl<E: std::error::Error + 'static> SingletonError<E> {
   /// Returns the factory error, if this is a construction failure.
   pub fn factory_error(&self) -> Option<&E> {
      match self {
         Self::Factory(err) => Some(&**err),
         _ => None,
      }
   }

   /// Returns `true` for [`SingletonError::Disposed`].
   pub fn is_disposed(&self) -> bool {
      matches!(self, Self::Disposed)
   }
}

impl<E: std::error::Error + 'static> Clone for SingletonError<E> {
   fn clone(&self) -> Self {
      match self {
         Self::Factory(err) => Self::Factory(Arc::clone(err)),
         Self::Cancelled => Self::Cancelled,
         Self::Disposed => Self::Disposed,
         Self::Abandoned => Self::Abandoned,
         Self::NoRuntime => Self::NoRuntime,
      }
   }
}
