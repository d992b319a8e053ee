//! Keyed cache of independently constructed singletons.
//!
//! [`KeyedSingleton<T, E, A>`] maps normalized string keys to their own
//! [`AsyncSingleton`]. There are two single-flight points per key: creating
//! the slot (double-checked under the map's write lock) and constructing the
//! value (the slot's own attempt machinery). The map lock is only held for the
//! map lookup or mutation, never across a factory invocation, so a slow key
//! never holds up any other key.

use core::fmt;
use core::future::Future;
use core::sync::atomic::{AtomicBool, Ordering};
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::SingletonError;
use crate::release::{Release, Releaser};
use crate::singleton::AsyncSingleton;

type KeyedFactory<T, E, A> =
   Arc<dyn Fn(String, A, CancellationToken) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

type Slot<T, E> = Arc<AsyncSingleton<T, E>>;

/// Normalizes a cache key: ordinal, per-character lower-casing.
///
/// Each character is folded on its own with [`char::to_lowercase`], so the
/// result never depends on surrounding characters or locale (`"ΟΔΟΣ"` and
/// `"οδοσ"` share a key, as do `"ǅ"`, `"Ǆ"` and `"ǆ"`). Borrows `key`
/// unchanged when it has nothing to fold.
///
/// ```
/// use keyed_singleton::normalize_key;
///
/// assert_eq!(normalize_key("Orders"), "orders");
/// assert!(matches!(normalize_key("orders"), std::borrow::Cow::Borrowed(_)));
/// ```
pub fn normalize_key(key: &str) -> Cow<'_, str> {
   if key.is_ascii() {
      if key.bytes().any(|b| b.is_ascii_uppercase()) {
         return Cow::Owned(key.to_ascii_lowercase());
      }
      return Cow::Borrowed(key);
   }
   if key.chars().all(|c| c.to_lowercase().eq([c])) {
      Cow::Borrowed(key)
   } else {
      Cow::Owned(key.chars().flat_map(char::to_lowercase).collect())
   }
}

/// A map from key to a lazily constructed, shared value.
///
/// The first reference to a key creates its slot; the slot's value is built
/// by the shared factory, which receives the normalized key, the extra
/// arguments `A` passed by the caller that created the slot, and a
/// cancellation token that fires when the slot is removed or the cache is
/// disposed.
///
/// # Examples
///
/// ```
/// use keyed_singleton::KeyedSingleton;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let clients: KeyedSingleton<Arc<String>, std::io::Error> =
///    KeyedSingleton::new(|key, (), _cancel| async move { Ok(Arc::new(format!("client for {key}"))) });
///
/// let a = clients.get("Orders").await.unwrap();
/// let b = clients.get("orders").await.unwrap();
/// assert!(Arc::ptr_eq(&a, &b));
/// assert_eq!(*a, "client for orders");
/// # }
/// ```
pub struct KeyedSingleton<T, E, A = ()>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
   A: Clone + Send + Sync + 'static,
{
   slots: RwLock<HashMap<String, Slot<T, E>>>,
   factory: KeyedFactory<T, E, A>,
   releaser: Option<Releaser<T>>,
   /// Only flipped under the `slots` write lock.
   disposed: AtomicBool,
}

impl<T, E, A> KeyedSingleton<T, E, A>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
   A: Clone + Send + Sync + 'static,
{
   /// Creates an empty cache whose values need no release.
   #[must_use]
   pub fn new<F, Fut>(factory: F) -> Self
   where
      F: Fn(String, A, CancellationToken) -> Fut + Send + Sync + 'static,
      Fut: Future<Output = Result<T, E>> + Send + 'static,
   {
      Self::from_parts(
         Arc::new(move |key, args, token| factory(key, args, token).boxed()),
         None,
      )
   }

   /// Creates an empty cache that releases each value when its slot is
   /// removed or the cache is disposed.
   #[must_use]
   pub fn releasing<F, Fut>(factory: F) -> Self
   where
      T: Release,
      F: Fn(String, A, CancellationToken) -> Fut + Send + Sync + 'static,
      Fut: Future<Output = Result<T, E>> + Send + 'static,
   {
      Self::from_parts(
         Arc::new(move |key, args, token| factory(key, args, token).boxed()),
         Some(Releaser::of()),
      )
   }

   fn from_parts(factory: KeyedFactory<T, E, A>, releaser: Option<Releaser<T>>) -> Self {
      Self {
         slots: RwLock::new(HashMap::new()),
         factory,
         releaser,
         disposed: AtomicBool::new(false),
      }
   }

   /// Checks if the cache has been disposed.
   #[inline]
   pub fn is_disposed(&self) -> bool {
      self.disposed.load(Ordering::Acquire)
   }

   /// Number of live slots (constructed, constructing, or failed).
   pub fn len(&self) -> usize {
      self.slots.read().len()
   }

   /// Returns `true` if no slot exists.
   pub fn is_empty(&self) -> bool {
      self.slots.read().is_empty()
   }

   /// Returns `true` if a slot exists for `key` (after normalization).
   pub fn contains_key(&self, key: &str) -> bool {
      self.slots.read().contains_key(normalize_key(key).as_ref())
   }

   /// Gets the value for `key`, constructing it if needed.
   pub async fn get(&self, key: &str) -> Result<T, SingletonError<E>>
   where
      A: Default,
   {
      self.get_with(key, A::default(), None).await
   }

   /// Like [`KeyedSingleton::get`], but stops waiting with
   /// [`SingletonError::Cancelled`] once `cancel` fires.
   pub async fn get_with_cancellation(
      &self,
      key: &str,
      cancel: &CancellationToken,
   ) -> Result<T, SingletonError<E>>
   where
      A: Default,
   {
      self.get_with(key, A::default(), Some(cancel)).await
   }

   /// Gets the value for `key`, creating its slot with `args` if this is the
   /// first reference to the key.
   ///
   /// `args` is ignored when the slot already exists. If the slot is removed
   /// while this call waits on it, the call starts over against a fresh slot
   /// rather than hand out a value whose release has begun.
   pub async fn get_with(
      &self,
      key: &str,
      args: A,
      cancel: Option<&CancellationToken>,
   ) -> Result<T, SingletonError<E>> {
      let key = normalize_key(key);
      loop {
         if self.is_disposed() {
            return Err(SingletonError::Disposed);
         }
         let slot = self.slot(&key, &args)?;
         let result = match cancel {
            Some(cancel) => slot.get_with_cancellation(cancel).await,
            None => slot.get().await,
         };
         match result {
            Err(SingletonError::Disposed) if !self.is_disposed() => {
               debug!(key = %key, "slot was removed mid-request; retrying with a fresh slot");
            }
            result => return result,
         }
      }
   }

   /// Looks up the slot for a normalized key, creating it if missing.
   fn slot(&self, key: &str, args: &A) -> Result<Slot<T, E>, SingletonError<E>> {
      if let Some(slot) = self.slots.read().get(key) {
         return Ok(Arc::clone(slot));
      }

      let mut slots = self.slots.write();
      if self.is_disposed() {
         return Err(SingletonError::Disposed);
      }
      // Someone else may have created it between the two lookups.
      if let Some(slot) = slots.get(key) {
         return Ok(Arc::clone(slot));
      }
      let slot = Arc::new(self.new_slot(key.to_owned(), args.clone()));
      slots.insert(key.to_owned(), Arc::clone(&slot));
      trace!(key, "created singleton slot");
      Ok(slot)
   }

   fn new_slot(&self, key: String, args: A) -> AsyncSingleton<T, E> {
      let factory = Arc::clone(&self.factory);
      AsyncSingleton::from_parts(
         Arc::new(move |token| factory(key.clone(), args.clone(), token)),
         self.releaser,
      )
   }

   fn unlink(&self, key: &str) -> Option<Slot<T, E>> {
      self.slots.write().remove(normalize_key(key).as_ref())
   }

   /// Removes and disposes the slot for `key`, using the blocking release
   /// path. Returns `false` if there was no slot.
   ///
   /// The next `get` for the key builds a fresh value.
   pub fn remove(&self, key: &str) -> bool {
      let Some(slot) = self.unlink(key) else {
         return false;
      };
      debug!(key, "removing singleton slot");
      slot.dispose();
      true
   }

   /// Removes and disposes the slot for `key`, using the async release path.
   /// Returns `false` if there was no slot.
   pub async fn remove_async(&self, key: &str) -> bool {
      let Some(slot) = self.unlink(key) else {
         return false;
      };
      debug!(key, "removing singleton slot");
      slot.dispose_async().await;
      true
   }

   /// Marks the cache disposed and takes every slot out of the map.
   /// Returns `None` if it was already disposed.
   fn drain(&self) -> Option<Vec<Slot<T, E>>> {
      let mut slots = self.slots.write();
      if self.disposed.swap(true, Ordering::AcqRel) {
         return None;
      }
      debug!(slots = slots.len(), "disposing keyed singleton cache");
      Some(slots.drain().map(|(_, slot)| slot).collect())
   }

   /// Disposes every slot with the blocking release path. Idempotent; any
   /// later `get` fails with [`SingletonError::Disposed`].
   pub fn dispose(&self) {
      for slot in self.drain().into_iter().flatten() {
         slot.dispose();
      }
   }

   /// Disposes every slot concurrently with the async release path.
   /// Idempotent.
   pub async fn dispose_async(&self) {
      let Some(slots) = self.drain() else {
         return;
      };
      futures::future::join_all(slots.iter().map(|slot| slot.dispose_async())).await;
   }
}

impl<T, E, A> Drop for KeyedSingleton<T, E, A>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
   A: Clone + Send + Sync + 'static,
{
   fn drop(&mut self) {
      self.dispose();
   }
}

impl<T, E, A> fmt::Debug for KeyedSingleton<T, E, A>
where
   T: Clone + Send + Sync + 'static,
   E: std::error::Error + Send + Sync + 'static,
   A: Clone + Send + Sync + 'static,
{
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let slots = self.slots.read();
      let mut keys: Vec<&str> = slots.keys().map(String::as_str).collect();
      keys.sort_unstable();
      f.debug_struct("KeyedSingleton")
         .field("keys", &keys)
         .field("disposed", &self.is_disposed())
         .finish_non_exhaustive()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_normalize_key_folds_case() {
      assert_eq!(normalize_key("Payments"), "payments");
      assert_eq!(normalize_key("ORDERS-EU"), "orders-eu");
   }

   #[test]
   fn test_normalize_key_borrows_folded_input() {
      assert!(matches!(normalize_key("orders"), Cow::Borrowed("orders")));
      assert!(matches!(normalize_key("orders-42"), Cow::Borrowed(_)));
   }

   #[test]
   fn test_normalize_key_is_not_ascii_only() {
      assert_eq!(normalize_key("ÖRDERS"), "örders");
   }

   #[test]
   fn test_normalize_key_folds_titlecase() {
      assert_eq!(normalize_key("ǅx"), "ǆx");
      assert_eq!(normalize_key("Ǆx"), "ǆx");
      assert!(matches!(normalize_key("ǆx"), Cow::Borrowed(_)));
   }

   #[test]
   fn test_normalize_key_sigma_is_context_free() {
      assert_eq!(normalize_key("ΟΔΟΣ"), "οδοσ");
      assert_eq!(normalize_key("ΟΔΟΣ"), normalize_key("οδοσ"));
      assert!(matches!(normalize_key("οδοσ"), Cow::Borrowed(_)));
      // Final sigma is its own character and stays as written
      assert!(matches!(normalize_key("οδος"), Cow::Borrowed(_)));
   }
}
