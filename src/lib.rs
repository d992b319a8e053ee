//! Single-flight async singletons and keyed singleton caches.
//!
//! This crate provides two cooperating types for sharing expensive,
//! asynchronously created resources (network clients, connection pools,
//! remote handles) inside one process:
//!
//! - [`AsyncSingleton<T, E>`]: lazily constructs one value with an async
//!   factory. Concurrent callers share a single factory invocation, failures
//!   are reported to everyone waiting and retried on the next request, and
//!   disposal releases the value exactly once.
//! - [`KeyedSingleton<T, E, A>`]: a map from case-insensitive key to an
//!   independent [`AsyncSingleton`], created on first reference. Different keys
//!   build fully in parallel.
//!
//! Both are plain owned objects: create one at your composition root, share it
//! (typically behind an [`Arc`](std::sync::Arc)), and tear it down explicitly
//! with `dispose`/`dispose_async`. Use after teardown fails with
//! [`SingletonError::Disposed`] rather than silently rebuilding.
//!
//! # Features
//!
//! - **Single-flight**: at most one factory invocation in flight per value.
//! - **Shared outcomes**: every waiter of an attempt sees the same value or the same error.
//! - **Local cancellation**: a caller's [`CancellationToken`] only ends its own wait.
//! - **Cooperative teardown**: factories get a token cancelled on disposal, and a
//!   value that completes after disposal is released instead of leaked.
//! - **Sync and async paths**: `get_blocking`, `dispose`/`dispose_async`,
//!   `remove`/`remove_async`, and a [`Release`] trait with both release paths.
//!
//! # Examples
//!
//! ## Keyed cache
//!
//! ```rust
//! use keyed_singleton::KeyedSingleton;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queues: KeyedSingleton<Arc<String>, std::io::Error> =
//!    KeyedSingleton::new(|name, (), _cancel| async move {
//!       // Expensive remote handshake goes here; it runs once per queue name.
//!       Ok(Arc::new(name))
//!    });
//!
//! let orders = queues.get("Orders").await.unwrap();
//! assert_eq!(*orders, "orders");
//!
//! queues.dispose_async().await;
//! assert!(queues.get("orders").await.is_err());
//! # }
//! ```
//!
//! ## Layered caches
//!
//! A factory can await another singleton, e.g. a shared transport beneath
//! per-queue clients. No lock is held while a factory runs, so layering cannot
//! deadlock. See the [`queue`] module for a complete example.

/// Error type returned by `get` calls.
mod error;

/// Keyed singleton cache.
mod keyed;

/// Release contract for cached values.
mod release;

/// Single-value async singleton.
mod singleton;

/// Internal state machine and attempt broadcasting.
mod state;

#[cfg(feature = "queue")]
pub mod queue;

pub use error::SingletonError;
pub use keyed::{normalize_key, KeyedSingleton};
pub use release::Release;
pub use singleton::AsyncSingleton;
pub use state::SingletonState;
pub use tokio_util::sync::CancellationToken;
