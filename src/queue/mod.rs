//! Cached message-queue clients built on the singleton primitives.
//!
//! [`QueueClients`] hands out one [`QueueClient`] per queue name. Two caches
//! are stacked:
//!
//! - an [`AsyncSingleton`](crate::AsyncSingleton) holding the HTTP transport
//!   shared by every queue (connection pooling, timeouts), and
//! - a [`KeyedSingleton`](crate::KeyedSingleton) of queue clients keyed by
//!   lower-cased queue name, whose factory awaits the transport singleton,
//!   makes sure the queue exists remotely (creating it when missing), and
//!   wraps the result.
//!
//! The wire protocol lives behind [`QueueBackend`]; this module only owns
//! caching, naming rules, configuration and lifecycle.

mod client;
mod config;
mod naming;

use crate::error::SingletonError;

pub use client::{QueueBackend, QueueClient, QueueClients, QueueEndpoint};
pub use config::{QueueConfig, TransportOptions};
pub use naming::validate_queue_name;

/// Errors from the queue client layer.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
   #[error("invalid queue name {name:?}: {reason}")]
   InvalidName { name: String, reason: &'static str },

   #[error("queue connection string is not configured")]
   MissingConnectionString,

   #[error("invalid queue configuration: {0}")]
   InvalidConfig(&'static str),

   #[error("failed to load queue configuration: {0}")]
   Config(#[from] Box<figment::Error>),

   #[error("queue backend request failed: {0}")]
   Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

   #[error(transparent)]
   Cache(#[from] SingletonError<QueueError>),
}

impl QueueError {
   /// Wraps a transport or service failure from a [`QueueBackend`].
   pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
      Self::Backend(err.into())
   }

   /// Looks through cache layers for the error that actually failed the
   /// construction.
   pub fn root(&self) -> &QueueError {
      match self {
         Self::Cache(SingletonError::Factory(inner)) => inner.root(),
         other => other,
      }
   }
}
