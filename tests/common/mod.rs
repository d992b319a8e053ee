#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use keyed_singleton::Release;

/// Factory error used throughout the tests.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("attempt {0} failed")]
pub struct Boom(pub usize);

/// Value that records how it was released.
#[derive(Debug)]
pub struct Tracked {
   pub id: usize,
   sync_releases: AtomicUsize,
   async_releases: AtomicUsize,
}

impl Tracked {
   pub fn new(id: usize) -> Self {
      Self {
         id,
         sync_releases: AtomicUsize::new(0),
         async_releases: AtomicUsize::new(0),
      }
   }

   pub fn sync_releases(&self) -> usize {
      self.sync_releases.load(Ordering::SeqCst)
   }

   pub fn async_releases(&self) -> usize {
      self.async_releases.load(Ordering::SeqCst)
   }

   pub fn releases(&self) -> usize {
      self.sync_releases() + self.async_releases()
   }
}

#[async_trait::async_trait]
impl Release for Tracked {
   fn release(&self) {
      self.sync_releases.fetch_add(1, Ordering::SeqCst);
   }

   async fn release_async(&self) {
      tokio::task::yield_now().await;
      self.async_releases.fetch_add(1, Ordering::SeqCst);
   }
}

/// Installs a test subscriber once so `RUST_LOG=keyed_singleton=trace` shows
/// the cache's diagnostics.
pub fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
}
