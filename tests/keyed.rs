use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use keyed_singleton::{CancellationToken, KeyedSingleton, SingletonError};

mod common;
use common::{init_tracing, Boom, Tracked};

/// Counts factory invocations per key.
#[derive(Default)]
struct Calls(Mutex<HashMap<String, usize>>);

impl Calls {
   fn record(&self, key: &str) -> usize {
      let mut calls = self.0.lock();
      let count = calls.entry(key.to_owned()).or_default();
      *count += 1;
      *count
   }

   fn of(&self, key: &str) -> usize {
      self.0.lock().get(key).copied().unwrap_or(0)
   }
}

fn tracked_cache(calls: &Arc<Calls>) -> KeyedSingleton<Arc<Tracked>, Boom> {
   let calls = Arc::clone(calls);
   KeyedSingleton::releasing(move |key: String, (), _cancel| {
      let calls = Arc::clone(&calls);
      async move {
         let n = calls.record(&key);
         tokio::time::sleep(Duration::from_millis(10)).await;
         Ok(Arc::new(Tracked::new(n)))
      }
   })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_per_key() {
   init_tracing();
   let calls = Arc::new(Calls::default());
   let cache = Arc::new({
      let calls = Arc::clone(&calls);
      KeyedSingleton::<Arc<String>, Boom>::new(move |key, (), _cancel| {
         let calls = Arc::clone(&calls);
         async move {
            calls.record(&key);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Arc::new(key))
         }
      })
   });

   let handles: Vec<_> = (0..24)
      .map(|i| {
         let cache = Arc::clone(&cache);
         let key = if i % 2 == 0 { "orders" } else { "payments" };
         tokio::spawn(async move { cache.get(key).await.unwrap() })
      })
      .collect();

   let mut values = Vec::new();
   for handle in handles {
      values.push(handle.await.unwrap());
   }

   assert_eq!(calls.of("orders"), 1);
   assert_eq!(calls.of("payments"), 1);
   assert_eq!(cache.len(), 2);
   for (i, value) in values.iter().enumerate() {
      assert!(Arc::ptr_eq(value, &values[i % 2]));
   }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_key_does_not_block_other_keys() {
   let cache: Arc<KeyedSingleton<u32, Boom>> =
      Arc::new(KeyedSingleton::new(|key: String, (), _cancel| async move {
         if key == "slow" {
            tokio::time::sleep(Duration::from_millis(500)).await;
         }
         Ok(1)
      }));

   let slow = tokio::spawn({
      let cache = Arc::clone(&cache);
      async move { cache.get("slow").await }
   });
   tokio::time::sleep(Duration::from_millis(20)).await;

   let started = Instant::now();
   assert_eq!(cache.get("fast").await.unwrap(), 1);
   assert!(started.elapsed() < Duration::from_millis(250));
   assert!(!slow.is_finished());

   assert_eq!(slow.await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn test_keys_are_case_insensitive() {
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);

   let upper = cache.get("Orders").await.unwrap();
   let lower = cache.get("orders").await.unwrap();
   assert!(Arc::ptr_eq(&upper, &lower));
   assert_eq!(calls.of("orders"), 1);
   assert_eq!(calls.of("Orders"), 0);
   assert!(cache.contains_key("ORDERS"));
   assert_eq!(cache.len(), 1);

   // Folding is per character, so context never splits a key
   let upper = cache.get("ΟΔΟΣ").await.unwrap();
   let lower = cache.get("οδοσ").await.unwrap();
   assert!(Arc::ptr_eq(&upper, &lower));
   let title = cache.get("ǅx").await.unwrap();
   let caps = cache.get("Ǆx").await.unwrap();
   assert!(Arc::ptr_eq(&title, &caps));
   assert_eq!(cache.len(), 3);
}

#[tokio::test]
async fn test_remove_releases_and_rebuilds() {
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);

   let first = cache.get("orders").await.unwrap();
   assert!(cache.remove("Orders"));
   assert_eq!(first.sync_releases(), 1);
   assert!(!cache.contains_key("orders"));
   assert!(cache.is_empty());

   // Removing a missing key is a no-op
   assert!(!cache.remove("orders"));
   assert_eq!(first.sync_releases(), 1);

   let second = cache.get("orders").await.unwrap();
   assert!(!Arc::ptr_eq(&first, &second));
   assert_eq!(second.id, 2);
   assert_eq!(second.releases(), 0);
}

#[tokio::test]
async fn test_remove_async_uses_async_release() {
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);

   let value = cache.get("orders").await.unwrap();
   assert!(cache.remove_async("orders").await);
   assert!(!cache.remove_async("orders").await);
   assert_eq!(value.async_releases(), 1);
   assert_eq!(value.sync_releases(), 0);
}

#[tokio::test]
async fn test_dispose_releases_every_value_once() {
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);

   let orders = cache.get("orders").await.unwrap();
   let payments = cache.get("payments").await.unwrap();

   cache.dispose_async().await;
   cache.dispose_async().await;
   cache.dispose();

   assert!(cache.is_disposed());
   assert!(cache.is_empty());
   for value in [&orders, &payments] {
      assert_eq!(value.async_releases(), 1);
      assert_eq!(value.sync_releases(), 0);
   }
}

#[tokio::test]
async fn test_get_after_dispose_fails() {
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);
   cache.get("orders").await.unwrap();
   cache.dispose();

   assert!(matches!(cache.get("orders").await, Err(SingletonError::Disposed)));
   assert!(matches!(cache.get("invoices").await, Err(SingletonError::Disposed)));
   assert_eq!(calls.of("invoices"), 0);
   assert!(!cache.remove("orders"));
}

#[tokio::test]
async fn test_failures_are_not_cached() {
   let calls = Arc::new(Calls::default());
   let cache: KeyedSingleton<usize, Boom> = KeyedSingleton::new({
      let calls = Arc::clone(&calls);
      move |key: String, (), _cancel| {
         let n = calls.record(&key);
         async move {
            if n == 1 {
               Err(Boom(n))
            } else {
               Ok(n)
            }
         }
      }
   });

   let err = cache.get("orders").await.unwrap_err();
   assert_eq!(err.factory_error(), Some(&Boom(1)));
   // The slot survives a failure; the next request retries in place
   assert!(cache.contains_key("orders"));
   assert_eq!(cache.get("orders").await.unwrap(), 2);
   assert_eq!(cache.get("orders").await.unwrap(), 2);
   assert_eq!(calls.of("orders"), 2);
}

#[tokio::test]
async fn test_args_apply_only_when_creating_the_slot() {
   let cache: KeyedSingleton<String, Boom, u16> =
      KeyedSingleton::new(|key: String, port: u16, _cancel| async move {
         Ok(format!("{key}:{port}"))
      });

   let first = cache.get_with("Primary", 5432, None).await.unwrap();
   let second = cache.get_with("primary", 6543, None).await.unwrap();
   assert_eq!(first, "primary:5432");
   assert_eq!(second, "primary:5432");

   // Defaulted args through the plain getter
   assert_eq!(cache.get("replica").await.unwrap(), "replica:0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_get_leaves_slot_constructing() {
   let calls = Arc::new(Calls::default());
   let cache: Arc<KeyedSingleton<usize, Boom>> = Arc::new(KeyedSingleton::new({
      let calls = Arc::clone(&calls);
      move |key: String, (), _cancel| {
         let calls = Arc::clone(&calls);
         async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(calls.record(&key))
         }
      }
   }));

   let cancel = CancellationToken::new();
   let impatient = tokio::spawn({
      let cache = Arc::clone(&cache);
      let cancel = cancel.clone();
      async move { cache.get_with_cancellation("orders", &cancel).await }
   });
   tokio::time::sleep(Duration::from_millis(10)).await;
   cancel.cancel();
   assert!(matches!(impatient.await.unwrap(), Err(SingletonError::Cancelled)));

   assert_eq!(cache.get("orders").await.unwrap(), 1);
   assert_eq!(calls.of("orders"), 1);
}

#[tokio::test]
async fn test_factory_token_fires_on_remove() {
   let seen = Arc::new(AtomicUsize::new(0));
   let cache: KeyedSingleton<u32, Boom> = KeyedSingleton::new({
      let seen = Arc::clone(&seen);
      move |_key, (), cancel: CancellationToken| {
         let seen = Arc::clone(&seen);
         async move {
            cancel.cancelled().await;
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Boom(0))
         }
      }
   });

   let pending = tokio::time::timeout(Duration::from_millis(10), cache.get("orders")).await;
   assert!(pending.is_err());
   assert!(cache.remove_async("orders").await);
   assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_disposes_slots() {
   let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_time()
      .build()
      .unwrap();
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);
   let value = runtime.block_on(cache.get("orders")).unwrap();

   drop(cache);
   assert_eq!(value.sync_releases(), 1);
}

#[tokio::test]
async fn test_debug_lists_keys() {
   let calls = Arc::new(Calls::default());
   let cache = tracked_cache(&calls);
   cache.get("payments").await.unwrap();
   cache.get("Orders").await.unwrap();

   let rendered = format!("{cache:?}");
   assert!(rendered.contains(r#"keys: ["orders", "payments"]"#), "{rendered}");
}
