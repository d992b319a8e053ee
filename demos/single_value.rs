use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keyed_singleton::{AsyncSingleton, SingletonError};
use tokio::time::{sleep, Duration};

static ATTEMPTS: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, thiserror::Error)]
#[error("settings service unavailable")]
struct Unavailable;

#[tokio::main]
async fn main() {
   let settings = Arc::new(AsyncSingleton::new(|_cancel| async {
      // The first attempt fails, the retry succeeds
      let attempt = ATTEMPTS.fetch_add(1, Ordering::Relaxed) + 1;
      println!("Fetching settings (attempt {attempt})...");
      sleep(Duration::from_millis(50)).await;
      if attempt == 1 {
         Err(Unavailable)
      } else {
         Ok(Arc::new(String::from("region=eu-west")))
      }
   }));

   let tasks: Vec<_> = (0..5)
      .map(|_| {
         let settings = Arc::clone(&settings);
         tokio::spawn(async move { settings.get().await })
      })
      .collect();

   for t in tasks {
      match t.await.unwrap() {
         Ok(_) => panic!("Should have failed"),
         Err(SingletonError::Factory(e)) => println!("Caught error: {e}"),
         Err(e) => panic!("Unexpected error: {e}"),
      }
   }
   assert_eq!(ATTEMPTS.load(Ordering::Relaxed), 1); // All five waited on one attempt

   let value = settings.get().await.unwrap();
   println!("Got settings: {value}");
   assert_eq!(ATTEMPTS.load(Ordering::Relaxed), 2);

   settings.dispose_async().await;
   assert!(settings.get().await.unwrap_err().is_disposed());
}
