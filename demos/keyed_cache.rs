use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keyed_singleton::{KeyedSingleton, Release};
use tokio::time::{sleep, Duration};

struct Connection {
   tenant: String,
   open: AtomicBool,
}

#[async_trait::async_trait]
impl Release for Connection {
   fn release(&self) {
      self.open.store(false, Ordering::SeqCst);
      println!("Closed connection for {}", self.tenant);
   }

   async fn release_async(&self) {
      sleep(Duration::from_millis(10)).await;
      self.release();
   }
}

#[tokio::main]
async fn main() {
   let connections: Arc<KeyedSingleton<Arc<Connection>, std::io::Error>> =
      Arc::new(KeyedSingleton::releasing(|tenant: String, (), _cancel| async move {
         println!("Opening connection for {tenant}...");
         sleep(Duration::from_millis(50)).await;
         Ok(Arc::new(Connection {
            tenant,
            open: AtomicBool::new(true),
         }))
      }));

   let tasks: Vec<_> = ["Acme", "acme", "Globex", "ACME", "globex"]
      .into_iter()
      .map(|tenant| {
         let connections = Arc::clone(&connections);
         tokio::spawn(async move { connections.get(tenant).await.unwrap() })
      })
      .collect();

   for t in tasks {
      let connection = t.await.unwrap();
      println!("Task got connection for {}", connection.tenant);
   }
   assert_eq!(connections.len(), 2); // One per tenant, whatever the casing

   let acme = connections.get("acme").await.unwrap();
   connections.remove_async("acme").await;
   assert!(!acme.open.load(Ordering::SeqCst));

   connections.dispose_async().await;
   println!("All connections closed");
}
