use std::collections::HashSet;

use parking_lot::Mutex;

use keyed_singleton::queue::{
   QueueBackend, QueueClients, QueueConfig, QueueEndpoint, QueueError, TransportOptions,
};
use keyed_singleton::Release;

struct HttpTransport;

#[async_trait::async_trait]
impl Release for HttpTransport {
   fn release(&self) {
      println!("Transport closed");
   }
}

/// Stands in for a storage service; keeps queues in memory.
#[derive(Default)]
struct InMemory {
   queues: Mutex<HashSet<String>>,
}

#[async_trait::async_trait]
impl QueueBackend for InMemory {
   type Transport = HttpTransport;

   async fn connect(&self, options: &TransportOptions) -> Result<HttpTransport, QueueError> {
      println!("Connecting (timeout {:?})...", options.timeout());
      Ok(HttpTransport)
   }

   async fn exists(&self, _: &HttpTransport, endpoint: &QueueEndpoint) -> Result<bool, QueueError> {
      Ok(self.queues.lock().contains(&endpoint.queue))
   }

   async fn create(&self, _: &HttpTransport, endpoint: &QueueEndpoint) -> Result<(), QueueError> {
      println!("Creating queue {}", endpoint.queue);
      self.queues.lock().insert(endpoint.queue.clone());
      Ok(())
   }
}

#[tokio::main]
async fn main() -> Result<(), QueueError> {
   tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .init();

   let config = QueueConfig::new("UseDevelopmentStorage=true");
   let clients = QueueClients::new(config, InMemory::default())?;

   let orders = clients.get("Orders").await?;
   let again = clients.get("orders").await?;
   println!("Queue {} exists: {}", orders.name(), again.exists().await?);

   match clients.get("no_underscores").await {
      Ok(_) => panic!("Should have failed"),
      Err(e) => println!("Caught error: {}", e.root()),
   }

   clients.dispose_async().await;
   assert!(orders.is_released());
   Ok(())
}
