use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{QueueConfig, TransportOptions};
use super::naming::validate_queue_name;
use super::QueueError;
use crate::{normalize_key, AsyncSingleton, KeyedSingleton, Release};

/// Remote side of the queue layer: transport creation and queue management.
///
/// Implementations wrap the actual storage SDK. They are called only from
/// inside the cache factories, at most once per construction.
#[async_trait::async_trait]
pub trait QueueBackend: Send + Sync + 'static {
   /// Pooled HTTP transport shared by every queue client.
   type Transport: Release + 'static;

   /// Builds the shared transport.
   async fn connect(&self, options: &TransportOptions) -> Result<Self::Transport, QueueError>;

   /// Checks whether the queue exists.
   async fn exists(
      &self,
      transport: &Self::Transport,
      endpoint: &QueueEndpoint,
   ) -> Result<bool, QueueError>;

   /// Creates the queue.
   async fn create(
      &self,
      transport: &Self::Transport,
      endpoint: &QueueEndpoint,
   ) -> Result<(), QueueError>;
}

/// Address of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueEndpoint {
   pub connection_string: String,
   pub queue: String,
}

/// Handle to one existing queue. Cheap to share behind an [`Arc`].
pub struct QueueClient<B: QueueBackend> {
   endpoint: QueueEndpoint,
   transport: Arc<B::Transport>,
   backend: Arc<B>,
   released: AtomicBool,
}

impl<B: QueueBackend> QueueClient<B> {
   /// Lower-cased queue name.
   pub fn name(&self) -> &str {
      &self.endpoint.queue
   }

   pub fn endpoint(&self) -> &QueueEndpoint {
      &self.endpoint
   }

   /// The shared transport this client talks through.
   pub fn transport(&self) -> &Arc<B::Transport> {
      &self.transport
   }

   /// Returns `true` once the owning cache has released this client.
   pub fn is_released(&self) -> bool {
      self.released.load(Ordering::Acquire)
   }

   /// Asks the backend whether the queue still exists.
   pub async fn exists(&self) -> Result<bool, QueueError> {
      self.backend.exists(&self.transport, &self.endpoint).await
   }
}

#[async_trait::async_trait]
impl<B: QueueBackend> Release for QueueClient<B> {
   fn release(&self) {
      if self.released.swap(true, Ordering::AcqRel) {
         warn!(queue = %self.endpoint.queue, "queue client released twice");
      } else {
         debug!(queue = %self.endpoint.queue, "released queue client");
      }
   }
}

impl<B: QueueBackend> fmt::Debug for QueueClient<B> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("QueueClient")
         .field("queue", &self.endpoint.queue)
         .field("released", &self.is_released())
         .finish_non_exhaustive()
   }
}

/// Process-wide cache of queue clients.
///
/// Create one at startup and share it. Every queue name maps to one client;
/// the first request for a name creates the queue remotely if it is missing.
pub struct QueueClients<B: QueueBackend> {
   clients: KeyedSingleton<Arc<QueueClient<B>>, QueueError>,
   transport: Arc<AsyncSingleton<Arc<B::Transport>, QueueError>>,
}

impl<B: QueueBackend> QueueClients<B> {
   /// Builds the cache. Nothing is contacted until the first `get`.
   pub fn new(config: QueueConfig, backend: B) -> Result<Self, QueueError> {
      config.validate()?;
      let backend = Arc::new(backend);

      let transport: Arc<AsyncSingleton<Arc<B::Transport>, QueueError>> = {
         let backend = Arc::clone(&backend);
         let options = config.transport.clone();
         Arc::new(AsyncSingleton::releasing(move |_cancel: CancellationToken| {
            let backend = Arc::clone(&backend);
            let options = options.clone();
            async move {
               debug!(
                  timeout_secs = options.timeout_secs,
                  max_connections = options.max_connections_per_server,
                  "connecting queue transport"
               );
               Ok(Arc::new(backend.connect(&options).await?))
            }
         }))
      };

      let clients: KeyedSingleton<Arc<QueueClient<B>>, QueueError> = KeyedSingleton::releasing({
         let transport = Arc::clone(&transport);
         let connection_string = config.connection_string;
         move |queue: String, (), cancel: CancellationToken| {
            let transport = Arc::clone(&transport);
            let backend = Arc::clone(&backend);
            let endpoint = QueueEndpoint {
               connection_string: connection_string.clone(),
               queue,
            };
            async move {
               let transport = transport.get_with_cancellation(&cancel).await?;
               if !backend.exists(&transport, &endpoint).await? {
                  info!(queue = %endpoint.queue, "queue did not exist, creating it");
                  backend.create(&transport, &endpoint).await?;
               }
               Ok(Arc::new(QueueClient {
                  endpoint,
                  transport,
                  backend,
                  released: AtomicBool::new(false),
               }))
            }
         }
      });

      Ok(Self { clients, transport })
   }

   /// Returns the client for `queue`, creating the queue if needed.
   ///
   /// Queue names are case-insensitive; the client always carries the
   /// lower-cased name. Invalid names are rejected before the cache is
   /// touched, so they never occupy a slot.
   pub async fn get(&self, queue: &str) -> Result<Arc<QueueClient<B>>, QueueError> {
      let queue = normalize_key(queue);
      validate_queue_name(&queue)?;
      Ok(self.clients.get(&queue).await?)
   }

   /// Like [`QueueClients::get`], but stops waiting once `cancel` fires.
   pub async fn get_with_cancellation(
      &self,
      queue: &str,
      cancel: &CancellationToken,
   ) -> Result<Arc<QueueClient<B>>, QueueError> {
      let queue = normalize_key(queue);
      validate_queue_name(&queue)?;
      Ok(self.clients.get_with_cancellation(&queue, cancel).await?)
   }

   /// Drops and releases the cached client for `queue`.
   pub fn remove(&self, queue: &str) -> bool {
      self.clients.remove(queue)
   }

   /// Drops and releases the cached client for `queue`, asynchronously.
   pub async fn remove_async(&self, queue: &str) -> bool {
      self.clients.remove_async(queue).await
   }

   /// Number of cached queue clients.
   pub fn len(&self) -> usize {
      self.clients.len()
   }

   pub fn is_empty(&self) -> bool {
      self.clients.is_empty()
   }

   /// Releases every client, then the transport. Idempotent.
   pub fn dispose(&self) {
      self.clients.dispose();
      self.transport.dispose();
   }

   /// Releases every client, then the transport, asynchronously. Idempotent.
   pub async fn dispose_async(&self) {
      self.clients.dispose_async().await;
      self.transport.dispose_async().await;
   }
}

impl<B: QueueBackend> fmt::Debug for QueueClients<B> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("QueueClients")
         .field("clients", &self.clients)
         .field("transport", &self.transport)
         .finish()
   }
}
