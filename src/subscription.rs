//! Topic subscriptions and handler dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::error;

use crate::codec::Envelope;
use crate::error::BusError;

/// Handler for envelopes delivered on a subscribed topic.
pub trait EventHandler: Send + Sync {
    /// Process one delivered envelope.
    fn handle(&self, envelope: Arc<Envelope>)
        -> BoxFuture<'static, std::result::Result<(), BusError>>;
}

struct FnHandler<F>(F);

impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<(), BusError>> + Send + 'static,
{
    fn handle(
        &self,
        envelope: Arc<Envelope>,
    ) -> BoxFuture<'static, std::result::Result<(), BusError>> {
        Box::pin((self.0)(envelope))
    }
}

/// Lift an async closure into a registrable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Arc<Envelope>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), BusError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Registration identity: the allocation behind the Arc, vtable ignored.
fn same_handler(a: &Arc<dyn EventHandler>, b: &Arc<dyn EventHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// In-memory mapping from topic to its handler set.
///
/// Mutated from the API side and read from dispatch; dispatch clones the
/// handler list under the lock and releases it before any handler runs, so
/// handlers may freely re-enter `add`/`remove`.
#[derive(Default)]
pub struct SubscriberTable {
    topics: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl SubscriberTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler to a topic. Re-adding the same handler has no effect.
    pub async fn add(&self, topic: &str, handler: Arc<dyn EventHandler>) {
        let mut topics = self.topics.write().await;
        let handlers = topics.entry(topic.to_string()).or_default();
        if !handlers.iter().any(|h| same_handler(h, &handler)) {
            handlers.push(handler);
        }
    }

    /// Remove a handler; unknown handlers are a no-op. An emptied topic is
    /// dropped from the table entirely.
    pub async fn remove(&self, topic: &str, handler: &Arc<dyn EventHandler>) {
        let mut topics = self.topics.write().await;
        if let Some(handlers) = topics.get_mut(topic) {
            handlers.retain(|h| !same_handler(h, handler));
            if handlers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Register a handler that removes itself after its first invocation,
    /// even if it fails. Returns the wrapper actually registered, should the
    /// caller want to remove it early.
    pub async fn add_once(
        table: &Arc<SubscriberTable>,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Arc<dyn EventHandler> {
        let wrapper: Arc<dyn EventHandler> =
            OnceHandler::wrap(topic, handler, Arc::downgrade(table));
        table.add(topic, Arc::clone(&wrapper)).await;
        wrapper
    }

    /// Number of handlers currently registered for a topic.
    pub async fn handler_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Number of topics with at least one handler.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Invoke every handler for the envelope's topic, sequentially, awaiting
    /// each. Failures are logged and do not stop later handlers. Returns
    /// `true` if all handlers succeeded.
    pub async fn dispatch(&self, envelope: Arc<Envelope>) -> bool {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let topics = self.topics.read().await;
            topics.get(&envelope.event).cloned().unwrap_or_default()
        };

        let mut all_succeeded = true;
        for handler in handlers {
            if let Err(e) = handler.handle(Arc::clone(&envelope)).await {
                error!(event = %envelope.event, error = %e, "Handler failed");
                all_succeeded = false;
            }
        }
        all_succeeded
    }
}

/// Wrapper that fires its inner handler once, then deregisters itself.
struct OnceHandler {
    topic: String,
    inner: Arc<dyn EventHandler>,
    table: Weak<SubscriberTable>,
    fired: AtomicBool,
    this: Weak<OnceHandler>,
}

impl OnceHandler {
    fn wrap(topic: &str, inner: Arc<dyn EventHandler>, table: Weak<SubscriberTable>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            topic: topic.to_string(),
            inner,
            table,
            fired: AtomicBool::new(false),
            this: this.clone(),
        })
    }
}

impl EventHandler for OnceHandler {
    fn handle(
        &self,
        envelope: Arc<Envelope>,
    ) -> BoxFuture<'static, std::result::Result<(), BusError>> {
        if self.fired.swap(true, Ordering::SeqCst) {
            return Box::pin(async { Ok(()) });
        }

        let inner = Arc::clone(&self.inner);
        let table = self.table.clone();
        let this = self.this.clone();
        let topic = self.topic.clone();

        Box::pin(async move {
            let result = inner.handle(envelope).await;
            if let (Some(table), Some(this)) = (table.upgrade(), this.upgrade()) {
                let this: Arc<dyn EventHandler> = this;
                table.remove(&topic, &this).await;
            }
            result
        })
    }
}
