//! The event bus: lifecycle, publish routing, and the subscription API.

use std::sync::Arc;

use redis::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::codec::{self, DeliveryMode, Envelope};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::maintenance::{MaintenanceHandle, MaintenanceWorker};
use crate::reader::{ReaderHandle, StreamReader};
use crate::store::StreamStore;
use crate::subscription::{EventHandler, SubscriberTable};
use crate::topology::{StreamKind, StreamLayout};

/// EXPIRE applied to each stream during `init`; maintenance renews it with
/// the configured TTL afterwards.
const INITIAL_STREAM_TTL_SECS: i64 = 60;

/// Options controlling how a single emit is routed.
///
/// A set `target` forces unicast regardless of `mode`; otherwise `mode`
/// defaults to broadcast.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub mode: Option<DeliveryMode>,
    pub target: Option<String>,
}

impl EmitOptions {
    /// Deliver to every live instance.
    pub fn broadcast() -> Self {
        Self {
            mode: Some(DeliveryMode::Broadcast),
            target: None,
        }
    }

    /// Deliver to exactly one arbitrary live instance.
    pub fn anycast() -> Self {
        Self {
            mode: Some(DeliveryMode::Anycast),
            target: None,
        }
    }

    /// Deliver to the instance with the given id.
    pub fn unicast(target: impl Into<String>) -> Self {
        Self {
            mode: Some(DeliveryMode::Unicast),
            target: Some(target.into()),
        }
    }
}

enum State {
    Idle,
    Running {
        store: StreamStore,
        readers: Vec<ReaderHandle>,
        maintenance: MaintenanceHandle,
    },
    Closed,
}

/// One instance of the distributed event bus.
///
/// Instances sharing a bus `name` against the same store discover each other
/// implicitly through it; there is no registry and no heartbeat. Create with
/// [`EventBus::new`], connect with [`EventBus::init`], and shut down with
/// [`EventBus::close`].
pub struct EventBus {
    id: String,
    config: BusConfig,
    layout: StreamLayout,
    subscribers: Arc<SubscriberTable>,
    state: RwLock<State>,
}

impl EventBus {
    /// Create an instance with a fresh id. No connection is made until
    /// [`init`](EventBus::init).
    pub fn new(config: BusConfig) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        let layout = StreamLayout::new(&config.name, &id);
        Self {
            id,
            config,
            layout,
            subscribers: Arc::new(SubscriberTable::new()),
            state: RwLock::new(State::Idle),
        }
    }

    /// This instance's id: the basis for unicast addressing and the scope of
    /// its broadcast group.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Connect to the store, create the three consumer groups, set the
    /// initial stream TTLs, and start the reader loops and the maintenance
    /// worker. Resolves once every loop is running. Fails if the store is
    /// unreachable.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.write().await;
        match &*state {
            State::Idle => {}
            State::Running { .. } => return Err(BusError::AlreadyInitialized),
            State::Closed => return Err(BusError::Closed),
        }

        let client = Client::open(self.config.url.as_str())
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let store = StreamStore::connect(&client).await?;
        info!(
            id = %self.id,
            name = %self.config.name,
            role = ?self.config.role,
            "Connected to event bus store"
        );

        let start_id = self.config.group_start_id();
        for kind in StreamKind::ALL {
            let stream = self.layout.stream(kind);
            let group = self.layout.group(kind);
            store.create_group(&stream, &group, start_id).await?;
            store.expire(&stream, INITIAL_STREAM_TTL_SECS).await?;
        }

        let mut readers = Vec::new();
        if self.config.role.consumes() {
            for kind in StreamKind::ALL {
                match StreamReader::spawn(
                    &client,
                    &self.layout,
                    kind,
                    Arc::clone(&self.subscribers),
                    self.config.debug,
                )
                .await
                {
                    Ok(handle) => readers.push(handle),
                    Err(e) => {
                        for reader in readers {
                            reader.stop().await;
                        }
                        return Err(e);
                    }
                }
            }
        }

        let maintenance = MaintenanceWorker::spawn(
            store.clone(),
            self.layout.clone(),
            self.config.effective_stream_ttl_secs(),
            self.config.max_message_count,
        );

        *state = State::Running {
            store,
            readers,
            maintenance,
        };
        Ok(())
    }

    /// Publish an event. Returns the store-assigned record id.
    ///
    /// Routing is a pure function of the options: a `target` goes to that
    /// instance's inbox as unicast; otherwise the mode picks the broadcast or
    /// anycast stream. Emitting to one's own id is legal; the record
    /// round-trips through the store. There is no delivery confirmation.
    pub async fn emit<T: Serialize>(
        &self,
        event: &str,
        data: &T,
        options: EmitOptions,
    ) -> Result<String> {
        let store = {
            let state = self.state.read().await;
            match &*state {
                State::Running { store, .. } => store.clone(),
                State::Idle => return Err(BusError::NotInitialized),
                State::Closed => return Err(BusError::Closed),
            }
        };

        let (mode, stream) = route(&self.layout, &options)?;
        let envelope = Envelope {
            mode,
            target: options.target,
            event: event.to_string(),
            data: rmpv::ext::to_value(data)?,
            timestamp: codec::now_ms(),
            source: self.id.clone(),
        };

        let payload = codec::encode(&envelope)?;
        let record_id = store.append(&stream, &payload).await?;

        if self.config.debug {
            debug!(
                event = %event,
                mode = ?mode,
                stream = %stream,
                record_id = %record_id,
                "Emitted record"
            );
        }
        Ok(record_id)
    }

    /// Subscribe a handler to a topic. Re-adding the same handler has no
    /// effect.
    pub async fn on(&self, event: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.ensure_open().await?;
        self.subscribers.add(event, handler).await;
        Ok(())
    }

    /// Remove a handler from a topic; unknown handlers are a no-op.
    pub async fn off(&self, event: &str, handler: &Arc<dyn EventHandler>) -> Result<()> {
        self.ensure_open().await?;
        self.subscribers.remove(event, handler).await;
        Ok(())
    }

    /// Subscribe a handler that fires at most once and then removes itself,
    /// even if it fails. Returns the registered wrapper, which [`off`]
    /// accepts for early removal.
    ///
    /// [`off`]: EventBus::off
    pub async fn once(
        &self,
        event: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Arc<dyn EventHandler>> {
        self.ensure_open().await?;
        Ok(SubscriberTable::add_once(&self.subscribers, event, handler).await)
    }

    /// Number of handlers currently subscribed to a topic.
    pub async fn subscription_count(&self, event: &str) -> usize {
        self.subscribers.handler_count(event).await
    }

    /// Stop the maintenance worker, stop every reader and await its loop,
    /// and drop the store connections. Further operations fail with
    /// [`BusError::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let previous = std::mem::replace(&mut *state, State::Closed);

        if let State::Running {
            store,
            readers,
            maintenance,
        } = previous
        {
            maintenance.stop().await;
            for reader in readers {
                reader.stop().await;
            }
            drop(store);
            info!(id = %self.id, "Event bus closed");
        }
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        if matches!(*self.state.read().await, State::Closed) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

/// Resolve emit options into the delivery mode and target stream key.
fn route(layout: &StreamLayout, options: &EmitOptions) -> Result<(DeliveryMode, String)> {
    if let Some(target) = &options.target {
        return Ok((DeliveryMode::Unicast, layout.unicast_stream_for(target)));
    }
    match options.mode.unwrap_or(DeliveryMode::Broadcast) {
        DeliveryMode::Broadcast => Ok((DeliveryMode::Broadcast, layout.broadcast_stream())),
        DeliveryMode::Anycast => Ok((DeliveryMode::Anycast, layout.anycast_stream())),
        DeliveryMode::Unicast => Err(BusError::MissingTarget),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::handler_fn;

    fn layout() -> StreamLayout {
        StreamLayout::new("t", "self01")
    }

    #[test]
    fn test_route_defaults_to_broadcast() {
        let (mode, stream) = route(&layout(), &EmitOptions::default()).unwrap();
        assert_eq!(mode, DeliveryMode::Broadcast);
        assert_eq!(stream, "eventbus:t:broadcast");
    }

    #[test]
    fn test_route_anycast() {
        let (mode, stream) = route(&layout(), &EmitOptions::anycast()).unwrap();
        assert_eq!(mode, DeliveryMode::Anycast);
        assert_eq!(stream, "eventbus:t:anycast");
    }

    #[test]
    fn test_route_target_forces_unicast() {
        let options = EmitOptions {
            mode: Some(DeliveryMode::Anycast),
            target: Some("peer99".to_string()),
        };
        let (mode, stream) = route(&layout(), &options).unwrap();
        assert_eq!(mode, DeliveryMode::Unicast);
        assert_eq!(stream, "eventbus:t:unicast:peer99");
    }

    #[test]
    fn test_route_unicast_without_target_is_an_error() {
        let options = EmitOptions {
            mode: Some(DeliveryMode::Unicast),
            target: None,
        };
        assert!(matches!(
            route(&layout(), &options),
            Err(BusError::MissingTarget)
        ));
    }

    #[test]
    fn test_instance_id_is_dashless() {
        let bus = EventBus::new(BusConfig::default());
        assert_eq!(bus.id().len(), 32);
        assert!(!bus.id().contains('-'));
        assert!(bus.id().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = EventBus::new(BusConfig::default());
        let b = EventBus::new(BusConfig::default());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_emit_before_init_is_rejected() {
        let bus = EventBus::new(BusConfig::default());
        let result = bus
            .emit("e", &serde_json::json!({"v": 1}), EmitOptions::default())
            .await;
        assert!(matches!(result, Err(BusError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_closed_bus_refuses_operations() {
        let bus = EventBus::new(BusConfig::default());
        bus.close().await.unwrap();

        let emit = bus
            .emit("e", &serde_json::json!({"v": 1}), EmitOptions::default())
            .await;
        assert!(matches!(emit, Err(BusError::Closed)));

        let handler = handler_fn(|_| async { Ok(()) });
        assert!(matches!(bus.on("e", handler).await, Err(BusError::Closed)));
        assert!(matches!(bus.init().await, Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn test_subscriptions_are_legal_before_init() {
        let bus = EventBus::new(BusConfig::default());
        let handler = handler_fn(|_| async { Ok(()) });
        bus.on("e", Arc::clone(&handler)).await.unwrap();
        assert_eq!(bus.subscription_count("e").await, 1);

        bus.off("e", &handler).await.unwrap();
        assert_eq!(bus.subscription_count("e").await, 0);
    }
}
