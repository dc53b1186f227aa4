//! Tributary - distributed event bus over Redis Streams
//!
//! Any instance can publish events under string topics and subscribe to
//! topics. Three delivery disciplines are available per message:
//!
//! - **broadcast**: every live instance delivers once
//! - **unicast**: exactly one named target instance delivers
//! - **anycast**: exactly one arbitrary live subscribed instance delivers
//!
//! Instances discover each other implicitly through the shared store: no
//! registry, no heartbeats, no leader. Three streams carry a bus: a shared
//! anycast work queue (one consumer group for everyone), a shared broadcast
//! stream (one group per instance), and a per-instance unicast inbox whose
//! continued existence doubles as the owner's liveness witness. Background
//! maintenance trims streams, renews TTLs, and garbage-collects the state of
//! crashed instances without losing in-flight messages.
//!
//! ```ignore
//! let bus = EventBus::new(BusConfig::new("redis://localhost:6379"));
//! bus.init().await?;
//!
//! bus.on("greetings", handler_fn(|envelope| async move {
//!     println!("{} says hi", envelope.source);
//!     Ok(())
//! })).await?;
//!
//! bus.emit("greetings", &"hello", EmitOptions::broadcast()).await?;
//! bus.close().await?;
//! ```

pub mod bus;
pub mod codec;
pub mod config;
pub mod error;
mod maintenance;
mod reader;
pub mod store;
pub mod subscription;
pub mod topology;

pub use bus::{EmitOptions, EventBus};
pub use codec::{decode, encode, DeliveryMode, Envelope};
pub use config::{BusConfig, Role};
pub use error::{BusError, Result};
pub use subscription::{handler_fn, EventHandler, SubscriberTable};
pub use topology::{StreamKind, StreamLayout};
