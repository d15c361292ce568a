//! Infrastructure Adapters
//!
//! Adapter implementations for the domain ports, following the
//! Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │   ProviderNetwork │ KeyValueStore │ KeyResolver │ EventPublisher │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │   InMemoryProviderNetwork │ InMemoryStore │ InMemoryKeyResolver  │
//! │   TracingEventPublisher │ BroadcastEventPublisher │ Fanout       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod event_publisher;
mod memory_provider;
mod memory_store;

pub use event_publisher::{
    BroadcastEventPublisher, FanoutEventPublisher, InMemoryEventCollector, TracingEventPublisher,
};
pub use memory_provider::InMemoryProviderNetwork;
pub use memory_store::{InMemoryKeyResolver, InMemoryStore};
