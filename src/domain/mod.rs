//! Domain Layer
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for external dependencies
//! - **Events** (`events.rs`) - Domain events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use shardwarden::domain::ports::{ProviderNetwork, ProviderRequirements};
//!
//! async fn place<P: ProviderNetwork>(network: &P, shard: &Shard) -> Result<StoreReceipt> {
//!     let targets = network
//!         .find_candidate_providers(1, &ProviderRequirements::new())
//!         .await?;
//!     network.send_shard(&targets[0].id, shard).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::DomainEvent;
pub use ports::{
    EventPublisher, KeyResolver, KeyValueStore, ProviderInfo, ProviderNetwork, ProviderRequirements,
    StateStore, StoreReceipt,
};
