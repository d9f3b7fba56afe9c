//! In-memory roster registry.
//!
//! Multi-sourced holders reconcile every contributor's copy of an id, the
//! registry store routes writes to them and fans changes out through shared
//! interest indexes, and the preservable wrapper defers and rate-limits
//! removals of lapsed copies.

pub mod config;
pub mod error;
pub mod eviction;
pub mod holder;
pub mod index;
pub mod preservable;
pub mod registry;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use eviction::{EvictionItem, EvictionQueue, EvictionStrategy, PercentageDropStrategy};
pub use holder::{InstanceHolder, Removal};
pub use index::{InterestStream, SUBSCRIBER_BACKLOG};
pub use preservable::PreservableRegistry;
pub use registry::{CopyFate, CopyRemoval, Registry, SnapshotStream, SourcedRegistry};
