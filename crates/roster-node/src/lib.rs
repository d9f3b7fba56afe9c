//! Roster node services.
//!
//! Server-side handlers for client registration and interest channels, and
//! the replication sender, receiver and peer service that keep registry
//! nodes converged.

use std::sync::Arc;

use roster_registry::SourcedRegistry;

pub mod config;
pub mod connector;
pub mod error;
pub mod interest;
pub mod receiver;
pub mod registration;
pub mod sender;
pub mod service;

pub use config::ReplicationConfig;
pub use connector::{Connector, InMemoryNetwork, TcpConnector};
pub use error::{ReplicationError, ServiceError};
pub use interest::InterestServer;
pub use receiver::ReplicationServer;
pub use registration::RegistrationServer;
pub use sender::{ReplicationSender, SenderExit};
pub use service::{PeerEvent, ReplicationService, ServiceState};

/// Registry handle shared by every channel handler.
pub type SharedRegistry = Arc<dyn SourcedRegistry>;
