//! Core roster primitives shared across crates.
//!
//! Includes provenance (sources and origins), registration records, deltas,
//! interests, change notifications, and base errors.

pub mod delta;
pub mod error;
pub mod instance;
pub mod interest;
pub mod notification;
pub mod source;

pub use delta::{Delta, DeltaField, FieldName};
pub use error::DeltaError;
pub use instance::{InstanceInfo, ServicePort, Status};
pub use interest::{Interest, SourceMatcher};
pub use notification::{BufferState, Change, ChangeNotification};
pub use source::{Origin, Source};
