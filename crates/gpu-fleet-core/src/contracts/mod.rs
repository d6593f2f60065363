//! Shared data model
//!
//! Types exchanged between detectors, the discovery engine, the health
//! aggregator and external consumers. Everything here is serde-serializable
//! and used verbatim on the wire by the API crate.

mod benchmark;
mod events;
mod health;
mod heartbeat;
mod resource;

pub use benchmark::*;
pub use events::*;
pub use health::*;
pub use heartbeat::*;
pub use resource::*;
