//! trailsync-core library.
//!
//! Mission state synchronization for field-tracking clients: a retention
//! bounded [`trace::TraceStore`], an [`queue::OfflineQueue`] that replays
//! POI/zone mutations after connectivity gaps, the [`resync`] snapshot
//! protocol, and the [`router`] that fans realtime events into local state.
//! [`engine::SyncEngine`] owns all of it for one mission subscription.
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums per module, each mapped to an
//!   [`error::ErrorCode`]. `anyhow::Result` only at the config edge.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `error!`, `debug!`, `trace!`).

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod resync;
pub mod router;
pub mod store;
pub mod trace;

pub use engine::{Session, SyncEngine};
