//! Per-peer, per-torrent streaming micropayment engine.
//!
//! Four cooperating subsystems, each usable independently:
//!
//! - [`batcher`]: adaptive event batching, keyed per (content hash, direction).
//! - [`channel`]: per-channel balance accounting and settlement lifecycle.
//! - [`composer`]: deterministic payment script construction.
//! - [`dispatcher`]: reliable multi-endpoint broadcast of settlement transactions.
//!
//! [`scheduler`] and [`collaborators`] define the seams these subsystems are
//! built against (timers, signing, chain height, audit storage) so that
//! production and test wiring can substitute real or virtual implementations
//! without touching core logic.

pub mod batcher;
pub mod bounded_cache;
pub mod channel;
pub mod collaborators;
pub mod composer;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod supervisor;

pub use batcher::EventBatcher;
pub use channel::ChannelManager;
pub use composer::ScriptComposer;
pub use dispatcher::BroadcastDispatcher;
pub use supervisor::Supervisor;
