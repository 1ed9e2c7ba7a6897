//! fleetctl-core: the Miner Supervisor, Stats Aggregator, Profile Manager,
//! Event Hub, and Session bookkeeping that make up the local fleet
//! controller's domain logic. Transport-agnostic — `crates/server` and
//! `crates/p2p` are both thin clients of the types exported here.

pub mod error;
pub mod event_hub;
pub mod instance;
pub mod profile;
pub mod session;
pub mod stats;
pub mod supervisor;

pub use error::{CoreError, Result};
pub use event_hub::{Event, EventHub};
pub use instance::{HashratePoint, InstanceState, MinerInstance};
pub use profile::{Profile, ProfileManager};
pub use session::SessionTracker;
pub use stats::StatsAggregator;
pub use supervisor::{BackendInfo, MinerSummary, Supervisor};
