//! Muster tracks a fleet of locally-running agent processes: which exist,
//! which are reachable, which have gone silent, and which project each one
//! is working on.
//!
//! Three layers:
//! - [`registry`] — the persisted source of truth: a file-locked JSON
//!   snapshot of instance records, a capped lifecycle-event log, and the
//!   gateway ownership record. Agent processes write it directly.
//! - [`monitor`] and [`reaper`] — background loops that probe liveness and
//!   prune long-dead records.
//! - [`gateway`] — the singleton aggregation point: one HTTP API over the
//!   whole fleet, with pass-through calls into individual instances via
//!   [`proxy`].

pub mod config;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod proxy;
pub mod reaper;
pub mod registry;

pub use config::Config;
pub use error::{GatewayError, ProxyError, RegistryError};
pub use gateway::{Gateway, RunningGateway, Startup};
pub use monitor::HealthMonitor;
pub use proxy::AggregatorProxy;
pub use reaper::ZombieReaper;
pub use registry::{
    InstanceRecord, InstanceState, LifecycleEvent, LifecycleEventKind, RegistryStore,
};
