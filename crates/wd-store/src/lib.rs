//! Repository ports for the WatchDog hub core, plus the bundled
//! snapshot-backed implementation.
//!
//! Everything that crosses the core boundary into storage goes through the
//! traits in [`ports`]; a SQL deployment would implement them against its
//! own schema. [`MemoryStore`] is the bundled implementation: in-memory
//! tables with JSON snapshots via `wd-persist`.

#![forbid(unsafe_code)]

pub mod memory;
pub mod ports;

pub use memory::MemoryStore;
pub use ports::{
    AgentRepo, ChannelRepo, HeartbeatStore, IncidentRepo, MonitorRepo, StoreError, UserRepo,
    WorkflowRepo,
};
