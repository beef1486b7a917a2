//! Cluster monitoring: per-server records, probes, the monitor loop, and
//! the election/failover machinery.

pub mod election;
pub mod failover;
pub mod monitor;
pub mod probe;
pub mod server;

pub use monitor::TopologyMonitor;
pub use probe::ProbeError;
pub use server::{RefreshError, RefreshSnapshot, ServerMonitor, ServerState};
