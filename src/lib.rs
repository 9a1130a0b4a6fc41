pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod command;
pub mod config;
pub mod control_plane;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod logging;
pub mod monitor;
pub mod periodic;
pub mod reconcile;
pub mod retry;
pub mod types;

// Re-export common types
pub use bootstrap::{BootstrapCoordinator, MembershipStore};
pub use config::Config;
pub use error::{ClusterError, Result};
pub use monitor::{HealthMonitor, HealthReport};
pub use reconcile::Reconciler;
pub use retry::RetryPolicy;
