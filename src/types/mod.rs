pub mod cluster;
pub mod health;
pub mod service;

// Re-export cluster types
pub use cluster::*;
// Re-export health types
pub use health::*;
// Re-export service types
pub use service::*;
