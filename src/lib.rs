pub mod allocator;
pub mod config;
pub mod error;
pub mod leasedb;
pub mod logging;
pub mod mgmt;
pub mod policy;
pub mod repository;
#[cfg(unix)]
pub mod signal;
pub mod v4;

pub use allocator::Allocator;
pub use config::Config;
pub use error::{AllocationFailure, ConfigError, RepositoryError};
pub use leasedb::{Binding, BindingKey, BindingState, LeaseDb};
