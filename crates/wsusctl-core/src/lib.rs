//! # wsusctl core
//!
//! Shared building blocks for the WSUS administration console:
//! configuration, the error taxonomy every crate speaks, the domain types
//! passed across crate boundaries, and the `OperationExecutor` trait that
//! stands in for the out-of-process scripts performing WSUS mutations.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::WsusConfig;
pub use error::{ErrorKind, Result, WsusError};
pub use traits::executor::OperationExecutor;
pub use types::{InstallationCounts, OperationOutput, OperationParams, UpdateInfo, UpdateSortField};
