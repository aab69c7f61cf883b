//! # wsusctl executor
//!
//! Everything that stands between a caller and the WSUS scripts:
//!
//! ```text
//! caller
//!   ├── RetryExecutor ── CircuitRegistry (per operation name)
//!   │     └── exponential backoff + jitter, capped at 30s
//!   ├── BulkOperationCoordinator
//!   │     └── Semaphore(max parallelism) → one task per item → aggregate
//!   └── OperationExecutor (ScriptExecutor: shell + <name>.ps1)
//! ```

pub mod bulk;
pub mod circuit;
pub mod retry;
pub mod script;

pub use bulk::{BulkItemError, BulkOperationCoordinator, BulkOperationResult, BulkProgress, ProgressSink};
pub use circuit::{Admission, CircuitPermit, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use retry::{RetryExecutor, RetryPolicy};
pub use script::ScriptExecutor;
