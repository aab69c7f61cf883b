//! Boundary traits implemented outside the core.

pub mod executor;
