//! Operation executor trait: the boundary to the scripts that mutate WSUS.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{OperationOutput, OperationParams};

/// Runs a named server-side operation.
///
/// Implementations must fail with a classified [`crate::WsusError`]
/// (see [`crate::WsusError::kind`]) so the retry layer can decide whether
/// another attempt makes sense, and must return `WsusError::Cancelled` once
/// `cancel` fires.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn run(
        &self,
        name: &str,
        params: &OperationParams,
        cancel: &CancellationToken,
    ) -> Result<OperationOutput>;
}
