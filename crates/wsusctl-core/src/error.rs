//! Error taxonomy shared by every wsusctl crate.
//!
//! Retry decisions are made from the error value itself: each variant maps
//! onto an [`ErrorKind`] and only `Transient` errors are eligible for
//! automatic retry and circuit-breaker accounting.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WsusError>;

/// Coarse classification used by the retry executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, temporary unavailability, in-progress conflicts.
    Transient,
    /// Authorization, validation, not-found, already-in-state and everything
    /// the retry layer itself produces.
    Terminal,
    /// The caller asked to stop.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum WsusError {
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Operation conflict: {0}")]
    Conflict(String),

    #[error("Access denied: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already in desired state: {0}")]
    AlreadyInState(String),

    #[error("Script failed (exit code {code}): {message}")]
    Script {
        code: i32,
        message: String,
        transient: bool,
    },

    #[error("Service currently unavailable for '{operation}', retry after {retry_after_secs}s")]
    CircuitOpen {
        operation: String,
        retry_after_secs: u64,
    },

    #[error("Retry limit exceeded for '{operation}' after {attempts} attempts: {source}")]
    RetryLimitExceeded {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<WsusError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Task runner error: {0}")]
    TaskRunner(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WsusError::Timeout(_) | WsusError::Unavailable(_) | WsusError::Conflict(_) => {
                ErrorKind::Transient
            }
            WsusError::Script { transient, .. } if *transient => ErrorKind::Transient,
            WsusError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Terminal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// True for the fail-fast error raised while a circuit is open, so status
    /// displays can show "retry after cooldown" instead of a plain failure.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, WsusError::CircuitOpen { .. })
    }
}

/// Map a failed script run onto the taxonomy.
///
/// Scripts report failures on stderr; the markers below are the phrases the
/// WSUS cmdlets and our script wrappers emit for each condition.
pub fn classify_script_failure(code: i32, stderr: &str) -> WsusError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("access is denied")
        || lower.contains("unauthorized")
        || lower.contains("unauthorizedaccess")
    {
        return WsusError::Unauthorized(message);
    }
    if lower.contains("not found") || lower.contains("does not exist") {
        return WsusError::NotFound(message);
    }
    if lower.contains("already approved")
        || lower.contains("already declined")
        || lower.contains("already a member")
    {
        return WsusError::AlreadyInState(message);
    }
    if lower.contains("invalid") || lower.contains("cannot bind parameter") {
        return WsusError::Validation(message);
    }
    if lower.contains("timed out") || lower.contains("timeout") {
        return WsusError::Timeout(message);
    }
    if lower.contains("already running") || lower.contains("in progress") {
        return WsusError::Conflict(message);
    }

    let transient = lower.contains("unavailable")
        || lower.contains("unable to connect")
        || lower.contains("connection");
    WsusError::Script {
        code,
        message,
        transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds() {
        assert!(WsusError::Timeout("x".into()).is_retryable());
        assert!(WsusError::Unavailable("x".into()).is_retryable());
        assert!(WsusError::Conflict("sync running".into()).is_retryable());
        assert!(!WsusError::Unauthorized("x".into()).is_retryable());
        assert!(!WsusError::NotFound("x".into()).is_retryable());
        assert!(WsusError::Cancelled.is_cancelled());
        assert!(!WsusError::Cancelled.is_retryable());
    }

    #[test]
    fn test_retry_limit_is_terminal_and_keeps_cause() {
        let err = WsusError::RetryLimitExceeded {
            operation: "Approve-WsusUpdate".into(),
            attempts: 4,
            source: Box::new(WsusError::Timeout("no reply".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Terminal);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Operation timed out: no reply"));
    }

    #[test]
    fn test_classify_script_failure() {
        assert!(matches!(
            classify_script_failure(1, "Access is denied."),
            WsusError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_script_failure(1, "Update 1234 was not found"),
            WsusError::NotFound(_)
        ));
        assert!(matches!(
            classify_script_failure(1, "A synchronization is already running"),
            WsusError::Conflict(_)
        ));
        assert!(classify_script_failure(2, "The WSUS service is unavailable").is_retryable());
        assert!(!classify_script_failure(2, "Something odd happened").is_retryable());
    }

    #[test]
    fn test_circuit_open_is_distinguishable() {
        let err = WsusError::CircuitOpen {
            operation: "Start-WsusSync".into(),
            retry_after_secs: 42,
        };
        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("retry after 42s"));
    }
}
