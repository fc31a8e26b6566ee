use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::RngCore;

use crate::error::{CaskError, Result};

/// Cooperative cancellation handle shared between an operation's initiator
/// and the storage layer. Cloning is cheap; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Return `Err(Cancelled)` when cancellation has been requested.
    ///
    /// Called at blob-store entry points, between retry attempts, and before
    /// commit points (e.g. the rename that publishes a blob).
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(CaskError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Logging parameters for a long-running operation: an operation name and a
/// random span id that ties its log lines together.
///
/// Deliberately separate from [`CancelToken`]: cancellation and log
/// decoration travel as two values, not one opaque context blob.
#[derive(Debug, Clone)]
pub struct TraceContext {
    operation: &'static str,
    span_id: String,
}

impl TraceContext {
    pub fn new(operation: &'static str) -> Self {
        let mut buf = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut buf);
        Self {
            operation,
            span_id: hex::encode(buf),
        }
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Open a tracing span carrying the operation name and span id.
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!("maintenance", op = self.operation, span = %self.span_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_propagates_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(CaskError::Cancelled)));
    }

    #[test]
    fn trace_span_ids_are_distinct() {
        let a = TraceContext::new("compact");
        let b = TraceContext::new("compact");
        assert_eq!(a.span_id().len(), 16);
        assert_ne!(a.span_id(), b.span_id());
    }
}
