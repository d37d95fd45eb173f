//
// cancel.rs
//
// Copyright (C) 2025 Posit Software, PBC. All rights reserved.
//
//

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Shared cancellation flag for a document's in-flight operations.
///
/// The source side lives with the controller (and with every
/// `DocumentHandle` clone) so an interrupt can be signalled from another
/// thread without queueing behind pending operations. Tokens derived from
/// the source are threaded through multi-step operations and through every
/// blocking prover call; transports poll them while waiting on the wire.
#[derive(Clone)]
pub struct CancelSource {
    cancelled: Arc<AtomicBool>,
}

#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelSource {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Rearm the source after a consumed interrupt so the next operation
    /// starts fresh.
    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            cancelled: self.cancelled.clone(),
            deadline: None,
        }
    }

    /// Timeouts are modelled as a cancellation source with a deadline.
    pub fn token_with_timeout(&self, timeout: Duration) -> CancelToken {
        CancelToken {
            cancelled: self.cancelled.clone(),
            deadline: Some(Instant::now() + timeout),
        }
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// A token that never fires, for single-shot operations that have no
    /// cancellation surface of their own.
    pub fn none() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_propagates_to_tokens() {
        let source = CancelSource::new();
        let token = source.token();

        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());

        source.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_deadline_fires_without_cancel() {
        let source = CancelSource::new();
        let token = source.token_with_timeout(Duration::from_millis(0));
        assert!(token.is_cancelled());

        let token = source.token_with_timeout(Duration::from_secs(3600));
        assert!(!token.is_cancelled());
    }
}
