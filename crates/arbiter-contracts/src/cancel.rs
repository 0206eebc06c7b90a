//! Cooperative cancellation for in-flight evaluations.
//!
//! The engine is synchronous and CPU-bound, so cancellation is a shared
//! atomic flag polled between rules and between scope levels. Cloning the
//! token shares the flag; any clone can cancel all of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation signal shared between the caller and the engine.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// True once `cancel` has been called on any clone of this token.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_canceled());

        token.cancel();
        assert!(observer.is_canceled());
    }
}
