//! Transaction liveness token
//!
//! Every transaction owns one `ScopeToken`. Anything handed out by the
//! transaction (record cursors, index items, mapped regions) keeps a clone and
//! checks it before touching transaction-bound data. Closing is a one-way
//! transition performed with `Release`; checks use `Acquire`, so a reader on
//! another thread observes the close before the transaction's snapshot is
//! released.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared liveness flag of one transaction scope.
#[derive(Debug, Clone)]
pub struct ScopeToken {
    live: Arc<AtomicBool>,
}

impl ScopeToken {
    /// Create a live token
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// True until [`close`](Self::close) is called on any clone
    #[inline]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// End the scope. Idempotent, never reversed.
    pub fn close(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Fail with `StaleContext` once the scope has ended
    #[inline]
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(Error::StaleContext)
        }
    }

    /// True if both tokens observe the same scope
    pub fn same_scope(&self, other: &ScopeToken) -> bool {
        Arc::ptr_eq(&self.live, &other.live)
    }
}

impl Default for ScopeToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(ScopeToken: Send, Sync);

    #[test]
    fn test_close_is_visible_to_clones() {
        let token = ScopeToken::new();
        let clone = token.clone();
        assert!(clone.is_live());
        token.close();
        assert!(!clone.is_live());
        assert!(matches!(clone.ensure_live(), Err(Error::StaleContext)));
    }

    #[test]
    fn test_close_across_threads() {
        let token = ScopeToken::new();
        let observer = token.clone();
        std::thread::spawn(move || token.close()).join().unwrap();
        assert!(!observer.is_live());
    }

    #[test]
    fn test_same_scope() {
        let a = ScopeToken::new();
        let b = a.clone();
        let c = ScopeToken::new();
        assert!(a.same_scope(&b));
        assert!(!a.same_scope(&c));
    }
}
