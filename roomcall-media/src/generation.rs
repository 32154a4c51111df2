//! Generation counter used to discard stale async continuations

use crate::error::{Result, SessionError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Shared counter, bumped once per teardown
#[derive(Debug, Clone, Default)]
pub struct Generation(Arc<AtomicU64>);

impl Generation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Invalidate every outstanding token. Returns the new value.
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Snapshot of the current generation
    #[must_use]
    pub fn token(&self) -> GenerationToken {
        GenerationToken {
            source: self.clone(),
            value: self.current(),
        }
    }
}

/// A generation captured before an await point
#[derive(Debug, Clone)]
pub struct GenerationToken {
    source: Generation,
    value: u64,
}

impl GenerationToken {
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.source.current() == self.value
    }

    /// `StaleEvent` if the generation moved on since the token was taken
    pub fn check(&self, what: &str) -> Result<()> {
        if self.is_current() {
            Ok(())
        } else {
            Err(SessionError::StaleEvent(format!(
                "{what} from generation {} completed after teardown",
                self.value
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_invalidates_tokens() {
        let generation = Generation::new();
        let token = generation.token();
        assert!(token.is_current());
        assert!(token.check("consume").is_ok());

        assert_eq!(generation.bump(), 1);
        assert!(!token.is_current());
        assert!(matches!(
            token.check("consume"),
            Err(SessionError::StaleEvent(_))
        ));
        assert!(generation.token().is_current());
    }
}
