//! How an absent key, field or member is reported.

use crate::error::{KvError, Result};

/// Per-call choice between a zero value and [`KvError::NotFound`] for absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NilMode {
    /// Absence reads as the operation's zero value: `""`, `0.0` or `-1`.
    #[default]
    Default,
    /// Absence fails with `NotFound`.
    Strict,
}

impl NilMode {
    pub fn is_strict(self) -> bool {
        self == NilMode::Strict
    }

    /// Resolve an absent result to `zero`, or to `NotFound` in strict mode.
    pub fn absent<T>(self, zero: T) -> Result<T> {
        match self {
            NilMode::Default => Ok(zero),
            NilMode::Strict => Err(KvError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_yields_zero() {
        assert_eq!(NilMode::Default.absent(String::new()).unwrap(), "");
        assert_eq!(NilMode::Default.absent(-1i64).unwrap(), -1);
    }

    #[test]
    fn test_strict_yields_not_found() {
        assert!(matches!(
            NilMode::Strict.absent(0.0f64),
            Err(KvError::NotFound)
        ));
        assert!(NilMode::Strict.is_strict());
        assert!(!NilMode::default().is_strict());
    }
}
