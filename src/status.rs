//! Terminal status of a script run.

use crate::error::RuntimeError;
use std::fmt;

/// What a script run ultimately produced.
///
/// Exactly one of three things comes back from [`run`](crate::runtime::ScriptRuntime::run):
/// a normal exit code, the cancellation sentinel, or a captured fatal error.
#[derive(Debug)]
pub enum ScriptStatus {
    /// The script ran to completion (or called `process.exit`).
    Exited(i32),
    /// The submission was cancelled before or during the run.
    Cancelled,
    /// The run ended with a fatal error.
    Failed(RuntimeError),
}

impl ScriptStatus {
    /// Successful completion with exit code zero.
    pub const OK: Self = Self::Exited(0);

    /// Returns the exit code: the script's code on exit, 0 on cancellation,
    /// -1 on failure (mirroring a crashed process).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Cancelled => 0,
            Self::Failed(_) => -1,
        }
    }

    /// True when the run completed normally with code zero.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// True when the submission was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns the captured fatal error, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&RuntimeError> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited({code})"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed(e) => write!(f, "failed({e})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JsError;

    #[test]
    fn exit_codes() {
        assert_eq!(ScriptStatus::OK.exit_code(), 0);
        assert_eq!(ScriptStatus::Exited(7).exit_code(), 7);
        assert_eq!(ScriptStatus::Cancelled.exit_code(), 0);
        assert_eq!(
            ScriptStatus::Failed(RuntimeError::script(JsError::msg("x"))).exit_code(),
            -1
        );
    }

    #[test]
    fn predicates() {
        assert!(ScriptStatus::OK.is_ok());
        assert!(!ScriptStatus::Exited(1).is_ok());
        assert!(ScriptStatus::Cancelled.is_cancelled());
        assert!(ScriptStatus::Failed(RuntimeError::internal("bad")).cause().is_some());
    }
}
