//! Error types for the script runtime.
//!
//! Two layers are kept apart on purpose:
//!
//! - [`ScriptError`] is the control-flow raise used while script code runs.
//!   A deliberate `process.exit()` and a thrown script value travel the same
//!   propagation path but mean very different things, so they are variants of
//!   one enum rather than separate channels.
//! - [`RuntimeError`] is terminal: whatever reaches the top of the loop with
//!   this type ends the script and is carried inside the returned status.
//!
//! Errors are explicit and typed; no stringly-typed errors on the core paths.

use crate::value::ScriptValue;
use std::fmt;
use std::io;

/// A normalized script-level exception.
///
/// Carries either the thrown script value (when the interpreter surfaced one)
/// or just a diagnostic message. The fatal handler receives this form.
#[derive(Debug, Clone)]
pub struct JsError {
    /// The thrown value, when the raise carried one.
    pub value: Option<ScriptValue>,
    /// Human-readable diagnostic.
    pub message: String,
}

impl JsError {
    /// Creates an error from a diagnostic message only.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            value: None,
            message: message.into(),
        }
    }

    /// Creates an error carrying a thrown script value.
    #[must_use]
    pub fn thrown(value: ScriptValue, message: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            message: message.into(),
        }
    }
}

impl fmt::Display for JsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JsError {}

/// A raise propagating out of script code.
#[derive(Debug)]
pub enum ScriptError {
    /// Deliberate exit sentinel (`process.exit(code)`). Always propagates;
    /// the code becomes the loop's return.
    Exit(i32),
    /// Any other uncaught script exception.
    Js(JsError),
}

impl ScriptError {
    /// Shorthand for a thrown exception with a message only.
    #[must_use]
    pub fn js(message: impl Into<String>) -> Self {
        Self::Js(JsError::msg(message))
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exit(code) => write!(f, "script exit with code {code}"),
            Self::Js(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ScriptError {}

/// The kind of terminal runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    /// Uncaught script exception the fatal handler rejected.
    Script,
    /// Selector or stream failure on the loop thread.
    Io,
    /// Unrecognized VM flag before event processing began.
    Config,
    /// Unreachable state; a bug in the runtime or a collaborator.
    Internal,
}

impl RuntimeErrorKind {
    /// Static description of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Script => "uncaught script exception",
            Self::Io => "I/O error",
            Self::Config => "configuration error",
            Self::Internal => "internal invariant violated",
        }
    }
}

/// Terminal error carried by a failed [`ScriptStatus`](crate::status::ScriptStatus).
#[derive(Debug)]
pub struct RuntimeError {
    kind: RuntimeErrorKind,
    message: String,
    script: Option<JsError>,
}

impl RuntimeError {
    /// Creates an error with the given kind and message.
    #[must_use]
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            script: None,
        }
    }

    /// Wraps a rejected script exception.
    #[must_use]
    pub fn script(error: JsError) -> Self {
        Self {
            kind: RuntimeErrorKind::Script,
            message: error.message.clone(),
            script: Some(error),
        }
    }

    /// Creates an internal invariant error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::Internal, message)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> RuntimeErrorKind {
        self.kind
    }

    /// Returns the underlying script exception, if this is a script error.
    #[must_use]
    pub const fn script_error(&self) -> Option<&JsError> {
        self.script.as_ref()
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RuntimeError {}

impl From<io::Error> for RuntimeError {
    fn from(e: io::Error) -> Self {
        Self::new(RuntimeErrorKind::Io, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_formats_with_code() {
        let e = ScriptError::Exit(7);
        assert_eq!(e.to_string(), "script exit with code 7");
    }

    #[test]
    fn runtime_error_keeps_script_cause() {
        let js = JsError::msg("boom");
        let e = RuntimeError::script(js);
        assert_eq!(e.kind(), RuntimeErrorKind::Script);
        assert_eq!(e.script_error().unwrap().message, "boom");
        assert_eq!(e.to_string(), "uncaught script exception: boom");
    }

    #[test]
    fn io_error_converts() {
        let e: RuntimeError = io::Error::other("selector closed").into();
        assert_eq!(e.kind(), RuntimeErrorKind::Io);
    }
}
