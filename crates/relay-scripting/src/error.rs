//! Error type crossing the thread boundary.
//!
//! Script-level failures are carried as an explicit value so they survive
//! the trip through the one-slot outcome channel: a kind, a message, and
//! the call frames accumulated while the error propagated. Host-level
//! plumbing failures use `anyhow` instead.

use thiserror::Error;

/// Classification of a script-visible failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller passed an argument of the wrong shape or type.
    BadArgument,
    /// A context lookup or switch failed.
    ContextResolution,
    /// A main-thread-only operation was invoked from a worker thread.
    WrongThread,
    /// A list row has no field by that name.
    UnknownField,
    /// The host knows no list by that name.
    UnknownListType,
    /// A list field carries a type code this layer cannot decode.
    UnsupportedFieldType,
    /// The runtime instance a handle referred to has been destroyed.
    RuntimeGone,
    /// A user-supplied callback raised.
    UserCallback,
    /// The host rejected a preference read or write.
    PreferenceStorage,
    /// The operation is not defined for the value it was applied to.
    UnsupportedOperation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::BadArgument => "bad argument",
            ErrorKind::ContextResolution => "context resolution failed",
            ErrorKind::WrongThread => "wrong thread",
            ErrorKind::UnknownField => "unknown field",
            ErrorKind::UnknownListType => "unknown list type",
            ErrorKind::UnsupportedFieldType => "unsupported field type",
            ErrorKind::RuntimeGone => "runtime gone",
            ErrorKind::UserCallback => "user callback raised",
            ErrorKind::PreferenceStorage => "preference storage failed",
            ErrorKind::UnsupportedOperation => "unsupported operation",
        };
        f.write_str(name)
    }
}

/// A script-visible error: what went wrong, where it was noticed, and the
/// frames it travelled through on the way back to the caller.
///
/// Frames are pushed outermost-last, so `frames[0]` is closest to the
/// point of failure.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub frames: Vec<String>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn bad_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadArgument, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedOperation, message)
    }

    pub fn runtime_gone() -> Self {
        Self::new(
            ErrorKind::RuntimeGone,
            "the runtime this handle belonged to has been unloaded",
        )
    }

    /// Record a frame on the propagation path.
    pub fn with_frame(mut self, frame: impl Into<String>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Multi-line rendering for printing into a chat buffer, one frame
    /// per line below the headline.
    pub fn render(&self) -> String {
        let mut out = format!("{self}");
        for frame in &self.frames {
            out.push_str("\n  in ");
            out.push_str(frame);
        }
        out
    }
}

/// Shorthand for fallible script-facing operations.
pub type ScriptResult<T> = Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = ScriptError::new(ErrorKind::UnknownListType, "no such list: bogus");
        assert_eq!(err.to_string(), "unknown list type: no such list: bogus");
    }

    #[test]
    fn frames_accumulate_innermost_first() {
        let err = ScriptError::bad_argument("expected string")
            .with_frame("callback on_msg")
            .with_frame("synchronous delegate wait");
        assert_eq!(err.frames, vec!["callback on_msg", "synchronous delegate wait"]);
    }

    #[test]
    fn render_lists_frames() {
        let err = ScriptError::new(ErrorKind::UserCallback, "boom").with_frame("timer callback");
        assert_eq!(err.render(), "user callback raised: boom\n  in timer callback");
    }
}
