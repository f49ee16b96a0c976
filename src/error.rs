//! Typed errors for the orchestration core.
//!
//! Leaf operations return one of these kinds. Composite operations wrap them
//! with [`Error::context`], which keeps the original kind reachable through
//! [`Error::kind`] so callers can still pattern-match.

use std::fmt;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the backend layer, Incus client, sandbox manager,
/// state tracker and mount guard.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Container, snapshot, image alias, remote or file does not exist.
    #[error("{what} not found: {name}")]
    NotFound { what: &'static str, name: String },

    /// Name reuse on create.
    #[error("{what} already exists: {name}")]
    AlreadyExists { what: &'static str, name: String },

    /// Requested transition is incompatible with the observed status.
    #[error("container '{name}' is {state}; cannot {action}")]
    InvalidState {
        name: String,
        state: String,
        action: &'static str,
    },

    #[error("invalid {what} name '{name}': {reason}")]
    InvalidName {
        what: &'static str,
        name: String,
        reason: String,
    },

    /// Mount source matches the guard. The reason is user-facing.
    #[error("refusing to mount {path}: {reason}")]
    Seatbelted { path: String, reason: String },

    #[error("authorization failed: too many incorrect codes")]
    AuthFailed,

    #[error("authorization timed out")]
    AuthExpired,

    /// The user declined a prompt, or auto-start is disabled. The message is
    /// printed verbatim by the CLI.
    #[error("{0}")]
    UserCancel(String),

    #[error("no VM backend available: {0}")]
    NoBackendAvailable(String),

    #[error("VM '{name}' is not running (state: {state})")]
    VmNotRunning { name: String, state: String },

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    /// Connection or I/O failure against Incus or the VM daemon.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed response, or an `error:` reply from the control protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Conditional update rejected because the ETag no longer matches.
    #[error("{what} changed concurrently: {name}")]
    PreconditionFailed { what: &'static str, name: String },

    #[error("{0} is not supported by this backend")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

/// Discriminant of [`Error`], stable across context wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    InvalidName,
    Seatbelted,
    AuthFailed,
    AuthExpired,
    UserCancel,
    NoBackendAvailable,
    VmNotRunning,
    Timeout,
    Transport,
    Protocol,
    PreconditionFailed,
    Unsupported,
    Io,
    Json,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Error {
    pub fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub fn invalid_name(what: &'static str, name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidName {
            what,
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Wrap with a message while preserving the underlying kind.
    pub fn context(self, message: impl Into<String>) -> Self {
        Error::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::InvalidName { .. } => ErrorKind::InvalidName,
            Error::Seatbelted { .. } => ErrorKind::Seatbelted,
            Error::AuthFailed => ErrorKind::AuthFailed,
            Error::AuthExpired => ErrorKind::AuthExpired,
            Error::UserCancel(_) => ErrorKind::UserCancel,
            Error::NoBackendAvailable(_) => ErrorKind::NoBackendAvailable,
            Error::VmNotRunning { .. } => ErrorKind::VmNotRunning,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Io(_) => ErrorKind::Io,
            Error::Json(_) => ErrorKind::Json,
            Error::Context { source, .. } => source.kind(),
        }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// Message of a `UserCancel`, looking through context wrappers.
    pub fn user_cancel_message(&self) -> Option<&str> {
        match self {
            Error::UserCancel(msg) => Some(msg),
            Error::Context { source, .. } => source.user_cancel_message(),
            _ => None,
        }
    }
}

/// Attach context to a core `Result` without losing the error kind.
pub trait ResultExt<T> {
    fn ctx(self, message: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn ctx(self, message: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| e.context(message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_preserves_kind() {
        let err = Error::not_found("container", "c1")
            .context("failed to start")
            .context("create aborted");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().starts_with("create aborted: failed to start"));
    }

    #[test]
    fn user_cancel_message_through_context() {
        let err = Error::UserCancel("VM not started".into()).context("ensure running");
        assert_eq!(err.user_cancel_message(), Some("VM not started"));
        assert!(Error::AuthFailed.user_cancel_message().is_none());
    }

    #[test]
    fn invalid_state_quotes_current_status() {
        let err = Error::InvalidState {
            name: "c1".into(),
            state: "Stopped".into(),
            action: "freeze",
        };
        assert_eq!(err.to_string(), "container 'c1' is Stopped; cannot freeze");
    }

    #[test]
    fn ctx_on_result() {
        let r: Result<()> = Err(Error::Timeout {
            what: "cloud-init".into(),
            secs: 600,
        });
        let err = r.ctx(|| "readiness".to_string()).unwrap_err();
        assert!(err.is(ErrorKind::Timeout));
    }
}
