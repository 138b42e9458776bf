//! Error surfaces for the ARC protocol engine.

use thiserror::Error;

/// The error kinds a Connection (or the daemon around it) can fail with.
///
/// Each variant corresponds to one broad category of failure rather than to
/// a specific underlying cause -- several I/O or parsing failures can all
/// map onto `ProtocolError`, for instance.
#[derive(Debug, Error)]
pub enum ArcError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not authorized to run {command} as {user}")]
    Authorization { user: String, command: String },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("failed to spawn command: {0}")]
    ChildSpawn(#[source] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ArcError {
    /// Whether this error is recoverable within the current session, i.e.
    /// whether the connection can stay open and return to `AUTHED` after an
    /// `ERR` is sent.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::Authorization { .. })
    }
}

/// A per-`Connection` latched error string.
///
/// `set_error` prepends onto any existing message so the first failure in a
/// chain of short-circuited operations stays visible at the front, and every
/// call also emits at the `ERR` facility so the log carries the failure at
/// the point it was latched rather than only at the top frame.
#[derive(Debug, Default)]
pub struct ErrorCarrier {
    message: Option<String>,
}

impl ErrorCarrier {
    #[must_use]
    pub const fn new() -> Self {
        Self { message: None }
    }

    /// Latches `msg`, prepending it onto any already-latched error, and
    /// returns `false` so callers can write `return carrier.set_error(...)`.
    pub fn set_error(&mut self, msg: impl Into<String>) -> bool {
        let msg = msg.into();
        self.message = Some(match self.message.take() {
            Some(existing) => format!("{msg}: {existing}"),
            None => msg,
        });
        crate::log::emit(crate::log::Facility::ERR, &[self.message.as_deref().unwrap_or("")]);
        false
    }

    /// The latched error string, or empty if none has been set.
    #[must_use]
    pub fn is_error(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }

    /// Clears the latch at the start of a new logical operation.
    pub fn clear(&mut self) {
        self.message = None;
    }
}

pub type Result<T> = std::result::Result<T, ArcError>;
