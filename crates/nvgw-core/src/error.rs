//! Canonical error model for the gateway control plane.
//!
//! Every fallible operation in the workspace resolves to a [`GwError`]
//! carrying one of the canonical [`ErrorKind`]s. Handler-local validation
//! errors are returned directly; engine errors are wrapped with the engine
//! code and mapped to the closest kind; state-map CAS conflicts become
//! [`ErrorKind::Aborted`] after the retry budget is exhausted.

use std::fmt;

/// Canonical error kinds shared by the admin protocol, the service layer,
/// and the CLI.
///
/// The numeric values are the wire `status` codes; `0` is reserved for
/// success and never appears here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorKind {
    /// Input failed static validation.
    InvalidArgument = 1,
    /// Referenced entity does not exist.
    NotFound = 2,
    /// Entity with the same natural key already exists.
    AlreadyExists = 3,
    /// State precondition not met (e.g. non-empty subsystem delete).
    FailedPrecondition = 4,
    /// CAS conflict after retries; the caller may retry the whole operation.
    Aborted = 5,
    /// A capacity limit was hit (e.g. max namespaces).
    ResourceExhausted = 6,
    /// The caller's deadline elapsed.
    DeadlineExceeded = 7,
    /// Unexpected internal failure; details in the log, not the response.
    Internal = 8,
    /// The target engine or the state store is unreachable.
    Unavailable = 9,
}

impl ErrorKind {
    /// Wire status code for this kind.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Inverse of [`code`](Self::code); unknown codes collapse to
    /// `Internal`.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            1 => Self::InvalidArgument,
            2 => Self::NotFound,
            3 => Self::AlreadyExists,
            4 => Self::FailedPrecondition,
            5 => Self::Aborted,
            6 => Self::ResourceExhausted,
            7 => Self::DeadlineExceeded,
            9 => Self::Unavailable,
            _ => Self::Internal,
        }
    }

    /// Short stable name used in log fields and CLI output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::NotFound => "not-found",
            Self::AlreadyExists => "already-exists",
            Self::FailedPrecondition => "failed-precondition",
            Self::Aborted => "aborted",
            Self::ResourceExhausted => "resource-exhausted",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::Internal => "internal",
            Self::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway error: a canonical kind, a human-readable message, and the
/// engine error code when the failure originated in the target engine.
///
/// The message never contains key material; callers constructing errors
/// from key-bearing requests must describe the key by name and kind only.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GwError {
    /// Canonical kind.
    pub kind: ErrorKind,
    /// Human-readable description, safe for the wire.
    pub message: String,
    /// Engine-specific error code, when the engine produced the failure.
    pub engine_code: Option<i32>,
}

impl GwError {
    /// Builds an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            engine_code: None,
        }
    }

    /// Attaches the originating engine error code.
    #[must_use]
    pub const fn with_engine_code(mut self, code: i32) -> Self {
        self.engine_code = Some(code);
        self
    }

    /// `InvalidArgument` shorthand.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// `NotFound` shorthand.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// `AlreadyExists` shorthand.
    #[must_use]
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    /// `FailedPrecondition` shorthand.
    #[must_use]
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    /// `Aborted` shorthand.
    #[must_use]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    /// `ResourceExhausted` shorthand.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    /// `Internal` shorthand.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// `Unavailable` shorthand.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Wire status code.
    #[must_use]
    pub const fn code(&self) -> u32 {
        self.kind.code()
    }
}

/// Result alias used throughout the workspace.
pub type GwResult<T> = Result<T, GwError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip() {
        for kind in [
            ErrorKind::InvalidArgument,
            ErrorKind::NotFound,
            ErrorKind::AlreadyExists,
            ErrorKind::FailedPrecondition,
            ErrorKind::Aborted,
            ErrorKind::ResourceExhausted,
            ErrorKind::DeadlineExceeded,
            ErrorKind::Internal,
            ErrorKind::Unavailable,
        ] {
            assert_eq!(ErrorKind::from_code(kind.code()), kind);
        }
    }

    #[test]
    fn unknown_code_maps_to_internal() {
        assert_eq!(ErrorKind::from_code(0), ErrorKind::Internal);
        assert_eq!(ErrorKind::from_code(42), ErrorKind::Internal);
    }

    #[test]
    fn display_carries_kind_and_message() {
        let err = GwError::not_found("subsystem nqn.2016-06.io.spdk:cnode1");
        assert_eq!(
            err.to_string(),
            "not-found: subsystem nqn.2016-06.io.spdk:cnode1"
        );
    }

    #[test]
    fn engine_code_attaches() {
        let err = GwError::internal("engine rejected request").with_engine_code(-32602);
        assert_eq!(err.engine_code, Some(-32602));
    }
}
