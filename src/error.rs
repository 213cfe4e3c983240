//! Protocol-facing error taxonomy.
//!
//! `SsError` is the typed error every handler in [`crate::session`],
//! [`crate::document`], [`crate::lock_registry`] and [`crate::file_store`]
//! returns. [`SsError::code`] maps each variant to the wire `error_code`
//! from the protocol (spec.md §6).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire error codes, spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    FileNotFound,
    FileExists,
    FileEmpty,
    FileOperationFailed,
    InvalidPath,
    InvalidSentence,
    InvalidWord,
    SentenceLocked,
    PermissionDenied,
    UndoNotAvailable,
    CheckpointExists,
    CheckpointNotFound,
    SsUnavailable,
    InvalidCommand,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::FileExists => "FILE_EXISTS",
            ErrorCode::FileEmpty => "FILE_EMPTY",
            ErrorCode::FileOperationFailed => "FILE_OPERATION_FAILED",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::InvalidSentence => "INVALID_SENTENCE",
            ErrorCode::InvalidWord => "INVALID_WORD",
            ErrorCode::SentenceLocked => "SENTENCE_LOCKED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::UndoNotAvailable => "UNDO_NOT_AVAILABLE",
            ErrorCode::CheckpointExists => "CHECKPOINT_EXISTS",
            ErrorCode::CheckpointNotFound => "CHECKPOINT_NOT_FOUND",
            ErrorCode::SsUnavailable => "SS_UNAVAILABLE",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
        }
    }
}

/// Errors that can surface across the SS protocol boundary.
///
/// Ordering matters for callers implementing spec.md §4.4's "Error
/// ordering within LOCK/UNLOCK": I/O errors ([`SsError::Io`]) should be
/// checked and returned before semantic errors, which in turn precede
/// [`SsError::RegistryFull`].
#[derive(Debug, Error)]
pub enum SsError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("file already exists: {0}")]
    FileExists(String),

    #[error("file is empty: {0}")]
    FileEmpty(String),

    #[error("file operation failed: {0}")]
    FileOperationFailed(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid sentence index: {0}")]
    InvalidSentence(String),

    #[error("invalid word index: {0}")]
    InvalidWord(String),

    #[error("sentence locked by another user")]
    SentenceLocked,

    #[error("permission denied")]
    PermissionDenied,

    #[error("no undo snapshot available")]
    UndoNotAvailable,

    #[error("checkpoint already exists: {0}")]
    CheckpointExists(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("lock registry is full")]
    RegistryFull,

    #[error("storage server unavailable")]
    SsUnavailable,

    #[error("invalid command")]
    InvalidCommand,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SsError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SsError::FileNotFound(_) => ErrorCode::FileNotFound,
            SsError::FileExists(_) => ErrorCode::FileExists,
            SsError::FileEmpty(_) => ErrorCode::FileEmpty,
            SsError::FileOperationFailed(_) => ErrorCode::FileOperationFailed,
            SsError::InvalidPath(_) => ErrorCode::InvalidPath,
            SsError::InvalidSentence(_) => ErrorCode::InvalidSentence,
            SsError::InvalidWord(_) => ErrorCode::InvalidWord,
            SsError::SentenceLocked => ErrorCode::SentenceLocked,
            SsError::PermissionDenied => ErrorCode::PermissionDenied,
            SsError::UndoNotAvailable => ErrorCode::UndoNotAvailable,
            SsError::CheckpointExists(_) => ErrorCode::CheckpointExists,
            SsError::CheckpointNotFound(_) => ErrorCode::CheckpointNotFound,
            SsError::RegistryFull => ErrorCode::SsUnavailable,
            SsError::SsUnavailable => ErrorCode::SsUnavailable,
            SsError::InvalidCommand => ErrorCode::InvalidCommand,
            SsError::Io(_) => ErrorCode::FileOperationFailed,
            SsError::Other(_) => ErrorCode::FileOperationFailed,
        }
    }
}

pub type SsResult<T> = Result<T, SsError>;
