use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RawscopeError {
    #[error("Permission denied opening {path}: {reason}")]
    PermissionDenied { path: String, reason: String },

    #[error("No known filesystem signature on {0}")]
    NotRecognized(String),

    #[error("Malformed structure: {0}")]
    MalformedStructure(String),

    #[error("IO error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, RawscopeError>;

/// Coarse grouping callers use to decide how to react to a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Raw access was refused; the user should elevate privileges.
    Permission,
    /// Nothing we know lives here. Not a failure of the tool.
    Unrecognized,
    /// A signature matched but the structure behind it is inconsistent.
    Corrupted,
    /// Device I/O failed; possibly transient.
    Io,
    /// Bad path, wrong node kind, or unsupported feature.
    Request,
}

impl RawscopeError {
    /// Wrap an I/O error, routing EACCES/EPERM to `PermissionDenied`.
    pub fn from_io(path: &str, context: impl Into<String>, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            return RawscopeError::PermissionDenied {
                path: path.to_string(),
                reason: source.to_string(),
            };
        }
        RawscopeError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn malformed(fs: &str, reason: impl std::fmt::Display) -> Self {
        RawscopeError::MalformedStructure(format!("{}: {}", fs, reason))
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            RawscopeError::PermissionDenied { .. } => ErrorCategory::Permission,
            RawscopeError::NotRecognized(_) => ErrorCategory::Unrecognized,
            RawscopeError::MalformedStructure(_) => ErrorCategory::Corrupted,
            RawscopeError::Io { .. } => ErrorCategory::Io,
            RawscopeError::NotAFile(_)
            | RawscopeError::NotADirectory(_)
            | RawscopeError::PathNotFound(_)
            | RawscopeError::NotSupported(_)
            | RawscopeError::InvalidInput(_) => ErrorCategory::Request,
        }
    }

    /// Only device I/O is worth retrying, and only when the path itself was valid.
    pub fn is_retryable(&self) -> bool {
        match self {
            RawscopeError::Io { source, .. } => !matches!(
                source.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported
            ),
            _ => false,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            category: self.category(),
            retryable: self.is_retryable(),
            message: self.to_string(),
        }
    }
}

impl From<io::Error> for RawscopeError {
    fn from(source: io::Error) -> Self {
        RawscopeError::from_io("<device>", "device I/O", source)
    }
}

/// Serializable form of an error for UI and JSON consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub message: String,
}
