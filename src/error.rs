/// pkgimage error types and handling utilities
use std::io;

use thiserror::Error;

use crate::digest::{Digest, DigestError};

/// Main error type for pkgimage operations
///
/// Cloneable so one failed build can be handed to every request waiting on it.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// No installed package backs the requested image name
    #[error("no installed package provides image {name}")]
    PackageNotFound { name: String },

    /// The image exists but the tag does not resolve to any package
    #[error("image {name} has no tag {tag}")]
    TagUnknown { name: String, tag: String },

    /// Package metadata or a payload file could not be read
    #[error("payload of {package} unreadable at {path}: {reason}")]
    PayloadUnreadable {
        package: String,
        path: String,
        reason: String,
    },

    /// Stored bytes no longer hash to the digest they are filed under
    #[error("digest mismatch: expected {expected}, got {actual} ({size} bytes)")]
    DigestMismatch {
        expected: Digest,
        actual: Digest,
        size: usize,
    },

    /// Image configuration is missing a required field
    #[error("invalid image config: {0}")]
    InvalidConfig(String),

    /// A file path would land outside the layer root
    #[error("invalid path {path:?} in {package}")]
    InvalidPath { package: String, path: String },

    #[error(transparent)]
    InvalidDigest(#[from] DigestError),

    #[error("blob {0} not found")]
    BlobUnknown(Digest),

    #[error("manifest {reference} not found in {name}")]
    ManifestUnknown { name: String, reference: String },

    #[error("storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn storage(operation: &'static str, source: io::Error) -> Self {
        Self::Storage {
            operation,
            message: source.to_string(),
        }
    }

    pub fn payload(package: impl Into<String>, path: impl Into<String>, reason: impl ToString) -> Self {
        Self::PayloadUnreadable {
            package: package.into(),
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a caller re-requesting the same image may get a different
    /// outcome. Nothing inside the crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PayloadUnreadable { .. } => true,
            Self::Storage { .. } => true,
            Self::DigestMismatch { .. } => true,
            Self::Internal(_) => true,
            Self::PackageNotFound { .. } => false,
            Self::TagUnknown { .. } => false,
            Self::InvalidConfig(_) => false,
            Self::InvalidPath { .. } => false,
            Self::InvalidDigest(_) => false,
            Self::BlobUnknown(_) => false,
            Self::ManifestUnknown { .. } => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
