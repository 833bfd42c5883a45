// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for the result of a database operation. `Ok` is the
/// "no error" sentinel; every storage reply carries exactly one of these.
pub type IdbResult<T> = Result<T, IdbError>;

/// The error taxonomy surfaced to clients. Mirrors the exception codes of the
/// IndexedDB data model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The requested version is lower than the currently installed one.
    VersionError,
    /// A key uniqueness violation, either in `add` mode or on a unique index.
    ConstraintError,
    /// An operation against an object store or transaction that does not exist.
    InvalidStateError,
    /// The key supplied for a record is not a valid key.
    DataError,
    /// The backing store is out of space.
    QuotaExceeded,
    /// An unclassified backing store or internal failure.
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::VersionError => "VersionError",
            ErrorKind::ConstraintError => "ConstraintError",
            ErrorKind::InvalidStateError => "InvalidStateError",
            ErrorKind::DataError => "DataError",
            ErrorKind::QuotaExceeded => "QuotaExceeded",
            ErrorKind::UnknownError => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A first-class error value delivered back through a storage reply to the
/// typed continuation of the operation that failed. Errors are never retried
/// locally; they are always surfaced to the originating client.
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}{}", .message.as_ref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct IdbError {
    kind: ErrorKind,
    message: Option<String>,
}

impl IdbError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// The error reported when the coordinator or the storage thread has shut
    /// down and a command can no longer be delivered.
    pub(crate) fn shutdown() -> Self {
        Self::with_message(ErrorKind::UnknownError, "database is shutting down")
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}
