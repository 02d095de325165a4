// Copyright 2026 Mergetree Project Authors. Licensed under Apache-2.0.

use std::backtrace::Backtrace;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("logical error: {0}")]
    LogicalError(String),
    #[error("all requested columns are missing")]
    AllRequestedColumnsAreMissing,
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] Box<std::io::Error>),
    #[error("decode error: {0}")]
    Decode(String),
}

/// [`StorageError`] with the backtrace captured where it was raised.
pub struct TracedStorageError {
    source: StorageError,
    backtrace: Backtrace,
}

impl std::fmt::Display for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n{}", self.source, self.backtrace)
    }
}

impl std::fmt::Debug for TracedStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for TracedStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<StorageError> for TracedStorageError {
    fn from(source: StorageError) -> Self {
        Self {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<std::io::Error> for TracedStorageError {
    #[inline]
    fn from(e: std::io::Error) -> TracedStorageError {
        StorageError::Io(e.into()).into()
    }
}

impl TracedStorageError {
    pub fn logical(message: impl ToString) -> Self {
        StorageError::LogicalError(message.to_string()).into()
    }

    pub fn decode(message: impl ToString) -> Self {
        StorageError::Decode(message.to_string()).into()
    }

    pub fn kind(&self) -> &StorageError {
        &self.source
    }
}

pub type StorageResult<T> = std::result::Result<T, TracedStorageError>;
