// src/error.rs - Error types for loop operations

use std::io;
use thiserror::Error;

/// Error type for event loop operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A key was registered while a watcher for the same key was still
    /// active. Unwatch the key first, or pick a different one.
    #[error("duplicate event key detected, event key must be unique")]
    DuplicateKey,

    /// Error surfaced from the poll primitive: registering an invalid
    /// descriptor, creating the OS polling context, or the wait itself.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
