//! Crate-wide error type.

use std::io;
use std::path::PathBuf;

/// Errors reported by the watcher, the queue and the filter.
///
/// Control-plane calls (`add`, `remove`, `lookup`, `close`, constructors)
/// return these synchronously. Failures inside event handlers are delivered
/// on the watcher's error channel instead and never reach readers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("queue capacity must be greater than zero")]
    InvalidCapacity,

    #[error("queue is full")]
    QueueFull,

    #[error("already watching: {}", .0.display())]
    AlreadyWatching(PathBuf),

    #[error("not watching: {}", .0.display())]
    NotWatching(PathBuf),

    #[error("watcher is closed")]
    Closed,

    #[error("not a regular file: {}", .0.display())]
    NotRegularFile(PathBuf),

    #[error("no patterns in filter file: {}", .0.display())]
    NoPatterns(PathBuf),

    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("watch registration failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
