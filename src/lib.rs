//! A library providing live, filterable, bounded-history views of
//! append-only (namely log) files to any number of concurrent readers.
//!
//! A [`TailWatcher`] owns one filesystem subscription (driven by
//! [`notify`](https://crates.io/crates/notify)) for all registered files and
//! keeps every tail correct across rotation (rename + recreate), deletion,
//! in-place truncation and disappearance of the containing directory. Each
//! file fans its lines out through a bounded [`FanoutQueue`]; readers hold
//! independent [`Cursor`]s, so a slow consumer keeps the history it has not
//! yet read even after the queue evicts it.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use linefan::TailWatcher;
//! #
//! # async fn dox() -> linefan::Result<()> {
//! let (watcher, mut errors) = TailWatcher::new()?;
//!
//! // Seed the last 10 lines, keep at most 1000 buffered.
//! let mut reader = watcher.add("/var/log/app.log", 1000, None, 10).await?;
//!
//! tokio::spawn(async move {
//!     while let Some(err) = errors.recv().await {
//!         eprintln!("tail error: {err}");
//!     }
//! });
//!
//! while let Some(line) = reader.wait_next().await {
//!     println!("{}", String::from_utf8_lossy(&line));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Lines are raw bytes with the newline stripped; the engine neither
//! requires nor rejects UTF-8.
//!
//! ## Caveats
//!
//! linefan requires an event source with per-entry create/delete/modify/
//! rename and per-directory self events (inotify semantics). Watched paths
//! must be regular files, and must exist when registered.

mod error;
mod fanout;
mod filter;
mod revread;
mod tail;
mod watcher;

pub use error::{Error, Result};
pub use fanout::{Cursor, FanoutQueue};
pub use filter::LineFilter;
pub use revread::{ReadAtLen, ReadEnd, RevReader};
pub use tail::TailReader;
pub use watcher::{Errors, TailWatcher};
