//! The process-wide tail registry and its filesystem event dispatcher.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::stream::Stream;
use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::filter::LineFilter;
use crate::tail::{self, TailFile, TailReader};

/// Errors raised inside event handlers beyond this count are dropped (and
/// counted) until the consumer catches up.
const ERROR_CHANNEL_CAPACITY: usize = 64;

struct Inner {
    /// `None` once the watcher is closed; dropping it ends the event
    /// stream and with it the dispatcher task.
    fs: Option<RecommendedWatcher>,
    tails: HashMap<PathBuf, Arc<TailFile>>,
    /// Watched parent directories with the number of resident tails.
    dirs: HashMap<PathBuf, usize>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    error_tx: mpsc::Sender<Error>,
    dropped_errors: AtomicU64,
}

/// Watches any number of files, each fanned out to any number of readers.
///
/// One filesystem subscription is shared by every tail; parent directories
/// are watched non-recursively and reference counted. A single dispatcher
/// task consumes the event stream in order, so per-file event handling is
/// serialized by construction.
///
/// Constructed with [`TailWatcher::new`], which must be called from within
/// a Tokio runtime.
pub struct TailWatcher {
    shared: Arc<Shared>,
}

impl TailWatcher {
    /// Creates the watcher, its dispatcher task and the channel on which
    /// event-handler failures are delivered.
    pub fn new() -> Result<(TailWatcher, Errors)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let fs = RecommendedWatcher::new(
            move |res| {
                // Send fails only when the dispatcher is gone, which means
                // the watcher is already closed.
                let _ = event_tx.send(res);
            },
            notify::Config::default(),
        )?;
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                fs: Some(fs),
                tails: HashMap::new(),
                dirs: HashMap::new(),
                closed: false,
            }),
            error_tx,
            dropped_errors: AtomicU64::new(0),
        });
        tokio::spawn(dispatch(shared.clone(), event_rx));
        Ok((TailWatcher { shared }, Errors { rx: error_rx }))
    }

    /// Registers `path` and returns a reader seeded with up to `last_n` of
    /// the newest lines admitted by `filter`. The queue retains at most
    /// `max_lines` lines.
    ///
    /// The path is resolved to its absolute form and must name a readable
    /// regular file that is not already watched. If the file is truncated
    /// in place later, it is reread from the start.
    pub async fn add(
        &self,
        path: impl AsRef<Path>,
        max_lines: usize,
        filter: Option<LineFilter>,
        last_n: usize,
    ) -> Result<TailReader> {
        let path = absolutify(path.as_ref())?;
        {
            let inner = self.shared.inner.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            if inner.tails.contains_key(&path) {
                return Err(Error::AlreadyWatching(path));
            }
        }
        let dir = match path.parent() {
            Some(dir) if dir != Path::new("") => dir.to_path_buf(),
            _ => {
                return Err(Error::io(
                    &path,
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "file needs a parent directory",
                    ),
                ))
            }
        };

        let seed_path = path.clone();
        let seed_filter = filter.clone();
        let (file, queue, offset) = tokio::task::spawn_blocking(move || {
            tail::seed(&seed_path, max_lines, seed_filter.as_ref(), last_n)
        })
        .await
        .map_err(|e| Error::io(&path, io::Error::other(e)))??;

        let tail = TailFile::new(path.clone(), file, queue, filter, offset);

        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        if inner.tails.contains_key(&path) {
            return Err(Error::AlreadyWatching(path));
        }
        if !inner.dirs.contains_key(&dir) {
            let Some(fs) = inner.fs.as_mut() else {
                return Err(Error::Closed);
            };
            fs.watch(&dir, RecursiveMode::NonRecursive)?;
            tracing::debug!(dir = %dir.display(), "watching directory");
        }
        *inner.dirs.entry(dir).or_insert(0) += 1;
        inner.tails.insert(path, tail.clone());
        Ok(TailReader::new(tail))
    }

    /// Returns a new independent reader over an already-watched path. Its
    /// cursor starts at the oldest line the tail still retains.
    pub fn lookup(&self, path: impl AsRef<Path>) -> Result<TailReader> {
        let path = absolutify(path.as_ref())?;
        let inner = self.shared.inner.lock();
        if inner.closed {
            return Err(Error::Closed);
        }
        match inner.tails.get(&path) {
            Some(tail) => Ok(TailReader::new(tail.clone())),
            None => Err(Error::NotWatching(path)),
        }
    }

    /// Stops watching `path`. The tail's queue becomes terminal, waking
    /// every outstanding reader; the parent directory is unsubscribed when
    /// its last tail leaves.
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = absolutify(path.as_ref())?;
        let tail = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            let Some(tail) = inner.tails.remove(&path) else {
                return Err(Error::NotWatching(path));
            };
            if let Some(dir) = path.parent() {
                match inner.dirs.get(dir).copied() {
                    Some(count) if count > 1 => {
                        let count = inner
                            .dirs
                            .get_mut(dir)
                            .expect("directory entry vanished under the lock");
                        *count -= 1;
                    }
                    Some(_) => {
                        inner.dirs.remove(dir);
                        if let Some(fs) = inner.fs.as_mut() {
                            // The watch may already be gone if the
                            // directory itself was deleted.
                            if let Err(e) = fs.unwatch(dir) {
                                tracing::debug!(
                                    dir = %dir.display(),
                                    error = %e,
                                    "directory unwatch failed"
                                );
                            }
                        }
                    }
                    None => {}
                }
            }
            tail
        };
        tail.finish();
        tail.close_file().await;
        Ok(())
    }

    /// Shuts the watcher down: drops the filesystem subscription, marks
    /// every queue terminal and clears the registry. Pending events are not
    /// drained. Every later call on this watcher fails with
    /// [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let tails = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(Error::Closed);
            }
            inner.closed = true;
            inner.fs = None;
            inner.dirs.clear();
            inner.tails.drain().map(|(_, tail)| tail).collect::<Vec<_>>()
        };
        for tail in tails {
            tail.finish();
            tail.close_file().await;
        }
        Ok(())
    }

    /// Number of watched files.
    pub fn tail_count(&self) -> usize {
        self.shared.inner.lock().tails.len()
    }

    /// Number of watched parent directories.
    pub fn dir_count(&self) -> usize {
        self.shared.inner.lock().dirs.len()
    }

    /// Event-handler errors dropped because the error channel was full.
    pub fn dropped_errors(&self) -> u64 {
        self.shared.dropped_errors.load(Ordering::Relaxed)
    }
}

impl Drop for TailWatcher {
    /// Best-effort close so the dispatcher task does not outlive the
    /// handle and blocked readers are released.
    fn drop(&mut self) {
        let tails = {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.fs = None;
            inner.dirs.clear();
            inner.tails.drain().map(|(_, tail)| tail).collect::<Vec<_>>()
        };
        for tail in tails {
            tail.finish();
        }
    }
}

impl std::fmt::Debug for TailWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("TailWatcher")
            .field("tails", &inner.tails.keys())
            .field("dirs", &inner.dirs)
            .field("closed", &inner.closed)
            .finish()
    }
}

/// Stream of non-fatal errors raised while handling filesystem events.
///
/// Readers are never told about these; they keep consuming whatever is in
/// their queue.
pub struct Errors {
    rx: mpsc::Receiver<Error>,
}

impl Errors {
    /// Receives the next error; `None` after the watcher is gone.
    pub async fn recv(&mut self) -> Option<Error> {
        self.rx.recv().await
    }
}

impl Stream for Errors {
    type Item = Error;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Errors").finish()
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) {
    while let Some(res) = events.recv().await {
        match res {
            Ok(event) => shared.handle_event(event).await,
            Err(e) => shared.report(Error::Watch(e)),
        }
    }
}

enum Target {
    Tail(Arc<TailFile>),
    Dir,
    Unknown,
}

impl Shared {
    async fn handle_event(&self, event: notify::Event) {
        for path in &event.paths {
            self.handle_path_event(&event.kind, path).await;
        }
    }

    async fn handle_path_event(&self, kind: &EventKind, path: &Path) {
        let target = {
            let inner = self.inner.lock();
            if let Some(tail) = inner.tails.get(path) {
                Target::Tail(tail.clone())
            } else if inner.dirs.contains_key(path) {
                Target::Dir
            } else {
                Target::Unknown
            }
        };
        let res = match (kind, target) {
            (EventKind::Create(_), Target::Tail(tail)) => tail.on_create().await,
            (
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)),
                Target::Tail(tail),
            ) => tail.on_disappear().await,
            (EventKind::Modify(_), Target::Tail(tail)) => tail.on_modify().await,
            (
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)),
                Target::Dir,
            ) => {
                self.parent_disappeared(path).await;
                Ok(())
            }
            _ => Ok(()),
        };
        if let Err(e) = res {
            self.report(e);
        }
    }

    /// Collapses every tail under a vanished directory in one step.
    async fn parent_disappeared(&self, dir: &Path) {
        tracing::warn!(dir = %dir.display(), "watched directory disappeared");
        let removed = {
            let mut inner = self.inner.lock();
            inner.dirs.remove(dir);
            let mut removed = Vec::new();
            inner.tails.retain(|path, tail| {
                if path.starts_with(dir) {
                    removed.push(tail.clone());
                    false
                } else {
                    true
                }
            });
            removed
        };
        for tail in removed {
            tail.finish();
            tail.close_file().await;
        }
    }

    fn report(&self, err: Error) {
        tracing::debug!(error = %err, "event handling error");
        if self.error_tx.try_send(err).is_err() {
            let dropped = self.dropped_errors.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped, "error channel full, dropping error");
        }
    }
}

/// Resolves `path` to the absolute form used as the registry key: the
/// canonicalized parent joined with the file name. Matches the paths
/// carried by directory-watch events.
fn absolutify(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| {
            Error::io(
                path,
                io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"),
            )
        })?
        .to_os_string();
    let parent = match path.parent() {
        Some(p) if p != Path::new("") => p.to_path_buf(),
        _ => std::env::current_dir().map_err(|e| Error::io(path, e))?,
    };
    let parent = parent.canonicalize().unwrap_or(parent);
    Ok(parent.join(file_name))
}
