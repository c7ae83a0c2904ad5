//! Per-file tailing state and the reader-facing projection.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::Stream;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::fanout::{Cursor, FanoutQueue};
use crate::filter::LineFilter;
use crate::revread::{ReadEnd, RevReader};

/// Mutable per-file read state. Touched only by the dispatcher's event
/// handlers and by [`TailWatcher::remove`]/[`close`]; readers never go near
/// it.
///
/// [`TailWatcher::remove`]: crate::TailWatcher::remove
/// [`close`]: crate::TailWatcher::close
struct TailIo {
    /// `None` while the file is absent (deleted or renamed away).
    file: Option<File>,
    /// Byte position immediately after the last fully consumed newline.
    last_offset: u64,
}

/// One watched file: its queue, its filter and its read position.
pub(crate) struct TailFile {
    path: PathBuf,
    queue: FanoutQueue,
    filter: parking_lot::Mutex<Option<LineFilter>>,
    io: Mutex<TailIo>,
}

/// Opens `path` and seeds a queue with the last `last_n` admitted lines.
///
/// Returns the open handle, the seeded queue and the resulting read offset:
/// the byte after the last complete newline, so an unterminated trailing
/// fragment is left for later events to pick up. A file with no newline at
/// all keeps its offset at EOF and seeds nothing.
pub(crate) fn seed(
    path: &Path,
    max_lines: usize,
    filter: Option<&LineFilter>,
    mut last_n: usize,
) -> Result<(std::fs::File, FanoutQueue, u64)> {
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let meta = file.metadata().map_err(|e| Error::io(path, e))?;
    if !meta.is_file() {
        return Err(Error::NotRegularFile(path.to_owned()));
    }
    let queue = FanoutQueue::new(max_lines)?;
    if meta.len() == 0 {
        return Ok((file, queue, 0));
    }

    let mut rev = RevReader::new(&file).map_err(|e| Error::io(path, e))?;
    let mut pos = rev.tell();
    let (last, end) = rev.prev_bytes(b'\n').map_err(|e| Error::io(path, e))?;
    if end == ReadEnd::Start {
        // No newline anywhere: the whole file is one unterminated fragment.
        last_n = 0;
    } else if last.len() != 1 {
        // Not newline-terminated; stop short of the trailing fragment.
        pos -= (last.len() - 1) as u64;
    }

    while last_n > 0 {
        let (line, end) = rev.prev_bytes(b'\n').map_err(|e| Error::io(path, e))?;
        let line = match line.first() {
            Some(b'\n') => &line[1..],
            _ => &line[..],
        };
        if filter.map_or(true, |f| f.admits(line)) {
            // A full queue already holds the newest admitted lines.
            let _ = queue.append_head(Bytes::copy_from_slice(line));
            last_n -= 1;
        }
        if end == ReadEnd::Start {
            break;
        }
    }
    Ok((file, queue, pos))
}

impl TailFile {
    pub(crate) fn new(
        path: PathBuf,
        file: std::fs::File,
        queue: FanoutQueue,
        filter: Option<LineFilter>,
        last_offset: u64,
    ) -> Arc<Self> {
        Arc::new(TailFile {
            path,
            queue,
            filter: parking_lot::Mutex::new(filter),
            io: Mutex::new(TailIo {
                file: Some(File::from_std(file)),
                last_offset,
            }),
        })
    }

    /// Marks the queue terminal, waking every reader.
    pub(crate) fn finish(&self) {
        self.queue.done();
    }

    pub(crate) async fn close_file(&self) {
        self.io.lock().await.file = None;
    }

    fn publish(&self, line: &[u8]) {
        let admitted = self
            .filter
            .lock()
            .as_ref()
            .map_or(true, |f| f.admits(line));
        if admitted {
            self.queue.append(Bytes::copy_from_slice(line));
        }
    }

    /// Reads forward from `last_offset`, publishing every complete line.
    /// A trailing fragment without a newline is left unconsumed.
    async fn drain(&self, io: &mut TailIo) -> io::Result<()> {
        let Some(file) = io.file.as_mut() else {
            return Ok(());
        };
        file.seek(SeekFrom::Start(io.last_offset)).await?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 || buf.last() != Some(&b'\n') {
                return Ok(());
            }
            self.publish(&buf[..n - 1]);
            io.last_offset += n as u64;
        }
    }

    /// Modification event: drain any growth. A size below the current
    /// offset means in-place truncation; the policy is to reread from the
    /// start.
    pub(crate) async fn on_modify(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        let Some(file) = io.file.as_ref() else {
            // Stale event for an absent file (between disappear and
            // recreate): ignore.
            return Ok(());
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::io(&self.path, e))?
            .len();
        if size < io.last_offset {
            tracing::debug!(
                file = %self.path.display(),
                offset = io.last_offset,
                size,
                "file shrank, rereading from the start"
            );
            io.last_offset = 0;
        } else if size == io.last_offset {
            return Ok(());
        }
        self.drain(&mut io)
            .await
            .map_err(|e| Error::io(&self.path, e))
    }

    /// Disappearance event (deleted or renamed away): publish everything
    /// left past `last_offset`, including an unterminated trailing
    /// fragment, then close the handle. The queue stays open; the name may
    /// be recreated.
    pub(crate) async fn on_disappear(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        if io.file.is_none() {
            return Ok(());
        }
        let res = self.drain_to_end(&mut io).await;
        io.file = None;
        res.map_err(|e| Error::io(&self.path, e))
    }

    async fn drain_to_end(&self, io: &mut TailIo) -> io::Result<()> {
        let Some(file) = io.file.as_mut() else {
            return Ok(());
        };
        let size = file.metadata().await?.len();
        if size <= io.last_offset {
            return Ok(());
        }
        file.seek(SeekFrom::Start(io.last_offset)).await?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            let line = match buf.last() {
                Some(b'\n') => &buf[..n - 1],
                _ => &buf[..],
            };
            self.publish(line);
            io.last_offset += n as u64;
        }
    }

    /// Creation event: reopen the name and drain it from the start. Valid
    /// for an absent tail; a create while the old handle is still open is
    /// handled but reported as an error.
    pub(crate) async fn on_create(&self) -> Result<()> {
        let mut io = self.io.lock().await;
        let stale = io.file.take().is_some();
        let file = File::open(&self.path)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        io.file = Some(file);
        io.last_offset = 0;
        self.drain(&mut io)
            .await
            .map_err(|e| Error::io(&self.path, e))?;
        if stale {
            return Err(Error::io(
                &self.path,
                io::Error::other("create event while the file was still open"),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for TailFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailFile")
            .field("path", &self.path)
            .field("queue", &self.queue)
            .finish()
    }
}

/// A reader over one watched file.
///
/// Each reader owns a private [`Cursor`] into the file's shared queue, so
/// any number of readers consume the same tail independently. A reader
/// stays usable after its file is removed from the watcher: it drains the
/// remaining history and then observes the terminal state.
pub struct TailReader {
    tail: Arc<TailFile>,
    cursor: Cursor,
}

impl TailReader {
    pub(crate) fn new(tail: Arc<TailFile>) -> Self {
        TailReader {
            cursor: tail.queue.cursor(),
            tail,
        }
    }

    /// Absolute path of the watched file.
    pub fn name(&self) -> &Path {
        &self.tail.path
    }

    /// Returns the next line if one is already buffered.
    pub fn next(&mut self) -> Option<Bytes> {
        self.cursor.next()
    }

    /// Waits for the next line; `None` once the tail is finished.
    pub async fn wait_next(&mut self) -> Option<Bytes> {
        self.cursor.wait_next().await
    }

    /// Moves this reader back to the oldest retained line.
    pub fn reset(&mut self) {
        self.cursor.rewind();
    }

    /// Replaces the filter applied to lines read from now on. Shared with
    /// every reader of this file; already-queued lines are not re-filtered.
    pub fn set_filter(&self, filter: Option<LineFilter>) {
        *self.tail.filter.lock() = filter;
    }

    /// Adapts this reader into a stream of lines, terminating when the
    /// tail is finished.
    pub fn into_stream(self) -> impl Stream<Item = Bytes> {
        futures_util::stream::unfold(self, |mut reader| async move {
            reader.wait_next().await.map(|line| (line, reader))
        })
    }
}

impl Clone for TailReader {
    /// Yields an independent reader over the same file whose cursor starts
    /// at the oldest retained line.
    fn clone(&self) -> Self {
        TailReader::new(self.tail.clone())
    }
}

impl std::fmt::Debug for TailReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailReader")
            .field("name", &self.tail.path)
            .finish()
    }
}
