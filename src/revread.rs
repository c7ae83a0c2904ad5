//! Backward line reading over a positioned-read source.
//!
//! [`RevReader`] walks a byte source from its end toward its start,
//! producing delimiter-separated slices in reverse order. Over the content
//!
//! ```text
//! 1<LF>
//! 2:<LF>
//! 3: 3<LF>
//! ```
//!
//! the first `prev_slice(b'\n')` yields the trailing `"\n"` alone, the next
//! `"\n3: 3"`, then `"\n2:"`, and the last yields `"1"` together with
//! [`ReadEnd::Start`]. A slice that cannot fit the buffer is handed out in
//! pieces with [`ReadEnd::Full`]; [`RevReader::prev_bytes`] reassembles
//! those into one allocation.

use std::io;

const DEFAULT_BUF_SIZE: usize = 4096;
const MIN_BUF_SIZE: usize = 16;

/// A source supporting positioned reads and a length query.
pub trait ReadAtLen {
    /// Reads into `buf` starting at byte `offset`, returning the count read.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Total length of the source in bytes.
    fn byte_len(&self) -> io::Result<u64>;
}

impl<R: ReadAtLen + ?Sized> ReadAtLen for &R {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }

    fn byte_len(&self) -> io::Result<u64> {
        (**self).byte_len()
    }
}

impl ReadAtLen for std::fs::File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }

    fn byte_len(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

impl ReadAtLen for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let offset = offset.min(self.len() as u64) as usize;
        let n = buf.len().min(self.len() - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }

    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

/// How a backward slice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    /// The slice begins with the delimiter.
    Delim,
    /// The start of the source was reached; this is the leftmost slice.
    /// Subsequent calls keep returning an empty slice with this marker.
    Start,
    /// The buffer filled up before a delimiter was found; the slice is the
    /// right-hand piece and the caller must prepend earlier pieces.
    Full,
}

/// Reads delimiter-separated slices from the end of a source backwards.
pub struct RevReader<R> {
    src: R,
    buf: Box<[u8]>,
    /// Unconsumed bytes occupy `buf[..tail]`.
    tail: usize,
    /// Source offset of `buf[0]`.
    pos: u64,
    /// Source length captured at construction.
    base: u64,
    at_start: bool,
}

impl<R: ReadAtLen> RevReader<R> {
    /// Creates a reader with the default buffer size. Fails when the source
    /// is empty.
    pub fn new(src: R) -> io::Result<Self> {
        Self::with_capacity(src, DEFAULT_BUF_SIZE)
    }

    /// Creates a reader with a buffer of at least `size` bytes.
    pub fn with_capacity(src: R, size: usize) -> io::Result<Self> {
        let base = src.byte_len()?;
        if base == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty source",
            ));
        }
        Ok(RevReader {
            src,
            buf: vec![0; size.max(MIN_BUF_SIZE)].into_boxed_slice(),
            tail: 0,
            pos: base,
            base,
            at_start: false,
        })
    }

    /// Absolute offset of the byte after the next slice to be produced.
    /// Monotone non-increasing across `prev_slice`/`prev_bytes` calls.
    pub fn tell(&self) -> u64 {
        self.pos + self.tail as u64
    }

    /// Restores the reader to the end of the source.
    pub fn rewind(&mut self) {
        self.pos = self.base;
        self.tail = 0;
        self.at_start = false;
    }

    /// Slides the live bytes right and reads the preceding chunk into the
    /// left vacancy, clamping at the start of the source.
    fn fill(&mut self) -> io::Result<()> {
        let free = self.buf.len() - self.tail;
        let take = (free as u64).min(self.pos) as usize;
        self.buf.copy_within(..self.tail, take);
        self.pos -= take as u64;
        self.tail += take;
        if self.pos == 0 {
            self.at_start = true;
        }
        read_full_at(&self.src, &mut self.buf[..take], self.pos)
    }

    /// Returns the next slice to the left, spanning from the rightmost
    /// occurrence of `delim` (inclusive) to the previous slice's start.
    pub fn prev_slice(&mut self, delim: u8) -> io::Result<(&[u8], ReadEnd)> {
        let (lo, hi, end) = loop {
            let tail = self.tail;
            if let Some(i) = self.buf[..tail].iter().rposition(|&b| b == delim) {
                self.tail = i;
                break (i, tail, ReadEnd::Delim);
            }
            if self.at_start {
                self.tail = 0;
                break (0, tail, ReadEnd::Start);
            }
            if tail == self.buf.len() {
                self.tail = 0;
                break (0, tail, ReadEnd::Full);
            }
            self.fill()?;
        };
        Ok((&self.buf[lo..hi], end))
    }

    /// Like [`prev_slice`](Self::prev_slice), but reassembles slices that
    /// overflowed the buffer; the returned end is `Delim` or `Start`.
    pub fn prev_bytes(&mut self, delim: u8) -> io::Result<(Vec<u8>, ReadEnd)> {
        let mut pieces: Vec<Vec<u8>> = Vec::new();
        loop {
            let (frag, end) = self.prev_slice(delim)?;
            match end {
                ReadEnd::Full => pieces.push(frag.to_vec()),
                end => {
                    let total =
                        frag.len() + pieces.iter().map(Vec::len).sum::<usize>();
                    let mut out = Vec::with_capacity(total);
                    out.extend_from_slice(frag);
                    // Pieces were collected right-to-left.
                    for piece in pieces.iter().rev() {
                        out.extend_from_slice(piece);
                    }
                    return Ok((out, end));
                }
            }
        }
    }
}

fn read_full_at<R: ReadAtLen>(
    src: &R,
    mut buf: &mut [u8],
    mut offset: u64,
) -> io::Result<()> {
    while !buf.is_empty() {
        match src.read_at(buf, offset) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source shrank during backward read",
                ));
            }
            Ok(n) => {
                let rest = buf;
                buf = &mut rest[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: &[u8] = b"1\n2:\n3: \n4: 4\n5: 55";
    const LONG: &[u8] = b"1\n2:\n3: \n4: 4\n5: 55\n6: 666\n7: 7777\n8: 88888\n\
        9: 999999\na: aaaaaaa\nb: bbbbbbbb\nc: ccccccccc\nd: dddddddddd\n\
        e: eeeeeeeeeee\nf: ffffffffffff\n10: 000000000000\n";

    fn walk(r: &mut RevReader<&[u8]>) -> Vec<(Vec<u8>, ReadEnd)> {
        let mut out = Vec::new();
        loop {
            let (slice, end) = r.prev_slice(b'\n').unwrap();
            out.push((slice.to_vec(), end));
            if end == ReadEnd::Start {
                return out;
            }
        }
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(RevReader::new(&b""[..]).is_err());
    }

    #[test]
    fn slices_with_default_buffer() {
        let mut r = RevReader::new(SHORT).unwrap();
        let expect: &[(&[u8], ReadEnd)] = &[
            (b"\n5: 55", ReadEnd::Delim),
            (b"\n4: 4", ReadEnd::Delim),
            (b"\n3: ", ReadEnd::Delim),
            (b"\n2:", ReadEnd::Delim),
            (b"1", ReadEnd::Start),
        ];
        for (want, want_end) in expect {
            let (slice, end) = r.prev_slice(b'\n').unwrap();
            assert_eq!(slice, *want);
            assert_eq!(end, *want_end);
        }
        // The start marker is sticky.
        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert!(slice.is_empty());
        assert_eq!(end, ReadEnd::Start);
    }

    #[test]
    fn slices_with_minimum_buffer() {
        let mut r = RevReader::with_capacity(SHORT, 16).unwrap();
        let got = walk(&mut r);
        let flat: Vec<&[u8]> = got.iter().map(|(s, _)| s.as_slice()).collect();
        assert_eq!(flat, [&b"\n5: 55"[..], b"\n4: 4", b"\n3: ", b"\n2:", b"1"]);
        assert_eq!(got.last().unwrap().1, ReadEnd::Start);
    }

    #[test]
    fn trailing_newline_is_its_own_slice() {
        let mut r = RevReader::new(LONG).unwrap();
        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"\n");
        assert_eq!(end, ReadEnd::Delim);
        let (slice, _) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"\n10: 000000000000");
    }

    #[test]
    fn tell_tracks_the_walk() {
        let mut r = RevReader::new(LONG).unwrap();
        assert_eq!(r.tell(), LONG.len() as u64);

        let (slice, _) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"\n");
        assert_eq!(r.tell(), LONG.len() as u64 - 1);

        let (slice, _) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"\n10: 000000000000");
        assert_eq!(r.tell(), LONG.len() as u64 - 18);

        let mut last = r.tell();
        loop {
            let (_, end) = r.prev_slice(b'\n').unwrap();
            assert!(r.tell() <= last);
            last = r.tell();
            if end == ReadEnd::Start {
                break;
            }
        }
        assert_eq!(r.tell(), 0);

        r.rewind();
        assert_eq!(r.tell(), LONG.len() as u64);
    }

    #[test]
    fn overflow_reassembly() {
        let s = b"11: 1111111111111\n1\n2:\n3: \n4: 4\n5: 55\n6: 666\n\
            7: 7777\n8: 88888\n9: 999999\na: aaaaaaa\nb: bbbbbbbb\n\
            c: ccccccccc\nd: dddddddddd\ne: eeeeeeeeeee\nf: ffffffffffff\n\
            10: 000000000000\n";
        let mut r = RevReader::with_capacity(&s[..], 16).unwrap();

        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert_eq!((slice, end), (&b"\n"[..], ReadEnd::Delim));
        // The 17-byte final line cannot fit a 16-byte buffer.
        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert_eq!((slice, end), (&b"10: 000000000000"[..], ReadEnd::Full));
        let (bytes, end) = r.prev_bytes(b'\n').unwrap();
        assert_eq!((bytes.as_slice(), end), (&b"\n"[..], ReadEnd::Delim));

        r.rewind();
        let (bytes, _) = r.prev_bytes(b'\n').unwrap();
        assert_eq!(bytes, b"\n");
        let (bytes, _) = r.prev_bytes(b'\n').unwrap();
        assert_eq!(bytes, b"\n10: 000000000000");

        // Walk to the start; the leftmost line also exceeds the buffer.
        let (bytes, end) = loop {
            let (bytes, end) = r.prev_bytes(b'\n').unwrap();
            if end == ReadEnd::Start {
                break (bytes, end);
            }
        };
        assert_eq!(bytes, b"11: 1111111111111");
        assert_eq!(end, ReadEnd::Start);
    }

    #[test]
    fn single_line_without_newline() {
        let mut r = RevReader::new(&b"test"[..]).unwrap();
        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"test");
        assert_eq!(end, ReadEnd::Start);
    }

    #[test]
    fn delimiter_on_buffer_border() {
        let s = b"0123456789abcdef\n0123456789abcde";
        let mut r = RevReader::with_capacity(&s[..], 16).unwrap();

        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"\n0123456789abcde");
        assert_eq!(end, ReadEnd::Delim);
        assert_eq!(r.tell(), 16);

        let (slice, end) = r.prev_slice(b'\n').unwrap();
        assert_eq!(slice, b"0123456789abcdef");
        assert_eq!(end, ReadEnd::Start);
        assert_eq!(r.tell(), 0);
    }

    #[test]
    fn reverse_walk_reconstructs_source() {
        for size in [16, 17, 32, 4096] {
            let mut r = RevReader::with_capacity(LONG, size).unwrap();
            let mut parts = Vec::new();
            loop {
                let (bytes, end) = r.prev_bytes(b'\n').unwrap();
                parts.push(bytes);
                if end == ReadEnd::Start {
                    break;
                }
            }
            let rebuilt: Vec<u8> =
                parts.iter().rev().flat_map(|p| p.iter().copied()).collect();
            assert_eq!(rebuilt, LONG, "buffer size {size}");
        }
    }
}
