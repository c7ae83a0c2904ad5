//! Reloadable per-line regex filters.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::bytes::Regex;

use crate::error::{Error, Result};

/// A reloadable predicate over lines, compiled from a pattern file.
///
/// The spec string is `[!]pattern-file-path`: the file is read line by line,
/// blank lines are skipped, and the remaining patterns are OR-joined into a
/// single expression `(p1|p2|...)`. A line is admitted when the match result
/// differs from the inversion flag. Matching is on raw bytes, so filtered
/// streams need not be UTF-8.
///
/// Clones share the compiled expression; a successful [`reload`] switches
/// every clone atomically.
///
/// [`reload`]: LineFilter::reload
#[derive(Clone)]
pub struct LineFilter {
    inner: Arc<Inner>,
}

struct Inner {
    spec: String,
    path: PathBuf,
    invert: bool,
    regex: RwLock<Regex>,
}

impl LineFilter {
    pub fn new(spec: &str) -> Result<Self> {
        let (invert, path) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let path = PathBuf::from(path);
        let regex = compile(&path)?;
        Ok(LineFilter {
            inner: Arc::new(Inner {
                spec: spec.to_owned(),
                path,
                invert,
                regex: RwLock::new(regex),
            }),
        })
    }

    /// The spec string this filter was built from.
    pub fn name(&self) -> &str {
        &self.inner.spec
    }

    /// Whether `line` passes the filter.
    pub fn admits(&self, line: &[u8]) -> bool {
        self.inner.regex.read().is_match(line) != self.inner.invert
    }

    /// Re-reads the pattern file and recompiles. On failure the previous
    /// expression stays in effect and the error is returned.
    pub fn reload(&self) -> Result<()> {
        let regex = compile(&self.inner.path)?;
        *self.inner.regex.write() = regex;
        Ok(())
    }
}

impl std::fmt::Debug for LineFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineFilter")
            .field("spec", &self.inner.spec)
            .finish()
    }
}

impl std::fmt::Display for LineFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.inner.spec)
    }
}

fn compile(path: &Path) -> Result<Regex> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let patterns: Vec<&str> = text.split('\n').filter(|l| !l.is_empty()).collect();
    if patterns.is_empty() {
        return Err(Error::NoPatterns(path.to_owned()));
    }
    Ok(Regex::new(&format!("({})", patterns.join("|")))?)
}
