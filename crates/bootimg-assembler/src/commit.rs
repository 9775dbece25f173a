//! Replace a committed artifact only when its content actually changed.
//!
//! The composite disk builder downstream regenerates its disk whenever any
//! component is newer than the disk, and regenerating throws away the user's
//! data partition. A rebuilt image with identical bytes must therefore leave
//! the committed file, and its mtime, alone.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

pub const TMP_EXTENSION: &str = ".tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitOutcome {
    /// The pending file replaced the committed one.
    Updated,
    /// Content was identical; the pending file was discarded.
    Unchanged,
}

/// `<final>.tmp`, where every artifact is produced before being committed.
pub fn pending_path(final_path: &Path) -> PathBuf {
    let mut s: OsString = final_path.as_os_str().to_owned();
    s.push(TMP_EXTENSION);
    PathBuf::from(s)
}

pub fn commit_if_changed(tmp: &Path, final_path: &Path) -> Result<CommitOutcome> {
    let changed = !final_path.exists() || !same_contents(tmp, final_path)?;
    if changed {
        fs::rename(tmp, final_path).map_err(|e| {
            Error::io(&format!("rename {} over", tmp.display()), final_path, e)
        })?;
        tracing::debug!(path = %final_path.display(), "updated");
        return Ok(CommitOutcome::Updated);
    }

    tracing::debug!(path = %final_path.display(), "didn't update, content unchanged");
    if let Err(e) = fs::remove_file(tmp) {
        tracing::warn!(path = %tmp.display(), error = %e, "failed to remove pending file");
    }
    Ok(CommitOutcome::Unchanged)
}

fn same_contents(a: &Path, b: &Path) -> Result<bool> {
    let fa = File::open(a).map_err(|e| Error::io("open", a, e))?;
    let fb = File::open(b).map_err(|e| Error::io("open", b, e))?;
    let len_a = fa.metadata().map_err(|e| Error::io("stat", a, e))?.len();
    let len_b = fb.metadata().map_err(|e| Error::io("stat", b, e))?.len();
    if len_a != len_b {
        return Ok(false);
    }

    let mut ra = BufReader::new(fa);
    let mut rb = BufReader::new(fb);
    let mut buf_a = vec![0u8; 256 * 1024];
    let mut buf_b = vec![0u8; 256 * 1024];
    loop {
        let n = read_full(&mut ra, &mut buf_a).map_err(|e| Error::io("read", a, e))?;
        let m = read_full(&mut rb, &mut buf_b).map_err(|e| Error::io("read", b, e))?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

// Fill as much of `buf` as the reader allows; short only at EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
