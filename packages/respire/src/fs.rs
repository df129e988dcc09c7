//! Filesystem operations tailored to `respire`.
//!
//! Everything here is synchronous: the host and the staging paths are
//! short-lived sequential processes, and the engine only touches the
//! filesystem from its scheduler task. Inside this module we refer to
//! `std::fs` by its qualified path to make it clear what we are using.

use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use tap::TapFallible;
use tracing::trace;

/// Read a file as UTF-8, failing with context.
pub fn read_to_string(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path)
        .with_context(|| format!("read file: {path:?}"))
        .tap_ok(|buf| trace!(?path, bytes = buf.len(), "read file"))
}

/// Read a file as UTF-8, mapping "not found" to `None`.
pub fn read_optional(path: impl AsRef<Path>) -> Result<Option<String>> {
    let path = path.as_ref();
    match std::fs::read_to_string(path) {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Create the directory and all its parents, if they don't already exist.
pub fn create_dir_all(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {dir:?}"))
}

/// Write contents to a sibling tempfile and rename it over the target.
///
/// The rename is what makes the write atomic: readers either see the old
/// file or the new one, never a partial write.
pub fn write_atomic(path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
    let (path, contents) = (path.as_ref(), contents.as_ref());
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    create_dir_all(&dir).context("create parent directory")?;

    let mut work = tempfile::NamedTempFile::new_in(&dir).context("create tempfile")?;
    work.write_all(contents).context("write tempfile")?;
    work.flush().context("flush tempfile")?;
    work.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("rename tempfile over: {path:?}"))?;
    trace!(?path, bytes = contents.len(), "write file (atomic)");
    Ok(())
}

/// Write the file atomically, but only when its contents differ.
///
/// Skipping the no-op write preserves the target's mtime, which is what
/// keeps unchanged registry and output files from cascading rebuilds.
/// Returns whether a write happened.
pub fn write_if_differ(path: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<bool> {
    let (path, contents) = (path.as_ref(), contents.as_ref());
    if let Some(existing) = read_optional(path)?
        && existing == contents
    {
        trace!(?path, "write skipped (contents unchanged)");
        return Ok(false);
    }
    write_atomic(path, contents)?;
    Ok(true)
}

/// Atomically create a file that may only ever hold `contents`.
///
/// Concurrent creators racing on the same path are fine: the rename either
/// wins or loses against an identical file. When the target already exists
/// its content is verified rather than trusted, so a hash collision or a
/// corrupted file surfaces here instead of as a wrong build.
pub fn ensure_file_with_contents(path: impl AsRef<Path>, contents: impl AsRef<str>) -> Result<()> {
    let (path, contents) = (path.as_ref(), contents.as_ref());
    match read_optional(path)? {
        None => {
            write_atomic(path, contents)?;
            Ok(())
        }
        Some(existing) if existing == contents => Ok(()),
        Some(_) => bail!("file {path:?} exists with different contents"),
    }
}

/// Create the file if absent and bump its mtime.
pub fn touch(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent).context("create parent directory")?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .with_context(|| format!("touch file: {path:?}"))?;
    file.set_modified(std::time::SystemTime::now())
        .with_context(|| format!("set mtime: {path:?}"))?;
    trace!(?path, "touch file");
    Ok(())
}
