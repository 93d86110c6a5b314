//! Small filesystem helpers shared by the WAL's index sidecar and any CLI
//! command that needs to write a file atomically.

use std::io::prelude::*;

use camino::Utf8Path;

use crate::error::{DirError, Kind};

fn io_err(path: &Utf8Path, e: impl std::fmt::Display) -> DirError {
    DirError::new(Kind::Io, path.as_std_path(), e.to_string())
}

/// Reads and checks for the given magic bytes at the start of a reader.
pub fn check_magic<R: Read>(r: &mut R, path: &Utf8Path, expected: &[u8; 8]) -> Result<(), DirError> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(|e| io_err(path, e))?;
    if &magic != expected {
        return Err(DirError::new(
            Kind::Invalid,
            path.as_std_path(),
            format!("expected magic bytes {expected:?}, found {magic:?}"),
        ));
    }
    Ok(())
}

/// Writes `contents` to `path` atomically: the bytes land in a sibling
/// temp file in the same directory first, get `fsync`'d, then are renamed
/// over `path`. `path` never observes a partial write, which is what the
/// WAL's index sidecar and the `access` cache's on-disk snapshot need.
pub fn atomic_write(path: &Utf8Path, contents: &[u8]) -> Result<(), DirError> {
    let dir = path
        .parent()
        .ok_or_else(|| DirError::new(Kind::Invalid, path.as_std_path(), "path has no parent directory"))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(|e| io_err(path, e))?;
    tmp.write_all(contents).map_err(|e| io_err(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}
