//! Crash-safe file replacement shared by the document store and the config
//! writer.

use std::io::Write;
use std::path::Path;

use crate::error::{InsiderError, Result};

/// Replace `path` with `contents` in one rename.
///
/// Each call writes to its own uniquely named temp file in the target
/// directory, so concurrent writers never share a partial file and readers
/// see either the old or the new contents.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| InsiderError::io(dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".mcpinsider-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| InsiderError::io(dir, e))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.flush())
        .map_err(|e| InsiderError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| InsiderError::io(path, e.error))?;
    Ok(())
}
