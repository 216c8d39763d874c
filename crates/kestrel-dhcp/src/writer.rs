//! Atomic file replacement
//!
//! The generated file is written to a temporary file in the target
//! directory and renamed over the destination, so the daemon never reads a
//! half-written configuration.

use crate::error::{DhcpError, Result};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

/// Replace `path` with `contents` atomically.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let write_err = |source: std::io::Error| DhcpError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(contents.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    debug!(path = %path.display(), bytes = contents.len(), "file replaced");
    Ok(())
}

/// Read the currently installed file, `None` if it does not exist
pub fn read_current(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DhcpError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dhcpd.conf");

        assert_eq!(read_current(&path).unwrap(), None);

        write_atomic(&path, "first\n").unwrap();
        assert_eq!(read_current(&path).unwrap().as_deref(), Some("first\n"));

        write_atomic(&path, "second\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second\n");

        // No temp files left behind
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn test_write_atomic_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dhcp/dhcpd.conf");
        write_atomic(&path, "x").unwrap();
        assert!(path.exists());
    }
}
