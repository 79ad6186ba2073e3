use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::{thread, time::Duration};

/// File-system helpers.
pub struct IOUtil;

impl IOUtil {
    /// Recursively delete a directory, retrying transient failures.
    ///
    /// A missing directory is not an error. A symlink is unlinked, never followed.
    pub fn delete_directory(path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat '{}'", path.display()))
            }
        };

        if meta.file_type().is_symlink() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove symlink '{}'", path.display()))?;
            return Ok(());
        }

        let max_retries = 3;
        let mut last_err = None;

        for attempt in 0..max_retries {
            match fs::remove_dir_all(path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => {
                    tracing::debug!(
                        "Failed to delete '{}' (attempt {}): {}",
                        path.display(),
                        attempt + 1,
                        e
                    );
                    last_err = Some(e);
                    if attempt < max_retries - 1 {
                        thread::sleep(Duration::from_millis(100 * (attempt as u64 + 1)));
                    }
                }
            }
        }

        match last_err {
            Some(e) => Err(e).with_context(|| {
                format!(
                    "Failed to delete directory '{}' after {} retries",
                    path.display(),
                    max_retries
                )
            }),
            None => Ok(()),
        }
    }

    /// Create a directory and all parents, world-writable on unix so that
    /// processes running as another user can exchange files through it.
    pub fn ensure_shared_directory(path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory '{}'", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o777))
                .with_context(|| format!("Failed to set permissions on '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Write `body` to `path`, creating parent directories and applying the
    /// unix permission bits in `mode`.
    pub fn write_file_with_mode(path: &Path, body: &[u8], mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
        }
        fs::write(path, body).with_context(|| format!("Failed to write '{}'", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set permissions on '{}'", path.display()))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    }

    /// The per-user cache root: `$XDG_CACHE_HOME`, else `~/.cache`, else the
    /// current directory.
    pub fn user_cache_dir() -> PathBuf {
        match std::env::var("XDG_CACHE_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => match dirs::home_dir() {
                Some(home) => home.join(".cache"),
                None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_directory_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(IOUtil::delete_directory(&dir.path().join("missing")).is_ok());
    }

    #[test]
    fn delete_directory_works() {
        let dir = tempfile::tempdir().unwrap();
        let inner = dir.path().join("subdir");
        fs::create_dir_all(&inner).unwrap();
        fs::write(inner.join("file.txt"), b"data").unwrap();
        IOUtil::delete_directory(&inner).unwrap();
        assert!(!inner.exists());
    }

    #[cfg(unix)]
    #[test]
    fn write_file_with_mode_sets_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow").join("event.json");
        IOUtil::write_file_with_mode(&path, b"{}", 0o644).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn ensure_shared_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a").join("b");
        IOUtil::ensure_shared_directory(&target).unwrap();
        IOUtil::ensure_shared_directory(&target).unwrap();
        assert!(target.is_dir());
    }
}
