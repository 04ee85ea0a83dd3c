//! Single-instance file lock, preventing a second worker process from
//! racing the single-writer assumption the repository relies on.

use std::fs::OpenOptions;
use std::path::Path;

use fs2::FileExt;

use crate::error::CoreError;

/// Acquires an exclusive lock on `lock_path`, creating the file if needed.
/// The returned handle must be held for the lifetime of the process; the
/// lock is released automatically when it is dropped.
pub fn acquire(lock_path: &Path) -> Result<std::fs::File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)?;
    file.try_lock_exclusive().map_err(|e| {
        CoreError::ConfigIncomplete(format!(
            "another instance holds the lock at {}: {e}",
            lock_path.display()
        ))
    })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_succeeds_on_fresh_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha-watch.lock");
        let _file = acquire(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn acquire_fails_while_another_handle_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha-watch.lock");
        let _held = acquire(&path).unwrap();
        assert!(acquire(&path).is_err());
    }
}
