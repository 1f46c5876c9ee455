//! File-backed exclusive lease guarding "one run at a time".
//!
//! The lease is a marker file whose content is the owning run id. Creation
//! uses `create_new`, so two concurrent acquirers can never both succeed.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

/// Atomically creates the lease file and writes `owner_id` into it.
///
/// Returns `Ok(false)` without touching the file when it already exists.
pub fn acquire(lease_path: &Path, owner_id: &str) -> io::Result<bool> {
    if let Some(parent) = lease_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = match OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lease_path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(err),
    };

    if let Err(err) = file.write_all(owner_id.as_bytes()).and_then(|()| file.flush()) {
        // Never leave an ownerless lease behind.
        let _ = fs::remove_file(lease_path);
        return Err(err);
    }

    Ok(true)
}

/// Removes the lease. Missing file is not an error.
pub fn release(lease_path: &Path) -> io::Result<()> {
    match fs::remove_file(lease_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

pub fn exists(lease_path: &Path) -> bool {
    lease_path.exists()
}

/// Run id recorded in the lease, if the lease is held and readable.
pub fn owner(lease_path: &Path) -> Option<String> {
    fs::read_to_string(lease_path)
        .ok()
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}

/// Scoped ownership of a held lease; dropping it releases the lease.
#[derive(Debug)]
pub struct RunLease {
    path: PathBuf,
    owner_id: String,
    released: bool,
}

impl RunLease {
    /// Returns `None` when another run already holds the lease.
    pub fn try_acquire(lease_path: &Path, owner_id: &str) -> io::Result<Option<Self>> {
        if !acquire(lease_path, owner_id)? {
            return Ok(None);
        }

        Ok(Some(Self {
            path: lease_path.to_path_buf(),
            owner_id: owner_id.to_string(),
            released: false,
        }))
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Releases now and reports the outcome; `Drop` becomes a no-op.
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        release(&self.path)
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release(&self.path) {
            warn!(
                run_id = %self.owner_id,
                lease_path = %self.path.display(),
                error = %err,
                "Failed to release run lease; future runs stay blocked until it is removed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lease_path = temp.path().join("run.lock");

        assert!(acquire(&lease_path, "run-1").expect("first acquire"));
        assert!(exists(&lease_path));
        assert!(!acquire(&lease_path, "run-2").expect("second acquire"));
        assert_eq!(owner(&lease_path).as_deref(), Some("run-1"));

        release(&lease_path).expect("release");
        assert!(!exists(&lease_path));

        assert!(acquire(&lease_path, "run-2").expect("acquire after release"));
        assert_eq!(owner(&lease_path).as_deref(), Some("run-2"));
    }

    #[test]
    fn release_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lease_path = temp.path().join("run.lock");

        release(&lease_path).expect("release absent lease");
        assert!(acquire(&lease_path, "run-1").expect("acquire"));
        release(&lease_path).expect("release");
        release(&lease_path).expect("release again");
        assert!(owner(&lease_path).is_none());
    }

    #[test]
    fn acquire_creates_missing_parent_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lease_path = temp.path().join("nested").join("data").join("run.lock");

        assert!(acquire(&lease_path, "run-1").expect("acquire"));
        assert!(exists(&lease_path));
    }

    #[test]
    fn guard_releases_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lease_path = temp.path().join("run.lock");

        {
            let guard = RunLease::try_acquire(&lease_path, "run-1")
                .expect("acquire")
                .expect("lease free");
            assert_eq!(guard.owner_id(), "run-1");
            assert!(RunLease::try_acquire(&lease_path, "run-2")
                .expect("acquire")
                .is_none());
        }

        assert!(!exists(&lease_path));
    }

    #[test]
    fn guard_releases_when_task_panics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lease_path = temp.path().join("run.lock");
        let guard = RunLease::try_acquire(&lease_path, "run-1")
            .expect("acquire")
            .expect("lease free");

        let outcome = std::thread::spawn(move || {
            let _guard = guard;
            panic!("run task blew up");
        })
        .join();

        assert!(outcome.is_err());
        assert!(!exists(&lease_path));
    }

    #[test]
    fn explicit_release_disarms_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let lease_path = temp.path().join("run.lock");
        let guard = RunLease::try_acquire(&lease_path, "run-1")
            .expect("acquire")
            .expect("lease free");

        guard.release().expect("release");
        assert!(acquire(&lease_path, "run-2").expect("reacquire"));
        assert_eq!(owner(&lease_path).as_deref(), Some("run-2"));
    }
}
