//! Test support: scratch directories and log capture.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Root for all test scratch space.
const SCRATCH_ROOT: &str = "/tmp/emberdb_tests";

/// Distinguishes directories created by the same test process.
static NEXT_DIR_ID: AtomicU64 = AtomicU64::new(0);

/// A uniquely named scratch directory, removed on drop.
pub(crate) struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub(crate) fn new() -> std::io::Result<TempDir> {
        let id = NEXT_DIR_ID.fetch_add(1, Ordering::SeqCst);
        let path =
            Path::new(SCRATCH_ROOT).join(format!("{}-{id:04}", std::process::id()));
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        fs::create_dir_all(&path)?;
        Ok(TempDir { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// Routes engine logs into the test harness's captured output. Safe to
/// call from every test; only the first caller installs the subscriber.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
