#![allow(dead_code)]
use std::path::{Path, PathBuf};
use std::time::Duration;

use shm_map::Options;

/// Options that give up quickly on a contended lock.
pub fn impatient() -> Options {
    Options::new().lock_timeout(Duration::from_millis(100))
}

/// An arena path in a fresh directory. Its lock block is removed when the test ends.
pub struct Scratch {
    dir: tempfile::TempDir,
    pub path: PathBuf,
}

impl Scratch {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("to create a scratch directory");
        let path = dir.path().join("arena.map");
        Scratch { dir, path }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// The path the lock block is named after.
    pub fn lock_path(&self) -> PathBuf {
        self.dir
            .path()
            .canonicalize()
            .expect("to resolve the scratch directory")
            .join("arena.map")
    }

    pub fn file_len(&self) -> u64 {
        std::fs::metadata(&self.path).expect("to stat the arena").len()
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = shm_map::remove_lock_block(&self.path);
    }
}

/// The pid of a process that has exited.
pub fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("to spawn `true`");
    let pid = child.id();
    child.wait().expect("to reap `true`");
    pid
}
