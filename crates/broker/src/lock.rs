// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Singleton guard: one broker per project directory.
//!
//! An advisory exclusive lock on `.agent-relay/broker.lock` is held for the
//! broker's lifetime. The OS releases the lock on process exit, including
//! abnormal termination, so a crashed broker never wedges the directory.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use fs2::FileExt;

/// Returned when another broker already holds the lock. `main` maps this to
/// exit code 1.
#[derive(Debug)]
pub struct AlreadyRunning {
    pub path: PathBuf,
}

impl std::fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "another broker is running (lock held on {})", self.path.display())
    }
}

impl std::error::Error for AlreadyRunning {}

/// Held lock on the broker's project directory. Releasing is automatic: the
/// advisory lock dies with the file handle.
#[derive(Debug)]
pub struct SingletonGuard {
    file: File,
    path: PathBuf,
}

impl SingletonGuard {
    /// Acquire the exclusive advisory lock, creating the state directory and
    /// lock file as needed. Non-blocking: a held lock fails immediately.
    pub fn acquire(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state dir {}", parent.display()))?;
        }

        // Open without truncating: the file may belong to a running broker
        // whose PID we must not wipe before we hold the lock.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(AlreadyRunning { path: path.to_owned() }.into());
        }

        // We own the lock now; record our PID for operators.
        let mut file = file;
        file.set_len(0).context("truncating lock file")?;
        writeln!(file, "{}", std::process::id()).context("writing pid to lock file")?;

        Ok(Self { file, path: path.to_owned() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingletonGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
