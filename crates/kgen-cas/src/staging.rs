//! Staging: private scratch files that become visible only when published.
//!
//! Every durable write goes through a staged file: write, fsync, then publish
//! with a single link or rename into its final path. A writer that crashes or
//! is cancelled before publishing leaves only an unnamed-by-address file in
//! the staging directory, never a partial object.
//!
//! Layout:
//! ```text
//! {base_path}/
//! ├── objects/...
//! └── staging/
//!     └── 3f2a...e1     # in-progress writes (random names)
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{IoContext, Result};

/// Outcome of a no-clobber publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    Created,
    AlreadyExists,
}

/// Directory holding in-progress writes.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
}

impl StagingArea {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new staged file.
    pub fn create(&self) -> Result<StagedFile> {
        fs::create_dir_all(&self.dir)
            .io_context(|| format!("create staging directory {}", self.dir.display()))?;

        let path = self.dir.join(Uuid::new_v4().simple().to_string());
        let file = File::create(&path)
            .io_context(|| format!("create staging file {}", path.display()))?;

        Ok(StagedFile {
            path,
            file: Some(file),
            bytes_written: 0,
            published: false,
        })
    }

    /// Stage a complete buffer and sync it.
    pub fn stage(&self, data: &[u8]) -> Result<StagedFile> {
        let mut staged = self.create()?;
        staged.write(data)?;
        staged.sync()?;
        Ok(staged)
    }

    /// Remove staging files last modified before `older_than` ago.
    ///
    /// Only leftovers from crashed writers should be that old; live writers
    /// publish within one call.
    pub fn clean(&self, older_than: Duration) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).io_context(|| format!("read {}", self.dir.display())),
        };

        let cutoff = SystemTime::now()
            .checked_sub(older_than)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for entry in entries {
            let entry = entry.io_context(|| format!("read {}", self.dir.display()))?;
            let modified = entry.metadata().and_then(|m| m.modified());
            match modified {
                Ok(modified) if modified < cutoff => match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove stale staging file"),
                },
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).io_context(|| format!("stat {}", entry.path().display())),
            }
        }

        if removed > 0 {
            debug!(removed, "removed stale staging files");
        }
        Ok(removed)
    }
}

/// A handle to a staging file.
///
/// Dropping an unpublished handle deletes the file.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    published: bool,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let path = &self.path;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("staging file already closed"))
            .io_context(|| format!("write {}", path.display()))?;
        file.write_all(data)
            .io_context(|| format!("write {}", path.display()))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flush and fsync, then close the handle.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()
                .and_then(|_| file.sync_all())
                .io_context(|| format!("sync {}", self.path.display()))?;
        }
        Ok(())
    }

    /// Publish under `target` unless something is already there.
    ///
    /// A hard link is atomic and never overwrites, so concurrent publishers
    /// of the same target converge on one file. Filesystems without hard
    /// links fall back to rename, which can only replace identical content
    /// for content-addressed targets.
    pub fn publish(mut self, target: &Path) -> Result<Publish> {
        self.sync()?;
        ensure_parent(target)?;

        let outcome = match fs::hard_link(&self.path, target) {
            Ok(()) => Publish::Created,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Publish::AlreadyExists,
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                debug!(error = %e, "hard link unavailable, publishing by rename");
                fs::rename(&self.path, target)
                    .io_context(|| format!("publish {}", target.display()))?;
                self.published = true;
                sync_parent(target)?;
                return Ok(Publish::Created);
            }
            Err(e) => return Err(e).io_context(|| format!("publish {}", target.display())),
        };

        if outcome == Publish::Created {
            sync_parent(target)?;
        }
        // The staged name is released either way; Drop removes it.
        Ok(outcome)
    }

    /// Atomically replace whatever is at `target`.
    pub fn replace(mut self, target: &Path) -> Result<()> {
        self.sync()?;
        ensure_parent(target)?;
        fs::rename(&self.path, target).io_context(|| format!("replace {}", target.display()))?;
        self.published = true;
        sync_parent(target)
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        self.file = None;
        if !self.published {
            if let Err(e) = fs::remove_file(&self.path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "failed to remove staging file");
                }
            }
        }
    }
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("create directory {}", parent.display()))?;
    }
    Ok(())
}

/// Make a new directory entry durable.
#[cfg(unix)]
fn sync_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .io_context(|| format!("sync directory {}", parent.display()))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) -> Result<()> {
    Ok(())
}
