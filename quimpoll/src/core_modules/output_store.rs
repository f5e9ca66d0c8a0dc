// THEORY:
// The `OutputStore` is the directory that holds the artifacts of exactly one run:
// the annotated image or video and one JPEG per reported gesture. It is shared by
// the whole process, so it lives behind a `tokio::sync::RwLock`. A run holds the
// write guard until its report is published; video readers hold read guards and
// never see a half-rewritten store.
//
// A run never writes into the store directly. It writes into a `StagedRun`
// directory under the store, and only a successful run commits: the previous
// artifacts are cleared and the staged files are moved in. A failed run drops its
// `StagedRun`, which deletes the staging directory and leaves the previous
// artifacts untouched.

use crate::core_modules::media_encoder::{OUTPUT_VIDEO, encode_jpeg};
use image::RgbImage;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub type SharedOutputStore = Arc<RwLock<OutputStore>>;

/// Subdirectory of the store that holds the artifacts of the run in progress.
pub const STAGING_DIR: &str = ".staging";

#[derive(Debug)]
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    /// Opens (creating if needed) the store directory.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn shared(self) -> SharedOutputStore {
        Arc::new(RwLock::new(self))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn video_path(&self) -> PathBuf {
        self.path(OUTPUT_VIDEO)
    }

    /// Removes every regular file from the store. Subdirectories are left alone.
    pub fn clear(&mut self) -> io::Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        debug!(dir = %self.dir.display(), removed, "output store cleared");
        Ok(removed)
    }

    /// Starts a fresh staging directory, discarding leftovers of a crashed run.
    ///
    /// Takes `&mut self` so only the holder of the write guard can stage.
    pub fn stage(&mut self) -> io::Result<StagedRun> {
        let dir = self.path(STAGING_DIR);
        match fs::remove_dir_all(&dir) {
            Ok(()) => warn!(dir = %dir.display(), "removed stale staging directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::create_dir_all(&dir)?;
        Ok(StagedRun { dir })
    }

    /// Replaces the store's artifacts with the staged ones. Returns how many
    /// files were moved in.
    pub fn commit(&mut self, staged: StagedRun) -> io::Result<usize> {
        self.clear()?;
        let mut moved = 0;
        for entry in fs::read_dir(&staged.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::rename(entry.path(), self.dir.join(entry.file_name()))?;
                moved += 1;
            }
        }
        debug!(dir = %self.dir.display(), moved, "staged run committed");
        Ok(moved)
    }
}

/// The working directory of one run. Dropping it deletes whatever is left in it.
#[derive(Debug)]
pub struct StagedRun {
    dir: PathBuf,
}

impl StagedRun {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn video_path(&self) -> PathBuf {
        self.path(OUTPUT_VIDEO)
    }

    pub fn write_jpeg(
        &self,
        name: &str,
        image: &RgbImage,
        quality: u8,
    ) -> image::ImageResult<PathBuf> {
        let path = self.path(name);
        fs::write(&path, encode_jpeg(image, quality)?)?;
        Ok(path)
    }

    pub fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name))
    }
}

impl Drop for StagedRun {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove staging directory");
            }
        }
    }
}
