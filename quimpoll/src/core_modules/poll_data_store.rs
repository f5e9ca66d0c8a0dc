// THEORY:
// The `PollDataStore` owns the single report that polling clients read. Readers
// must only ever see a complete document: either the one from the previous run or
// the one from the run that just finished.
//
// Two mechanisms provide that:
// 1.  **Atomic Persistence**: the JSON is written to a sibling temp file, synced,
//     and renamed over the target, so the file on disk is never half-written.
// 2.  **Pointer Swap**: the in-memory copy is an `Arc<PollData>` replaced under a
//     lock. A reader clones the `Arc` and keeps a consistent snapshot no matter
//     what a later run does.

use crate::core_modules::poll_data::PollData;
use crate::error::{StoreError, StoreResult};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

#[derive(Debug)]
pub struct PollDataStore {
    path: PathBuf,
    current: RwLock<Option<Arc<PollData>>>,
}

impl PollDataStore {
    /// Opens the store at `path`, picking up a report persisted by an earlier process.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let current = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PollData>(&bytes) {
                Ok(data) => {
                    info!(path = %path.display(), "loaded previous report");
                    Some(Arc::new(data))
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable report");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            current: RwLock::new(current),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists `doc` and makes it the document every subsequent read returns.
    pub fn update(&self, doc: PollData) -> StoreResult<Arc<PollData>> {
        let json = serde_json::to_vec_pretty(&doc)?;
        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        let doc = Arc::new(doc);
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current = Some(doc.clone());
        Ok(doc)
    }

    /// The last published document.
    pub fn read(&self) -> StoreResult<Arc<PollData>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(StoreError::NotYetAvailable)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::output_store::tests::scratch_dir;
    use std::thread;

    fn generation(n: u32) -> PollData {
        let mut doc = PollData::default();
        doc.people_detected.count = n;
        doc.people_detected.media = format!("frame-{n}");
        for i in 0..n {
            doc.record_gesture(&format!("gen{n}"), format!("crop-{n}-{i}"));
        }
        doc
    }

    fn assert_consistent(doc: &PollData) {
        let n = doc.people_detected.count;
        assert_eq!(doc.people_detected.media, format!("frame-{n}"));
        assert_eq!(doc.gestures_detected.count, n);
        assert_eq!(doc.gestures_detected.media.len() as u32, n);
        if n > 0 {
            assert_eq!(doc.gestures_detected.gestures.get(&format!("gen{n}")), Some(&n));
        }
    }

    #[test]
    fn read_before_any_run_is_not_available() {
        let dir = scratch_dir("poll-empty");
        let store = PollDataStore::open(dir.join("data.json")).unwrap();
        assert!(matches!(store.read(), Err(StoreError::NotYetAvailable)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn update_replaces_and_persists() {
        let dir = scratch_dir("poll-persist");
        let path = dir.join("data.json");
        let store = PollDataStore::open(&path).unwrap();
        store.update(generation(1)).unwrap();
        store.update(generation(2)).unwrap();
        assert_eq!(*store.read().unwrap(), generation(2));
        assert!(!store.temp_path().exists());

        let reopened = PollDataStore::open(&path).unwrap();
        assert_eq!(*reopened.read().unwrap(), generation(2));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_on_disk_reads_as_not_available() {
        let dir = scratch_dir("poll-corrupt");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("data.json"), b"{\"people_detected\":").unwrap();
        let store = PollDataStore::open(dir.join("data.json")).unwrap();
        assert!(matches!(store.read(), Err(StoreError::NotYetAvailable)));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn racing_readers_only_see_complete_documents() {
        let dir = scratch_dir("poll-race");
        let path = dir.join("data.json");
        let store = Arc::new(PollDataStore::open(&path).unwrap());
        store.update(generation(0)).unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let path = path.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        assert_consistent(&store.read().unwrap());
                        let bytes = fs::read(&path).unwrap();
                        let on_disk: PollData = serde_json::from_slice(&bytes).unwrap();
                        assert_consistent(&on_disk);
                    }
                })
            })
            .collect();

        for n in 1..50 {
            store.update(generation(n)).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        let _ = fs::remove_dir_all(&dir);
    }
}
