//! Directory-backed spill store.
//!
//! Each batch is one `<batch_id>.cbor` file. Writes go to a `.tmp` sibling
//! first and are renamed into place, so a crash mid-write leaves either the
//! complete file or nothing a reader will pick up.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use z_meter_core::{Batch, BatchId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::{decode, encode, SpillStore};

/// Spill store writing one file per batch.
#[derive(Debug, Clone)]
pub struct FileSpillStore {
    dir: PathBuf,
}

impl FileSpillStore {
    /// Open (creating if needed) a spill directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the batch files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, batch_id: &BatchId) -> PathBuf {
        self.dir.join(keys::batch_file_name(batch_id))
    }

    /// Batch IDs of all complete files, oldest first.
    fn stored_ids(&self) -> Result<Vec<BatchId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(id) = entry.file_name().to_str().and_then(keys::batch_id_from_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl SpillStore for FileSpillStore {
    fn append(&self, batch: &Batch) -> Result<()> {
        let path = self.path_for(&batch.batch_id);
        let tmp = path.with_extension(format!("{}.tmp", keys::BATCH_FILE_EXT));
        let data = encode(batch)?;

        if let Err(e) = write_then_rename(&tmp, &path, &data) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %tmp.display(),
                        error = %cleanup,
                        "Failed to remove partial spill file"
                    );
                }
            }
            return Err(e.into());
        }

        tracing::debug!(
            batch_id = %batch.batch_id,
            path = %path.display(),
            "Spilled batch to file"
        );
        Ok(())
    }

    fn pending(&self, limit: usize) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        for id in self.stored_ids()? {
            if batches.len() >= limit {
                break;
            }
            let path = self.path_for(&id);
            let data = match fs::read(&path) {
                Ok(data) => data,
                // Removed by a concurrent resend between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match decode::<Batch>(&data) {
                Ok(batch) => batches.push(batch),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable spill file"
                    );
                }
            }
        }
        Ok(batches)
    }

    fn remove(&self, batch_id: &BatchId) -> Result<()> {
        match fs::remove_file(self.path_for(batch_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn len(&self) -> Result<usize> {
        Ok(self.stored_ids()?.len())
    }
}

fn write_then_rename(tmp: &Path, path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::batch;
    use tempfile::TempDir;

    fn create_test_store() -> (FileSpillStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileSpillStore::open(dir.path().join("spill")).unwrap();
        (store, dir)
    }

    #[test]
    fn append_and_read_back() {
        let (store, _dir) = create_test_store();
        let original = batch(3);

        store.append(&original).unwrap();

        let pending = store.pending(10).unwrap();
        assert_eq!(pending, vec![original]);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn pending_is_oldest_first_and_limited() {
        let (store, _dir) = create_test_store();
        let first = batch(1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = batch(2);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let third = batch(3);

        // Written out of order on purpose.
        store.append(&third).unwrap();
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let ids: Vec<_> = store.pending(2).unwrap().into_iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![first.batch_id, second.batch_id]);
    }

    #[test]
    fn re_appending_does_not_duplicate() {
        let (store, _dir) = create_test_store();
        let b = batch(2);
        store.append(&b).unwrap();
        store.append(&b).unwrap();
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn remove_deletes_and_reports_missing() {
        let (store, _dir) = create_test_store();
        let b = batch(1);
        store.append(&b).unwrap();

        store.remove(&b.batch_id).unwrap();
        assert!(store.is_empty().unwrap());
        assert!(matches!(store.remove(&b.batch_id), Err(StoreError::NotFound)));
    }

    #[test]
    fn corrupt_files_are_skipped() {
        let (store, _dir) = create_test_store();
        let good = batch(1);
        store.append(&good).unwrap();
        let garbage = store.dir().join(keys::batch_file_name(&BatchId::generate()));
        fs::write(garbage, b"garbage").unwrap();

        let pending = store.pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].batch_id, good.batch_id);
    }

    #[test]
    fn failed_write_leaves_no_temp_file() {
        let (store, _dir) = create_test_store();
        let b = batch(2);
        // A non-empty directory in the way makes the rename fail.
        let blocker = store.dir().join(keys::batch_file_name(&b.batch_id));
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        assert!(matches!(store.append(&b), Err(StoreError::Io(_))));

        let leftovers: Vec<_> = fs::read_dir(store.dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn survives_reopen() {
        let (store, dir) = create_test_store();
        let b = batch(4);
        store.append(&b).unwrap();
        drop(store);

        let reopened = FileSpillStore::open(dir.path().join("spill")).unwrap();
        assert_eq!(reopened.pending(10).unwrap()[0].len(), 4);
    }
}
