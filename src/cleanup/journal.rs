//! File access-time journals consulted by time-based cleanup

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{from_millis, to_millis, Clock};
use crate::error::Result;

/// Remembers when cache entries were last used
pub trait FileAccessTimeJournal: Send + Sync {
    fn set_last_access_time(&self, file: &Path, time: SystemTime) -> Result<()>;

    /// Last access of `file`. Unknown files report a time no later than
    /// when tracking started, so they are not deleted prematurely.
    fn get_last_access_time(&self, file: &Path) -> Result<SystemTime>;

    fn delete_last_access_time(&self, file: &Path) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JournalContents {
    inception_millis: u64,
    entries: BTreeMap<PathBuf, u64>,
}

/// Journal persisted as a JSON file
///
/// Every change is written through, replacing the file atomically.
#[derive(Debug)]
pub struct IndexedFileAccessTimeJournal {
    journal_file: PathBuf,
    contents: Mutex<JournalContents>,
}

impl IndexedFileAccessTimeJournal {
    /// Load the journal at `journal_file`, starting a new one if missing
    pub fn open(journal_file: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        let contents = match fs::read(journal_file) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Starting file access journal {}", journal_file.display());
                JournalContents {
                    inception_millis: to_millis(clock.now()),
                    entries: BTreeMap::new(),
                }
            }
            Err(e) => return Err(e.into()),
        };
        let journal = Self {
            journal_file: journal_file.to_path_buf(),
            contents: Mutex::new(contents),
        };
        journal.persist(&journal.contents.lock())?;
        Ok(journal)
    }

    /// When tracking started
    pub fn inception(&self) -> SystemTime {
        from_millis(self.contents.lock().inception_millis)
    }

    pub fn len(&self) -> usize {
        self.contents.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.lock().entries.is_empty()
    }

    fn persist(&self, contents: &JournalContents) -> Result<()> {
        if let Some(parent) = self.journal_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.journal_file.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(contents)?)?;
        fs::rename(&tmp, &self.journal_file)?;
        Ok(())
    }
}

impl FileAccessTimeJournal for IndexedFileAccessTimeJournal {
    fn set_last_access_time(&self, file: &Path, time: SystemTime) -> Result<()> {
        let mut contents = self.contents.lock();
        contents.entries.insert(file.to_path_buf(), to_millis(time));
        self.persist(&contents)
    }

    fn get_last_access_time(&self, file: &Path) -> Result<SystemTime> {
        let contents = self.contents.lock();
        let millis = contents
            .entries
            .get(file)
            .copied()
            .unwrap_or(contents.inception_millis);
        Ok(from_millis(millis))
    }

    fn delete_last_access_time(&self, file: &Path) -> Result<()> {
        let mut contents = self.contents.lock();
        if contents.entries.remove(file).is_some() {
            self.persist(&contents)?;
        }
        Ok(())
    }
}

/// Uses the modification time of the entry itself
#[derive(Debug, Clone, Copy, Default)]
pub struct ModificationTimeFileAccessTimeJournal;

impl FileAccessTimeJournal for ModificationTimeFileAccessTimeJournal {
    fn set_last_access_time(&self, file: &Path, time: SystemTime) -> Result<()> {
        fs::File::open(file)?.set_modified(time)?;
        Ok(())
    }

    fn get_last_access_time(&self, file: &Path) -> Result<SystemTime> {
        Ok(fs::metadata(file)?.modified()?)
    }

    fn delete_last_access_time(&self, _file: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::ManualClock;
    use std::time::Duration;

    #[test]
    fn test_unknown_files_report_inception() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(from_millis(5_000)));
        let journal = IndexedFileAccessTimeJournal::open(&dir.path().join("journal.json"), clock).unwrap();
        assert_eq!(
            journal.get_last_access_time(Path::new("/nowhere")).unwrap(),
            from_millis(5_000)
        );
    }

    #[test]
    fn test_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let clock = Arc::new(ManualClock::new(from_millis(1_000)));
        {
            let journal = IndexedFileAccessTimeJournal::open(&path, clock.clone()).unwrap();
            journal
                .set_last_access_time(Path::new("/a"), from_millis(9_000))
                .unwrap();
            journal
                .set_last_access_time(Path::new("/b"), from_millis(8_000))
                .unwrap();
            journal.delete_last_access_time(Path::new("/b")).unwrap();
        }
        clock.advance(Duration::from_secs(100));
        let journal = IndexedFileAccessTimeJournal::open(&path, clock).unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.inception(), from_millis(1_000));
        assert_eq!(
            journal.get_last_access_time(Path::new("/a")).unwrap(),
            from_millis(9_000)
        );
        assert_eq!(
            journal.get_last_access_time(Path::new("/b")).unwrap(),
            from_millis(1_000)
        );
    }

    #[test]
    fn test_modification_time_journal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("entry");
        fs::write(&file, b"x").unwrap();
        let journal = ModificationTimeFileAccessTimeJournal;
        journal
            .set_last_access_time(&file, from_millis(1_600_000_000_000))
            .unwrap();
        assert_eq!(
            journal.get_last_access_time(&file).unwrap(),
            from_millis(1_600_000_000_000)
        );
    }
}
