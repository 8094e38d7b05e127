use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fs2::FileExt;

use super::config::TestInstance;
use crate::error::{AbTestError, Result};

/// Storage of per-subject test state.
///
/// `save` overwrites the whole instance; a failed save must leave the
/// previously stored instance readable.
pub trait TestStore: Send + Sync {
    /// Stored instance, or a default one when the subject has none yet.
    fn load(&self, test_id: &str, subject_id: u64) -> Result<TestInstance>;
    fn save(&self, test_id: &str, subject_id: u64, instance: &TestInstance) -> Result<()>;
    /// Subjects with stored state for `test_id`, ascending.
    fn subjects(&self, test_id: &str) -> Result<Vec<u64>>;

    /// Hold off other writers of this pair until the guard is dropped.
    /// Stores private to one process need nothing beyond the controller's
    /// own pair mutex.
    fn lock(&self, _test_id: &str, _subject_id: u64) -> Result<StoreGuard> {
        Ok(StoreGuard::default())
    }
}

/// Released on drop.
#[derive(Debug, Default)]
pub struct StoreGuard(Option<File>);

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.0 {
            let _ = FileExt::unlock(file);
        }
    }
}

// ── In-memory ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTestStore {
    instances: DashMap<(String, u64), TestInstance>,
}

impl MemoryTestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestStore for MemoryTestStore {
    fn load(&self, test_id: &str, subject_id: u64) -> Result<TestInstance> {
        Ok(self
            .instances
            .get(&(test_id.to_string(), subject_id))
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    fn save(&self, test_id: &str, subject_id: u64, instance: &TestInstance) -> Result<()> {
        self.instances
            .insert((test_id.to_string(), subject_id), instance.clone());
        Ok(())
    }

    fn subjects(&self, test_id: &str) -> Result<Vec<u64>> {
        let mut ids: Vec<u64> = self
            .instances
            .iter()
            .filter(|entry| entry.key().0 == test_id)
            .map(|entry| entry.key().1)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

// ── File-backed ─────────────────────────────────────────────────────

const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// JSON files under `<data_dir>/.abtests/<test_id>/<subject_id>.json`.
///
/// Every call goes to disk so that separate processes sharing the data
/// directory (the evaluation daemon and one-off configuration commands)
/// always see each other's writes.
pub struct FileTestStore {
    dir: PathBuf,
}

impl FileTestStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join(".abtests");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn instance_path(&self, test_id: &str, subject_id: u64) -> PathBuf {
        self.dir.join(test_id).join(format!("{}.json", subject_id))
    }

    fn atomic_write(&self, test_id: &str, subject_id: u64, instance: &TestInstance) -> Result<()> {
        let test_dir = self.dir.join(test_id);
        std::fs::create_dir_all(&test_dir)?;
        let tmp_path = test_dir.join(format!("{}.json.tmp", subject_id));
        let final_path = test_dir.join(format!("{}.json", subject_id));
        let data = serde_json::to_string_pretty(instance)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }
}

impl TestStore for FileTestStore {
    fn load(&self, test_id: &str, subject_id: u64) -> Result<TestInstance> {
        let data = match std::fs::read_to_string(self.instance_path(test_id, subject_id)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TestInstance::default()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, test_id: &str, subject_id: u64, instance: &TestInstance) -> Result<()> {
        self.atomic_write(test_id, subject_id, instance)
            .map_err(|e| {
                AbTestError::Persistence(format!(
                    "saving {} for subject {}: {}",
                    test_id, subject_id, e
                ))
            })
    }

    fn subjects(&self, test_id: &str) -> Result<Vec<u64>> {
        let entries = match std::fs::read_dir(self.dir.join(test_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(subject_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                ids.push(subject_id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Exclusive advisory lock on `<subject_id>.lock`, shared with every
    /// other process using the same data directory.
    fn lock(&self, test_id: &str, subject_id: u64) -> Result<StoreGuard> {
        let test_dir = self.dir.join(test_id);
        std::fs::create_dir_all(&test_dir)?;
        let path = test_dir.join(format!("{}.lock", subject_id));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let start = Instant::now();
        while FileExt::try_lock_exclusive(&file).is_err() {
            if start.elapsed() >= LOCK_TIMEOUT {
                return Err(AbTestError::Persistence(format!(
                    "lock on {} timed out after {:?}",
                    path.display(),
                    start.elapsed()
                )));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(StoreGuard(Some(file)))
    }
}
