// State module - Persistent storage for container records

use crate::container::{ContainerId, ContainerRecord};
use crate::error::{BerthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Version of the state file format
const STATE_VERSION: &str = "1.0.0";

/// On-disk form of one container record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedContainer {
    pub version: String,
    pub record: ContainerRecord,
    pub saved_at: DateTime<Utc>,
}

impl PersistedContainer {
    pub fn new(record: ContainerRecord) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            record,
            saved_at: Utc::now(),
        }
    }

    /// Validate the persisted structure against the file it was read from
    pub fn validate(&self, expected_id: &str) -> Result<()> {
        if self.version != STATE_VERSION {
            return Err(BerthError::StateCorruption(format!(
                "Incompatible state version: expected {}, found {}",
                STATE_VERSION, self.version
            )));
        }

        if self.record.id.as_str() != expected_id {
            return Err(BerthError::StateCorruption(format!(
                "State file for {} holds container {}",
                expected_id, self.record.id
            )));
        }

        Ok(())
    }
}

/// Directory of per-container state files (`<root>/containers/<id>.json`)
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Open (and create if needed) the state directory
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let state_dir = Self {
            root: root.as_ref().to_path_buf(),
        };

        fs::create_dir_all(state_dir.containers_dir()).map_err(|e| {
            BerthError::StateError(format!(
                "Failed to create state directory {}: {}",
                state_dir.root.display(),
                e
            ))
        })?;

        Ok(state_dir)
    }

    fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    fn record_path(&self, id: &ContainerId) -> PathBuf {
        self.containers_dir().join(format!("{}.json", id))
    }

    /// Save a record with an atomic write
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let temp_path = path.with_extension("tmp");

        {
            let file = File::create(&temp_path).map_err(|e| {
                BerthError::StateSaveError(format!("Failed to create temp state file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);

            serde_json::to_writer_pretty(&mut writer, &PersistedContainer::new(record.clone()))
                .map_err(|e| {
                    BerthError::StateSaveError(format!("Failed to serialize container: {}", e))
                })?;

            writer.flush().map_err(|e| {
                BerthError::StateSaveError(format!("Failed to flush state file: {}", e))
            })?;
        }

        fs::rename(&temp_path, &path).map_err(|e| {
            BerthError::StateSaveError(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    /// Load one record
    pub fn load(&self, id: &ContainerId) -> Result<ContainerRecord> {
        Self::load_file(&self.record_path(id), id.as_str())
    }

    fn load_file(path: &Path, expected_id: &str) -> Result<ContainerRecord> {
        let file = File::open(path).map_err(|e| {
            BerthError::StateLoadError(format!("Failed to open {}: {}", path.display(), e))
        })?;

        let persisted: PersistedContainer = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| {
                BerthError::StateLoadError(format!("Failed to parse {}: {}", path.display(), e))
            })?;

        persisted.validate(expected_id)?;
        Ok(persisted.record)
    }

    /// Load every readable record. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<ContainerRecord>> {
        let entries = fs::read_dir(self.containers_dir()).map_err(|e| {
            BerthError::StateLoadError(format!("Failed to read state directory: {}", e))
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match Self::load_file(&path, id) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping container state {}: {}", path.display(), e),
            }
        }

        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Delete the state file of a removed container
    pub fn delete(&self, id: &ContainerId) -> Result<()> {
        let path = self.record_path(id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                BerthError::StateError(format!("Failed to delete state file: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContainerConfig;
    use crate::container::LifecycleState;
    use tempfile::TempDir;

    fn record(name: &str) -> ContainerRecord {
        ContainerRecord::new(
            ContainerId::generate(),
            ContainerConfig::new(name, "/bin/sleep", &["30"]),
        )
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = StateDir::open(temp_dir.path()).unwrap();

        let mut original = record("web");
        original.state = LifecycleState::Running;
        original.pid = Some(4242);
        original.restart_count = 3;
        state_dir.save(&original).unwrap();

        let loaded = state_dir.load(&original.id).unwrap();
        assert_eq!(loaded.id, original.id);
        assert_eq!(loaded.state, LifecycleState::Running);
        assert_eq!(loaded.pid, Some(4242));
        assert_eq!(loaded.restart_count, 3);
        assert!(!temp_dir
            .path()
            .join("containers")
            .join(format!("{}.tmp", original.id))
            .exists());
    }

    #[test]
    fn test_load_all_skips_corrupt_files() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = StateDir::open(temp_dir.path()).unwrap();

        state_dir.save(&record("a")).unwrap();
        state_dir.save(&record("b")).unwrap();
        fs::write(temp_dir.path().join("containers/broken.json"), "{ not json").unwrap();
        fs::write(temp_dir.path().join("containers/notes.txt"), "ignored").unwrap();

        let records = state_dir.load_all().unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_version_mismatch_is_corruption() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = StateDir::open(temp_dir.path()).unwrap();
        let rec = record("old");

        let mut persisted = PersistedContainer::new(rec.clone());
        persisted.version = "0.1.0".to_string();
        fs::write(
            temp_dir.path().join(format!("containers/{}.json", rec.id)),
            serde_json::to_string(&persisted).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            state_dir.load(&rec.id),
            Err(BerthError::StateCorruption(_))
        ));
    }

    #[test]
    fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let state_dir = StateDir::open(temp_dir.path()).unwrap();
        let rec = record("gone");

        state_dir.save(&rec).unwrap();
        state_dir.delete(&rec.id).unwrap();
        assert!(state_dir.load(&rec.id).is_err());

        // Deleting twice is fine
        assert!(state_dir.delete(&rec.id).is_ok());
    }
}
