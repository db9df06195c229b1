// Extension records on disk.
//
// One JSON file per extension id. Each record carries a sha256 checksum over
// its content; loading recomputes it and rejects records that do not match.
// Writes go to a temporary file first and are renamed into place.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::cache::content_hash;
use crate::extensions::{ExtensionState, StateTransition};
use crate::template::{ExtensionId, TemplateExtension};

const RECORD_EXTENSION: &str = "json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode or decode record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Checksum mismatch for extension {extension_id}: expected {expected}, computed {actual}")]
    IntegrityCheckFailed {
        extension_id: ExtensionId,
        expected: String,
        actual: String,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Where and how a record was last written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub path: PathBuf,
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    pub extension: TemplateExtension,
    pub state: ExtensionState,
    pub state_history: Vec<StateTransition>,
    #[serde(default)]
    pub dependencies: Vec<ExtensionId>,
    pub checksum: String,
}

/// Checksummed fields of a record
#[derive(Serialize)]
struct ChecksumView<'a> {
    extension: &'a TemplateExtension,
    state: ExtensionState,
    state_history: &'a [StateTransition],
    dependencies: &'a [ExtensionId],
}

impl ExtensionRecord {
    pub fn new(
        extension: TemplateExtension,
        state: ExtensionState,
        state_history: Vec<StateTransition>,
        dependencies: Vec<ExtensionId>,
    ) -> Result<Self, StorageError> {
        let mut record = Self {
            extension,
            state,
            state_history,
            dependencies,
            checksum: String::new(),
        };
        record.checksum = record.compute_checksum()?;
        Ok(record)
    }

    pub fn compute_checksum(&self) -> Result<String, StorageError> {
        let view = ChecksumView {
            extension: &self.extension,
            state: self.state,
            state_history: &self.state_history,
            dependencies: &self.dependencies,
        };
        Ok(content_hash([serde_json::to_vec(&view)?]))
    }

    pub fn verify(&self) -> Result<(), StorageError> {
        let actual = self.compute_checksum()?;
        if actual != self.checksum {
            return Err(StorageError::IntegrityCheckFailed {
                extension_id: self.extension.id.clone(),
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Everything found in the storage directory
#[derive(Debug, Default)]
pub struct LoadReport {
    pub records: Vec<ExtensionRecord>,
    pub failures: Vec<(PathBuf, StorageError)>,
}

#[derive(Debug, Clone)]
pub struct ExtensionStorage {
    dir: PathBuf,
}

impl ExtensionStorage {
    /// Opens (and creates if needed) the record directory
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: &ExtensionId) -> PathBuf {
        self.dir.join(format!("{}.{}", file_stem(id), RECORD_EXTENSION))
    }

    pub fn save(&self, record: &ExtensionRecord) -> Result<StorageInfo, StorageError> {
        let path = self.path_for(&record.extension.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)?;

        fs::write(&tmp, &bytes).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        debug!("Stored extension {} at {}", record.extension.id, path.display());

        Ok(StorageInfo {
            path,
            checksum: record.checksum.clone(),
            size_bytes: bytes.len() as u64,
        })
    }

    pub fn load(&self, id: &ExtensionId) -> Result<ExtensionRecord, StorageError> {
        self.load_path(&self.path_for(id))
    }

    fn load_path(&self, path: &Path) -> Result<ExtensionRecord, StorageError> {
        let bytes = fs::read(path).map_err(io_error(path))?;
        let record: ExtensionRecord = serde_json::from_slice(&bytes)?;
        record.verify()?;
        Ok(record)
    }

    /// Reads every record; bad files are reported, not fatal
    pub fn load_all(&self) -> Result<LoadReport, StorageError> {
        let mut report = LoadReport::default();
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)
            .map_err(io_error(&self.dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION))
            .collect();
        paths.sort();

        for path in paths {
            match self.load_path(&path) {
                Ok(record) => report.records.push(record),
                Err(e) => {
                    warn!("Skipping extension record {}: {}", path.display(), e);
                    report.failures.push((path, e));
                }
            }
        }
        Ok(report)
    }

    /// True when a record existed
    pub fn remove(&self, id: &ExtensionId) -> Result<bool, StorageError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io { path, source: e }),
        }
    }
}

/// Ids are user-supplied; keep file names portable
fn file_stem(id: &ExtensionId) -> String {
    id.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::RulesPatch;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: &str) -> ExtensionRecord {
        let ext = TemplateExtension::new(id, "Extension", "base").with_rules(RulesPatch::new().deny(["x"]));
        let history = vec![StateTransition {
            from: ExtensionState::Draft,
            to: ExtensionState::Testing,
            timestamp: Utc::now(),
            reason: Some("ready".into()),
            approved_by: None,
        }];
        ExtensionRecord::new(ext, ExtensionState::Testing, history, vec![]).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = ExtensionStorage::open(dir.path().join("records")).unwrap();
        let original = record("ext-1");

        let info = storage.save(&original).unwrap();
        assert!(info.path.exists());
        assert_eq!(info.checksum, original.checksum);
        assert!(info.size_bytes > 0);

        let loaded = storage.load(&"ext-1".into()).unwrap();
        assert_eq!(loaded, original);
    }

    #[test]
    fn test_tampered_record_fails_integrity_check() {
        let dir = TempDir::new().unwrap();
        let storage = ExtensionStorage::open(dir.path()).unwrap();
        let info = storage.save(&record("ext-1")).unwrap();

        let mut tampered: ExtensionRecord =
            serde_json::from_slice(&fs::read(&info.path).unwrap()).unwrap();
        tampered.state = ExtensionState::Deployed;
        fs::write(&info.path, serde_json::to_vec(&tampered).unwrap()).unwrap();

        assert!(matches!(
            storage.load(&"ext-1".into()),
            Err(StorageError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn test_load_all_reports_bad_files() {
        let dir = TempDir::new().unwrap();
        let storage = ExtensionStorage::open(dir.path()).unwrap();
        storage.save(&record("a")).unwrap();
        storage.save(&record("b")).unwrap();
        fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let report = storage.load_all().unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn test_remove_and_file_names() {
        let dir = TempDir::new().unwrap();
        let storage = ExtensionStorage::open(dir.path()).unwrap();
        let odd = ExtensionId::new("../team/ext 1");
        assert_eq!(storage.path_for(&odd), dir.path().join("___team_ext_1.json"));

        storage.save(&record("gone")).unwrap();
        assert!(storage.remove(&"gone".into()).unwrap());
        assert!(!storage.remove(&"gone".into()).unwrap());
    }
}
