//! Device tracker
//!
//! Durable record of what was provisioned into each pod, one document per pod UID.
//! Presence of a record is what the orchestrator treats as "this pod was handled";
//! all reads and writes of [`DeviceAllocation`] go through this module.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::PoisonError;

use thiserror::Error;
use tracing::debug;
use tracing::info;

use super::types::DeviceAllocation;
use super::types::ALLOCATION_RECORD_VERSION;

/// Errors of the allocation store
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid pod uid `{uid}`")]
    InvalidPodUid { uid: String },

    #[error("failed to serialize allocation of pod {uid}")]
    Serialize {
        uid: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse allocation record {path}")]
    Deserialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported allocation record version {version} in {path}")]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("storage error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Store of per-pod allocation records
pub trait Tracker: Send + Sync {
    /// Writes the record of `allocation.pod_uid`, replacing any previous one
    fn save(&self, allocation: &DeviceAllocation) -> Result<()>;

    /// Reads the record of a pod, `None` when the pod was never provisioned
    fn get(&self, pod_uid: &str) -> Result<Option<DeviceAllocation>>;

    /// Removes the record of a pod, removing a missing record succeeds
    fn delete(&self, pod_uid: &str) -> Result<()>;

    /// All stored records
    fn list(&self) -> Result<Vec<DeviceAllocation>>;
}

/// Directory backed tracker writing `<dir>/<pod uid>.json`.
///
/// Writes go to a temporary file which is synced and renamed over the record, so a
/// crash leaves either the old or the new document.
#[derive(Debug)]
pub struct FileTracker {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileTracker {
    /// Opens the store, creating the directory when missing
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| TrackerError::Io {
            path: dir.clone(),
            source,
        })?;
        info!(dir = %dir.display(), "allocation store opened");
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn record_path(&self, pod_uid: &str) -> Result<PathBuf> {
        let valid = !pod_uid.is_empty()
            && pod_uid
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(TrackerError::InvalidPodUid {
                uid: pod_uid.to_string(),
            });
        }
        Ok(self.dir.join(format!("{pod_uid}.json")))
    }

    /// Persists renames and removals of records in the directory
    fn sync_dir(&self) -> Result<()> {
        fs::File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|source| TrackerError::Io {
                path: self.dir.clone(),
                source,
            })
    }

    fn read_record(path: &Path) -> Result<Option<DeviceAllocation>> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(TrackerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let allocation: DeviceAllocation =
            serde_json::from_slice(&content).map_err(|source| TrackerError::Deserialize {
                path: path.to_path_buf(),
                source,
            })?;
        if allocation.version != ALLOCATION_RECORD_VERSION {
            return Err(TrackerError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: allocation.version,
            });
        }
        Ok(Some(allocation))
    }
}

impl Tracker for FileTracker {
    fn save(&self, allocation: &DeviceAllocation) -> Result<()> {
        let path = self.record_path(&allocation.pod_uid)?;
        let content =
            serde_json::to_vec_pretty(allocation).map_err(|source| TrackerError::Serialize {
                uid: allocation.pod_uid.clone(),
                source,
            })?;

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let tmp_path = path.with_extension("json.tmp");
        let io_err = |source| TrackerError::Io {
            path: tmp_path.clone(),
            source,
        };
        let mut file = fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&content).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp_path, &path).map_err(|source| TrackerError::Io {
            path: path.clone(),
            source,
        })?;
        self.sync_dir()?;

        debug!(
            pod_uid = %allocation.pod_uid,
            phase = ?allocation.phase,
            devices = allocation.devices.len(),
            "allocation record saved"
        );
        Ok(())
    }

    fn get(&self, pod_uid: &str) -> Result<Option<DeviceAllocation>> {
        let path = self.record_path(pod_uid)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Self::read_record(&path)
    }

    fn delete(&self, pod_uid: &str) -> Result<()> {
        let path = self.record_path(pod_uid)?;
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&path) {
            Ok(()) => {
                self.sync_dir()?;
                debug!(pod_uid = %pod_uid, "allocation record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TrackerError::Io { path, source }),
        }
    }

    fn list(&self) -> Result<Vec<DeviceAllocation>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = fs::read_dir(&self.dir).map_err(|source| TrackerError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| TrackerError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.pod_uid.cmp(&b.pod_uid));
        Ok(records)
    }
}
