//! The State Store (design §6): the persistent record of the single
//! active instance. A single JSON document at a well-known path, written
//! atomically (temp file + rename) under an exclusive advisory lock held on
//! a sibling lockfile for the duration of the mutation.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};

pub const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: String,
    pub provider: String,
    pub gpu: String,
    pub region: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub wireguard_ip: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelRecord {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WireguardRecord {
    pub server_public_key: String,
    pub interface_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CostRecord {
    pub hourly_rate: f64,
    #[serde(default)]
    pub accumulated: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeadmanRecord {
    pub timeout_hours: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// The top-level persisted document. `version` is checked on load: an
/// unknown version is rejected outright rather than best-effort parsed
/// (design §9 "State versioning") -- the reconciler's job is to clean up
/// stale state, not to migrate it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub version: u32,
    pub instance: InstanceRecord,
    #[serde(default)]
    pub model: ModelRecord,
    #[serde(default)]
    pub wireguard: WireguardRecord,
    #[serde(default)]
    pub cost: CostRecord,
    #[serde(default)]
    pub deadman: DeadmanRecord,
}

impl State {
    pub fn new(instance: InstanceRecord) -> Self {
        Self {
            version: CURRENT_VERSION,
            instance,
            model: ModelRecord::default(),
            wireguard: WireguardRecord::default(),
            cost: CostRecord::default(),
            deadman: DeadmanRecord::default(),
        }
    }
}

/// A file-backed store for the single `State` document, guarded by an
/// advisory exclusive lock on a sibling `.lock` file.
pub struct StateStore {
    doc_path: PathBuf,
    lock_path: PathBuf,
}

impl StateStore {
    pub fn new(doc_path: impl Into<PathBuf>) -> Self {
        let doc_path = doc_path.into();
        let lock_path = doc_path.with_extension("lock");
        Self { doc_path, lock_path }
    }

    /// The conventional location: `~/.gpu-lease/state.json` (or
    /// `GPU_LEASE_STATE` override).
    pub fn default_location() -> Self {
        if let Ok(path) = std::env::var("GPU_LEASE_STATE") {
            return Self::new(path);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".gpu-lease").join("state.json"))
    }

    fn acquire_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("opening lock file {}", self.lock_path.display()))?;
        flock(lock_file.as_raw_fd(), FlockArg::LockExclusive)
            .map_err(|e| anyhow::anyhow!("failed to acquire state lock: {e}"))?;
        Ok(lock_file)
    }

    /// Returns `None` if there is no active instance. Corrupt JSON, an
    /// unrecognized `version`, or lock contention are errors.
    pub fn load(&self) -> Result<Option<State>> {
        let _lock = self.acquire_lock()?;
        self.load_locked()
    }

    fn load_locked(&self) -> Result<Option<State>> {
        if !self.doc_path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.doc_path)
            .with_context(|| format!("reading state file {}", self.doc_path.display()))?;
        let state: State = serde_json::from_str(&content)
            .with_context(|| format!("parsing state file {}", self.doc_path.display()))?;
        if state.version != CURRENT_VERSION {
            bail!(
                "state file {} has unsupported version {} (expected {})",
                self.doc_path.display(),
                state.version,
                CURRENT_VERSION
            );
        }
        Ok(Some(state))
    }

    /// Atomically write `state`: serialize to a temp file in the same
    /// directory, then rename over the document path.
    pub fn save(&self, state: &State) -> Result<()> {
        let _lock = self.acquire_lock()?;
        let dir = self
            .doc_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .context("creating temp file for atomic state write")?;
        let json = serde_json::to_string_pretty(state).context("serializing state")?;
        tmp.write_all(json.as_bytes())
            .context("writing state temp file")?;
        tmp.flush().context("flushing state temp file")?;
        tmp.persist(&self.doc_path)
            .map_err(|e| anyhow::anyhow!("renaming state temp file into place: {e}"))?;
        Ok(())
    }

    /// Atomically remove both the document and the lock file.
    pub fn clear(&self) -> Result<()> {
        {
            let _lock = self.acquire_lock()?;
            if self.doc_path.exists() {
                std::fs::remove_file(&self.doc_path)
                    .with_context(|| format!("removing state file {}", self.doc_path.display()))?;
            }
        }
        if self.lock_path.exists() {
            std::fs::remove_file(&self.lock_path).with_context(|| {
                format!("removing lock file {}", self.lock_path.display())
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> State {
        State::new(InstanceRecord {
            id: "v-7".to_string(),
            provider: "vast".to_string(),
            gpu: "A100 80GB".to_string(),
            region: "US-East".to_string(),
            instance_type: "on-demand".to_string(),
            public_ip: "203.0.113.5".to_string(),
            wireguard_ip: "10.10.0.2".to_string(),
            created_at: Utc::now(),
        })
    }

    #[test]
    fn load_returns_none_when_no_document_exists() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let state = sample_state();
        store.save(&state).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn clear_removes_document_and_lock() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(!dir.path().join("state.json").exists());
        assert!(!dir.path().join("state.lock").exists());
    }

    #[test]
    fn unknown_version_is_rejected_rather_than_migrated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 2, "instance": {"id":"x","provider":"vast","gpu":"A100","region":"US-East","type":"spot","created_at":"2024-01-01T00:00:00Z"}}"#).unwrap();
        let store = StateStore::new(path);
        assert!(store.load().is_err());
    }

    #[test]
    fn missing_optional_fields_default_to_zero_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"version": 1, "instance": {"id":"x","provider":"vast","gpu":"A100","region":"US-East","type":"spot","created_at":"2024-01-01T00:00:00Z"}}"#).unwrap();
        let store = StateStore::new(path);
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.cost.hourly_rate, 0.0);
        assert_eq!(state.deadman.timeout_hours, 0);
        assert_eq!(state.instance.public_ip, "");
    }
}
