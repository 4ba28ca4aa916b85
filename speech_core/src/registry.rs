//! Process-wide speaker registry.
//!
//! Profiles are immutable once stored; `lookup` hands out copies so a
//! profile captured by an in-flight request never changes under it.
//! Writes for the same id are serialized through the map's entry lock.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SynthesisError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerProfile {
    pub id: String,
    pub embedding: Vec<f32>,
    pub prompt_tokens: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_text: Option<String>,
}

impl SpeakerProfile {
    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(SynthesisError::InvalidInput("speaker id is empty".into()));
        }
        if self.embedding.is_empty() || self.embedding.iter().any(|v| !v.is_finite()) {
            return Err(SynthesisError::InvalidInput(format!(
                "speaker '{}' has an empty or non-finite embedding",
                self.id
            )));
        }
        Ok(())
    }
}

/// Backing storage for the registry.
pub trait ProfileStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<SpeakerProfile>>;

    /// Replace the stored set. Either all of `profiles` becomes visible or
    /// the previous contents stay.
    fn save_all(&self, profiles: &[SpeakerProfile]) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct StoredProfiles {
    version: u32,
    speakers: Vec<SpeakerProfile>,
}

const STORE_VERSION: u32 = 1;

/// Suffix source for temp file names, unique within the process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON file store. Each save goes to its own sibling temp file that is
/// renamed over the target once fully written and synced. Saves through
/// one store are serialized.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut name = self
            .path
            .file_name()
            .map(|f| f.to_os_string())
            .unwrap_or_else(|| "speakers".into());
        name.push(format!(".{}.{n}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<SpeakerProfile>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no speaker file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let stored: StoredProfiles = serde_json::from_reader(BufReader::new(file))?;
        if stored.version != STORE_VERSION {
            return Err(SynthesisError::Persistence(format!(
                "unsupported speaker file version {}",
                stored.version
            )));
        }
        Ok(stored.speakers)
    }

    fn save_all(&self, profiles: &[SpeakerProfile]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| SynthesisError::Persistence("speaker file lock poisoned".into()))?;
        let temp_path = self.temp_path();
        let result = (|| -> Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            let stored = StoredProfiles {
                version: STORE_VERSION,
                speakers: profiles.to_vec(),
            };
            serde_json::to_writer_pretty(&mut writer, &stored)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            drop(writer);
            fs::rename(&temp_path, &self.path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }
}

/// In-memory store, mostly for tests and ephemeral servers.
#[derive(Debug, Default)]
pub struct MemoryStore {
    profiles: Mutex<Vec<SpeakerProfile>>,
}

impl MemoryStore {
    pub fn new(profiles: Vec<SpeakerProfile>) -> Self {
        Self { profiles: Mutex::new(profiles) }
    }
}

impl ProfileStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<SpeakerProfile>> {
        self.profiles
            .lock()
            .map(|p| p.clone())
            .map_err(|_| SynthesisError::Persistence("memory store lock poisoned".into()))
    }

    fn save_all(&self, profiles: &[SpeakerProfile]) -> Result<()> {
        let mut guard = self
            .profiles
            .lock()
            .map_err(|_| SynthesisError::Persistence("memory store lock poisoned".into()))?;
        *guard = profiles.to_vec();
        Ok(())
    }
}

#[derive(Default)]
pub struct SpeakerRegistry {
    profiles: DashMap<String, SpeakerProfile>,
    store: Option<Arc<dyn ProfileStore>>,
    // snapshot and save happen together so a stale snapshot never lands last
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for SpeakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeakerRegistry")
            .field("speakers", &self.profiles.len())
            .field("store", &self.store.as_ref().map(|_| "<ProfileStore>"))
            .finish()
    }
}

impl SpeakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            profiles: DashMap::new(),
            store: Some(store),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn lookup(&self, id: &str) -> Result<SpeakerProfile> {
        self.profiles
            .get(id)
            .map(|p| p.value().clone())
            .ok_or_else(|| SynthesisError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    /// Insert a profile. With `overwrite == false` an existing id is left
    /// untouched and `AlreadyExists` is returned.
    pub fn register(&self, profile: SpeakerProfile, overwrite: bool) -> Result<()> {
        profile.validate()?;
        match self.profiles.entry(profile.id.clone()) {
            Entry::Occupied(mut e) => {
                if !overwrite {
                    return Err(SynthesisError::AlreadyExists(profile.id));
                }
                debug!(speaker = %profile.id, "replacing speaker profile");
                e.insert(profile);
            }
            Entry::Vacant(e) => {
                debug!(speaker = %profile.id, "registering speaker profile");
                e.insert(profile);
            }
        }
        Ok(())
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.profiles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Write every profile to the backing store. A registry without a
    /// store has nothing to persist.
    pub fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|_| SynthesisError::Persistence("registry persist lock poisoned".into()))?;
        let mut snapshot: Vec<SpeakerProfile> = self.profiles.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        store.save_all(&snapshot)?;
        info!(speakers = snapshot.len(), "speaker registry persisted");
        Ok(())
    }

    /// Merge the backing store's profiles into the registry, replacing
    /// entries with the same id. Returns the number loaded.
    pub fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let profiles = store.load_all()?;
        let count = profiles.len();
        for profile in profiles {
            self.register(profile, true)?;
        }
        info!(speakers = count, "speaker registry loaded");
        Ok(count)
    }
}
