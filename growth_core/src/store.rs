//! Experiment-scoped caches.
//!
//! Each cache maps an experiment id to a JSON-encoded value. The job reads them
//! once at start and writes the scalar samples after every accepted update.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use growth_traits::KeyValueStore;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::atomic::write_atomic;
use crate::error::{EstimationError, Result};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const OD_BLANK: &str = "od_blank";
pub const OD_NORMALIZATION_MEAN: &str = "od_normalization_mean";
pub const OD_NORMALIZATION_VARIANCE: &str = "od_normalization_variance";
pub const GROWTH_RATE: &str = "growth_rate";
pub const OD_FILTERED: &str = "od_filtered";

/// Read and decode `cache[key]`.
pub fn get_json<T, S>(store: &S, cache: &str, key: &str) -> Result<Option<T>>
where
    T: DeserializeOwned,
    S: KeyValueStore + ?Sized,
{
    let raw = store
        .get(cache, key)
        .map_err(|e| EstimationError::Store(format!("read {cache}[{key}]: {e}")))?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| EstimationError::Store(format!("decode {cache}[{key}]: {e}")))
    })
    .transpose()
}

/// Encode and write `cache[key]`.
pub fn set_json<T, S>(store: &mut S, cache: &str, key: &str, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
    S: KeyValueStore + ?Sized,
{
    let encoded = serde_json::to_string(value)
        .map_err(|e| EstimationError::Store(format!("encode {cache}[{key}]: {e}")))?;
    store
        .set(cache, key, &encoded)
        .map_err(|e| EstimationError::Store(format!("write {cache}[{key}]: {e}")))
}

/// In-process store. Clones share the same contents, so two job instances can
/// hand state to each other.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, cache: &str, key: &str) -> std::result::Result<Option<String>, BoxError> {
        let guard = self.inner.lock().map_err(|_| "memory store poisoned")?;
        Ok(guard.get(&(cache.to_string(), key.to_string())).cloned())
    }

    fn set(&mut self, cache: &str, key: &str, value: &str) -> std::result::Result<(), BoxError> {
        let mut guard = self.inner.lock().map_err(|_| "memory store poisoned")?;
        guard.insert((cache.to_string(), key.to_string()), value.to_string());
        Ok(())
    }
}

/// Directory of `{cache}.json` files, each a JSON object `{key: value}`.
///
/// Writes go through a temp file and a rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (creating if needed) the store directory.
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, cache: &str) -> PathBuf {
        self.dir.join(format!("{cache}.json"))
    }

    fn read_cache(&self, cache: &str) -> std::result::Result<BTreeMap<String, String>, BoxError> {
        let path = self.path_for(cache);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, cache: &str, key: &str) -> std::result::Result<Option<String>, BoxError> {
        Ok(self.read_cache(cache)?.remove(key))
    }

    fn set(&mut self, cache: &str, key: &str, value: &str) -> std::result::Result<(), BoxError> {
        let mut entries = self.read_cache(cache)?;
        entries.insert(key.to_string(), value.to_string());
        let bytes = serde_json::to_vec_pretty(&entries)?;
        write_atomic(&self.path_for(cache), &bytes)?;
        Ok(())
    }
}
