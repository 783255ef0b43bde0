//! Compiled-artifact memoization keyed by (namespace, source, compiler config).
//!
//! Lookups go memory first, then `<cache_dir>/<namespace>/<fingerprint>.bin`. The
//! fingerprint only names the file: both layers compare the full key, and a disk entry
//! recorded for another key is treated as a miss. A per-fingerprint gate makes
//! concurrent callers for the same key wait for a single compile; gates are dropped
//! once nobody waits on them. Disk writes land in a temp file that is renamed into
//! place, so racing processes leave one complete artifact behind.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use super::CompilerConfig;
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::hashing::Fnv1a;
use crate::profiling;

/// Full identity of a compiled artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub namespace: String,
    pub source: String,
    pub config: CompilerConfig,
}

impl ArtifactKey {
    pub fn new(namespace: &str, source: &str, config: &CompilerConfig) -> Self {
        Self {
            namespace: namespace.to_string(),
            source: source.to_string(),
            config: config.clone(),
        }
    }
}

/// On-disk layout: the key the bytes were compiled for, then the bytes.
#[derive(Serialize, Deserialize)]
struct DiskEntry {
    key: ArtifactKey,
    artifact: Vec<u8>,
}

pub struct ArtifactCache {
    dir: Option<PathBuf>,
    compiled: Mutex<HashMap<ArtifactKey, Arc<[u8]>>>,
    compile_gates: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    compiles: AtomicU64,
}

impl ArtifactCache {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            compiled: Mutex::new(HashMap::new()),
            compile_gates: Mutex::new(HashMap::new()),
            compiles: AtomicU64::new(0),
        }
    }

    pub fn memory_only() -> Self {
        Self::new(None)
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.disk_cache.then(|| config.cache_dir.clone()))
    }

    /// Cache shared by every device built from the global configuration.
    pub fn global() -> Arc<ArtifactCache> {
        static GLOBAL: OnceLock<Arc<ArtifactCache>> = OnceLock::new();
        Arc::clone(
            GLOBAL.get_or_init(|| Arc::new(ArtifactCache::from_config(RuntimeConfig::global()))),
        )
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn fingerprint(namespace: &str, source: &str, config: &CompilerConfig) -> RuntimeResult<u64> {
        Ok(Fnv1a::new()
            .field(namespace.as_bytes())
            .field(source.as_bytes())
            .field(&config.digest()?.to_le_bytes())
            .finish())
    }

    pub fn artifact_path(&self, namespace: &str, fingerprint: u64) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| {
            dir.join(namespace.to_ascii_lowercase())
                .join(format!("{fingerprint:016x}.bin"))
        })
    }

    /// Number of times a compile function actually ran through this cache.
    pub fn compile_count(&self) -> u64 {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn get_or_compile<F>(
        &self,
        namespace: &str,
        source: &str,
        config: &CompilerConfig,
        compile: F,
    ) -> RuntimeResult<Arc<[u8]>>
    where
        F: FnOnce(&str) -> RuntimeResult<Vec<u8>>,
    {
        let key = ArtifactKey::new(namespace, source, config);
        if let Some(found) = self.lookup_memory(&key) {
            profiling::cache_event("artifact_cache.hit_mem");
            return Ok(found);
        }
        profiling::cache_event("artifact_cache.miss_mem");

        let fingerprint = Self::fingerprint(namespace, source, config)?;
        let gate = {
            let mut gates = self
                .compile_gates
                .lock()
                .expect("compile gate map poisoned");
            Arc::clone(
                gates
                    .entry(fingerprint)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let result = {
            let _gate_lock = gate.lock().expect("compile gate poisoned");
            self.load_or_compile(key, fingerprint, compile)
        };
        self.release_gate(fingerprint, gate);
        result
    }

    fn load_or_compile<F>(
        &self,
        key: ArtifactKey,
        fingerprint: u64,
        compile: F,
    ) -> RuntimeResult<Arc<[u8]>>
    where
        F: FnOnce(&str) -> RuntimeResult<Vec<u8>>,
    {
        if let Some(found) = self.lookup_memory(&key) {
            profiling::cache_event("artifact_cache.hit_mem");
            return Ok(found);
        }

        let namespace = key.namespace.as_str();
        let path = self.artifact_path(namespace, fingerprint);
        let artifact: Arc<[u8]> = match path.as_deref().and_then(|path| read_entry(path, &key)) {
            Some(bytes) => {
                profiling::cache_event("artifact_cache.hit_disk");
                tracing::trace!(namespace, fingerprint = %format!("{fingerprint:016x}"), "artifact disk hit");
                Arc::from(bytes)
            }
            None => {
                profiling::cache_event("artifact_cache.miss_disk");
                let bytes = {
                    let _compile_scope = profiling::compile_scope("artifact_cache.compile");
                    compile(&key.source)?
                };
                self.compiles.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    namespace,
                    fingerprint = %format!("{fingerprint:016x}"),
                    bytes = bytes.len(),
                    "compiled artifact"
                );
                let entry = DiskEntry {
                    key,
                    artifact: bytes,
                };
                if let Some(path) = path.as_deref() {
                    if let Err(err) = persist(path, &entry) {
                        tracing::warn!(path = %path.display(), %err, "failed to persist artifact");
                    }
                }
                let artifact = Arc::from(entry.artifact);
                self.compiled
                    .lock()
                    .expect("artifact cache mutex poisoned")
                    .insert(entry.key, Arc::clone(&artifact));
                return Ok(artifact);
            }
        };

        self.compiled
            .lock()
            .expect("artifact cache mutex poisoned")
            .insert(key, Arc::clone(&artifact));
        Ok(artifact)
    }

    fn lookup_memory(&self, key: &ArtifactKey) -> Option<Arc<[u8]>> {
        self.compiled
            .lock()
            .expect("artifact cache mutex poisoned")
            .get(key)
            .cloned()
    }

    /// Drops the gate for `fingerprint` unless another caller still holds it.
    fn release_gate(&self, fingerprint: u64, gate: Arc<Mutex<()>>) {
        let mut gates = self
            .compile_gates
            .lock()
            .expect("compile gate map poisoned");
        let idle = gates
            .get(&fingerprint)
            .is_some_and(|current| Arc::ptr_eq(current, &gate) && Arc::strong_count(&gate) == 2);
        if idle {
            gates.remove(&fingerprint);
        }
    }
}

/// Reads the artifact at `path` if it was recorded for `key`.
fn read_entry(path: &Path, key: &ArtifactKey) -> Option<Vec<u8>> {
    let bytes = fs::read(path).ok()?;
    match bincode::deserialize::<DiskEntry>(&bytes) {
        Ok(entry) if entry.key == *key => Some(entry.artifact),
        Ok(_) => {
            tracing::debug!(path = %path.display(), "artifact file belongs to another key");
            None
        }
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "unreadable artifact file");
            None
        }
    }
}

fn persist(path: &Path, entry: &DiskEntry) -> RuntimeResult<()> {
    let bytes = bincode::serialize(entry).map_err(|err| {
        RuntimeError::execution(format!("failed to serialize artifact entry: {err}"))
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
