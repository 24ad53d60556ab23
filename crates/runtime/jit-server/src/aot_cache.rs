//! Shared AOT cache (server side) and AOT deserializer (client side)
//!
//! The server keeps compiled code keyed by method identity and level so that
//! a method compiled for one client can be served to every other client
//! without recompiling. The cache can be persisted to a file and loaded back
//! on the next server start.

use crate::protocol::{RemoteMethodRef, decode_payload, encode_payload};
use jit_core::{CompilationErrorCode, CompiledCode, OptLevel};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{info, warn};

const CACHE_FILE_MAGIC: u32 = 0x4A49_5441;
const CACHE_FILE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum AotCacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("corrupt AOT cache file: {0}")]
    Corrupt(String),
}

impl From<&AotCacheError> for CompilationErrorCode {
    fn from(_: &AotCacheError) -> Self {
        CompilationErrorCode::AotCachePersistenceFailure
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AotKey {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    pub level: OptLevel,
}

impl AotKey {
    pub fn new(method: &RemoteMethodRef, level: OptLevel) -> Self {
        Self {
            class_name: method.class_name.clone(),
            method_name: method.name.clone(),
            signature: method.signature.clone(),
            level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AotRecord {
    pub id: u64,
    pub code: CompiledCode,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    magic: u32,
    version: u32,
    records: Vec<(AotKey, AotRecord)>,
}

#[derive(Debug, Default, Clone)]
pub struct AotCacheStats {
    pub records: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub struct AotCache {
    records: RwLock<HashMap<AotKey, AotRecord>>,
    next_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, key: &AotKey) -> Option<AotRecord> {
        let found = self.records.read().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store code for `key`, returning the record id. An existing record is
    /// kept.
    pub fn store(&self, key: AotKey, code: CompiledCode) -> u64 {
        let mut records = self.records.write();
        if let Some(existing) = records.get(&key) {
            return existing.id;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        records.insert(key, AotRecord { id, code });
        id
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn stats(&self) -> AotCacheStats {
        AotCacheStats {
            records: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn persist(&self, path: &Path) -> Result<usize, AotCacheError> {
        let file = CacheFile {
            magic: CACHE_FILE_MAGIC,
            version: CACHE_FILE_VERSION,
            records: self
                .records
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let bytes = encode_payload(&file).map_err(|e| AotCacheError::Corrupt(e.to_string()))?;
        std::fs::write(path, bytes).map_err(|source| AotCacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(target: "jit::server", records = file.records.len(), path = %path.display(), "AOT cache persisted");
        Ok(file.records.len())
    }

    /// Merge records from a persisted file. Returns how many were added.
    ///
    /// Loaded records get fresh ids from this instance so they never collide
    /// with records stored since startup; keys already present are skipped.
    pub fn load(&self, path: &Path) -> Result<usize, AotCacheError> {
        let bytes = std::fs::read(path).map_err(|source| AotCacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CacheFile =
            decode_payload(&bytes).map_err(|e| AotCacheError::Corrupt(e.to_string()))?;
        if file.magic != CACHE_FILE_MAGIC || file.version != CACHE_FILE_VERSION {
            return Err(AotCacheError::Corrupt(format!(
                "unexpected header {:#x} v{}",
                file.magic, file.version
            )));
        }
        let mut records = self.records.write();
        let mut added = 0;
        for (key, record) in file.records {
            if let std::collections::hash_map::Entry::Vacant(slot) = records.entry(key) {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                slot.insert(AotRecord {
                    id,
                    code: record.code,
                });
                added += 1;
            }
        }
        Ok(added)
    }

    /// Load the persisted catalog in the background. Failures are logged and
    /// otherwise ignored; the cache simply starts empty.
    pub fn prefetch_catalog(self: &Arc<Self>, path: PathBuf) -> std::io::Result<JoinHandle<()>> {
        let cache = Arc::clone(self);
        std::thread::Builder::new()
            .name("jit-aot-prefetch".to_string())
            .spawn(move || match cache.load(&path) {
                Ok(added) => {
                    info!(target: "jit::server", added, path = %path.display(), "AOT cache catalog loaded")
                }
                Err(error) => {
                    warn!(target: "jit::server", %error, "AOT cache catalog prefetch failed")
                }
            })
    }
}

/// Client-side view of the server's AOT records.
///
/// Record ids are only meaningful for the server instance that issued them.
/// When the server identity changes, all cached mappings are dropped and the
/// compile that noticed it fails with `AotDeserializerReset`.
#[derive(Debug, Default)]
pub struct AotDeserializer {
    server_uid: Option<u64>,
    records: HashMap<u64, CompiledCode>,
    resets: u64,
}

impl AotDeserializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deserialize(
        &mut self,
        server_uid: u64,
        record: u64,
        code: &CompiledCode,
    ) -> Result<CompiledCode, CompilationErrorCode> {
        match self.server_uid {
            Some(known) if known != server_uid => {
                warn!(target: "jit::server", known, server_uid, "server changed, resetting AOT deserializer");
                self.reset();
                self.server_uid = Some(server_uid);
                return Err(CompilationErrorCode::AotDeserializerReset);
            }
            None => self.server_uid = Some(server_uid),
            Some(_) => {}
        }
        if code.warm_size == 0 {
            return Err(CompilationErrorCode::AotCacheDeserializationFailure);
        }
        let cached = self.records.entry(record).or_insert_with(|| code.clone());
        Ok(cached.clone())
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.server_uid = None;
        self.resets += 1;
    }

    pub fn cached_records(&self) -> usize {
        self.records.len()
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }
}
