//! Shard cache and the index build lifecycle.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arca_core::document::DocumentFields;
use arca_core::{IndexableDocument, NamespacedResource, ResourceKey};
use metrics::{counter, gauge, histogram};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::index::{IndexStorage, ShardIndex};
use crate::mapping::{MappedDoc, Mapping};
use crate::{check_ctx, SearchError, SearchOptions, SearchResult};

struct CacheEntry {
    index: Arc<ShardIndex>,
    built: Instant,
}

enum Pending {
    Index(MappedDoc),
    Delete(String),
}

/// Feeds documents into an index that is still being built. Items are applied in
/// batches; none of them are visible to readers before the index is published.
pub struct BatchWriter<'a> {
    ctx: &'a CancellationToken,
    mapping: &'a Mapping,
    engine: &'a mut Engine,
    pending: Vec<Pending>,
    batch_size: usize,
}

impl<'a> BatchWriter<'a> {
    fn new(ctx: &'a CancellationToken, mapping: &'a Mapping, engine: &'a mut Engine, batch_size: usize) -> Self {
        Self { ctx, mapping, engine, pending: Vec::new(), batch_size: batch_size.max(1) }
    }

    pub fn index(&mut self, doc: &IndexableDocument) -> SearchResult<()> {
        self.pending.push(Pending::Index(self.mapping.map(doc)));
        self.maybe_flush()
    }

    pub fn delete(&mut self, key: &ResourceKey) -> SearchResult<()> {
        self.pending.push(Pending::Delete(key.search_id()));
        self.maybe_flush()
    }

    fn maybe_flush(&mut self) -> SearchResult<()> {
        if self.pending.len() >= self.batch_size {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> SearchResult<()> {
        check_ctx(self.ctx)?;
        for item in self.pending.drain(..) {
            match item {
                Pending::Index(d) => self.engine.upsert(d)?,
                Pending::Delete(id) => {
                    self.engine.remove(&id);
                }
            }
        }
        Ok(())
    }

    /// Documents applied so far.
    pub fn doc_count(&self) -> usize {
        self.engine.doc_count()
    }
}

/// Builds shard indexes and caches the published ones.
pub struct SearchBackend {
    opts: SearchOptions,
    cache: RwLock<HashMap<NamespacedResource, CacheEntry>>,
}

impl SearchBackend {
    pub fn new(opts: SearchOptions) -> SearchResult<Self> {
        if opts.root.exists() && !opts.root.is_dir() {
            return Err(SearchError::Internal(format!("index root {} is not a directory", opts.root.display())));
        }
        std::fs::create_dir_all(&opts.root)?;
        info!(root = %opts.root.display(), file_threshold = opts.file_threshold, "search backend ready");
        Ok(Self { opts, cache: RwLock::new(HashMap::new()) })
    }

    pub fn options(&self) -> &SearchOptions {
        &self.opts
    }

    /// The published index of `key`. Never builds; expired memory indexes are evicted.
    pub fn get_index(&self, key: &NamespacedResource) -> Option<Arc<ShardIndex>> {
        let ttl = self.opts.index_cache_ttl;
        let fresh = |e: &CacheEntry| ttl.is_zero() || e.index.is_file() || e.built.elapsed() < ttl;
        {
            let cache = self.cache.read();
            let entry = cache.get(key)?;
            if fresh(entry) {
                return Some(entry.index.clone());
            }
        }
        let mut cache = self.cache.write();
        match cache.get(key) {
            Some(e) if fresh(e) => return Some(e.index.clone()),
            None => return None,
            Some(_) => {}
        }
        if let Some(e) = cache.remove(key) {
            e.index.close();
            counter!("search_cache_evictions_total", 1u64);
            debug!(shard = %key, "expired index evicted");
        }
        None
    }

    /// Shards with a published index.
    pub fn cached_keys(&self) -> Vec<NamespacedResource> {
        let mut keys: Vec<_> = self.cache.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Build (or reopen) the index of `key` and publish it. `builder` fills the index
    /// and returns the RV its content reflects.
    pub fn build_index<F>(
        &self,
        ctx: &CancellationToken,
        key: &NamespacedResource,
        expected_size: usize,
        last_known_rv: i64,
        fields: DocumentFields,
        builder: F,
    ) -> SearchResult<Arc<ShardIndex>>
    where
        F: FnOnce(&mut BatchWriter<'_>) -> SearchResult<i64>,
    {
        check_ctx(ctx)?;
        let t0 = Instant::now();
        let file_backed = self.opts.file_threshold > 0 && expected_size >= self.opts.file_threshold;

        let (storage, shard_dir) = if file_backed {
            let shard_dir = self.shard_dir(key)?;
            std::fs::create_dir_all(&shard_dir)?;
            let cached = self.cache.read().contains_key(key);
            if !cached {
                if let Some(index) = self.reopen(key, &shard_dir, &fields, expected_size, last_known_rv)? {
                    let index = Arc::new(index);
                    self.publish(key, index.clone());
                    if let Some(dir) = index.storage().dir() {
                        clean_old_indexes(&shard_dir, dir);
                    }
                    info!(shard = %key, rv = index.rv(), took_ms = %t0.elapsed().as_millis(), "index reopened");
                    return Ok(index);
                }
            }
            let dir = new_index_dir(&shard_dir);
            std::fs::create_dir_all(&dir)?;
            (IndexStorage::lock_dir(&dir)?, Some(shard_dir))
        } else {
            (IndexStorage::Memory, None)
        };

        let mapping = Mapping::new(&fields);
        let mut engine = Engine::default();
        let built = {
            let mut writer = BatchWriter::new(ctx, &mapping, &mut engine, self.opts.batch_size);
            builder(&mut writer).and_then(|rv| writer.flush().map(|_| rv))
        };
        let rv = match built {
            Ok(rv) => rv,
            Err(e) => {
                if let Some(dir) = storage.dir().map(Path::to_path_buf) {
                    drop(storage);
                    if let Err(err) = std::fs::remove_dir_all(&dir) {
                        warn!(dir = %dir.display(), error = %err, "failed to remove unfinished index");
                    }
                }
                return Err(e);
            }
        };
        engine.set_rv(rv);

        let index = Arc::new(ShardIndex::new(key.clone(), fields, engine, storage));
        index.persist(&index.engine().read())?;
        let docs = index.engine().read().doc_count();
        self.publish(key, index.clone());
        if let (Some(shard_dir), Some(dir)) = (shard_dir, index.storage().dir()) {
            clean_old_indexes(&shard_dir, dir);
        }

        let kind = if index.is_file() { "file" } else { "memory" };
        histogram!("search_build_ms", t0.elapsed().as_secs_f64() * 1000.0, "storage" => kind);
        gauge!("search_index_docs", docs as f64, "shard" => key.to_string());
        info!(shard = %key, docs, rv, storage = kind, took_ms = %t0.elapsed().as_millis(), "index built");
        Ok(index)
    }

    fn publish(&self, key: &NamespacedResource, index: Arc<ShardIndex>) {
        let old = self.cache.write().insert(key.clone(), CacheEntry { index: index.clone(), built: Instant::now() });
        if let Some(old) = old {
            if !Arc::ptr_eq(&old.index, &index) {
                old.index.close();
            }
        }
    }

    /// Reopen the newest previous file index when it is complete and recent enough.
    fn reopen(
        &self,
        key: &NamespacedResource,
        shard_dir: &Path,
        fields: &DocumentFields,
        expected_size: usize,
        last_known_rv: i64,
    ) -> SearchResult<Option<ShardIndex>> {
        let mut dirs: Vec<PathBuf> =
            std::fs::read_dir(shard_dir)?.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect();
        dirs.sort();
        for dir in dirs.into_iter().rev() {
            let storage = match IndexStorage::lock_dir(&dir) {
                Ok(s) => s,
                Err(SearchError::Locked) => continue,
                Err(e) => return Err(e),
            };
            match Engine::load(&dir) {
                Ok(Some(engine)) if engine.doc_count() == expected_size && engine.rv() >= last_known_rv => {
                    return Ok(Some(ShardIndex::new(key.clone(), fields.clone(), engine, storage)));
                }
                Ok(_) => {}
                Err(e) => warn!(dir = %dir.display(), error = %e, "unreadable index skipped"),
            }
        }
        Ok(None)
    }

    /// `root/{namespace}/{resource}.{group}`, kept inside the root.
    fn shard_dir(&self, key: &NamespacedResource) -> SearchResult<PathBuf> {
        let dir = self
            .opts
            .root
            .join(clean_segment(&key.namespace))
            .join(clean_segment(&key.group))
            .join(clean_segment(&key.resource));
        if !is_within(&self.opts.root, &dir) {
            return Err(SearchError::BadRequest(format!("invalid index path for {key}")));
        }
        Ok(dir)
    }

    /// Close every cached index and empty the cache.
    pub fn close(&self) {
        let drained: Vec<CacheEntry> = self.cache.write().drain().map(|(_, e)| e).collect();
        for e in drained {
            e.index.close();
        }
    }
}

fn clean_segment(s: &str) -> String {
    let cleaned: String = s.chars().map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c }).collect();
    match cleaned.as_str() {
        "" => "_cluster".to_string(),
        "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

fn is_within(root: &Path, path: &Path) -> bool {
    match path.strip_prefix(root) {
        Ok(rest) => rest.components().all(|c| matches!(c, Component::Normal(_))),
        Err(_) => false,
    }
}

/// A fresh `YYYYMMDD-HHMMSS` directory name, bumped by a second while taken.
fn new_index_dir(shard_dir: &Path) -> PathBuf {
    let mut ts = chrono::Utc::now();
    loop {
        let dir = shard_dir.join(ts.format("%Y%m%d-%H%M%S").to_string());
        if !dir.exists() {
            return dir;
        }
        ts += chrono::Duration::seconds(1);
    }
}

/// Remove the shard's other index directories, skipping any still locked.
fn clean_old_indexes(shard_dir: &Path, keep: &Path) {
    let Ok(entries) = std::fs::read_dir(shard_dir) else { return };
    for path in entries.flatten().map(|e| e.path()) {
        if path == keep || !path.is_dir() {
            continue;
        }
        match IndexStorage::lock_dir(&path) {
            Ok(lock) => {
                drop(lock);
                if let Err(e) = std::fs::remove_dir_all(&path) {
                    warn!(dir = %path.display(), error = %e, "old index cleanup failed");
                }
            }
            Err(e) => warn!(dir = %path.display(), error = %e, "old index left in place"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_cannot_escape_the_root() {
        assert_eq!(clean_segment("../etc"), ".._etc");
        assert_eq!(clean_segment(".."), "_");
        assert_eq!(clean_segment(""), "_cluster");
        let root = Path::new("/idx");
        assert!(is_within(root, &root.join("ns").join("g").join("r")));
        assert!(!is_within(root, &root.join("..").join("x")));
        assert!(!is_within(root, Path::new("/elsewhere")));
    }

    #[test]
    fn dotted_names_get_their_own_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let b = SearchBackend::new(SearchOptions {
            root: tmp.path().to_path_buf(),
            file_threshold: 0,
            batch_size: 10,
            index_cache_ttl: std::time::Duration::ZERO,
        })
        .unwrap();
        let one = b.shard_dir(&NamespacedResource::new("ns", "c", "a.b")).unwrap();
        let two = b.shard_dir(&NamespacedResource::new("ns", "b.c", "a")).unwrap();
        assert_ne!(one, two);
        assert_eq!(one, tmp.path().join("ns").join("c").join("a.b"));
        let cluster = b.shard_dir(&NamespacedResource::new("", "c", "a.b")).unwrap();
        assert_eq!(cluster, tmp.path().join("_cluster").join("c").join("a.b"));
    }

    #[test]
    fn a_locked_directory_cannot_be_opened_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let first = IndexStorage::lock_dir(tmp.path()).unwrap();
        let err = IndexStorage::lock_dir(tmp.path()).unwrap_err();
        assert_eq!(err.to_string(), "index is locked by another process");
        drop(first);
        assert!(IndexStorage::lock_dir(tmp.path()).is_ok());
    }

    #[test]
    fn index_dirs_bump_while_taken() {
        let tmp = tempfile::tempdir().unwrap();
        let a = new_index_dir(tmp.path());
        std::fs::create_dir_all(&a).unwrap();
        let b = new_index_dir(tmp.path());
        assert_ne!(a, b);
        assert!(b > a);
    }
}
