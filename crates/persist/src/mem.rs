//! In-process KV: one ordered map per section.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use parking_lot::RwLock;

use crate::{
    check_args, check_batch, check_keys, check_section, failed_iter, BatchMode, BatchOp, KeyIter, KeyPager, KeyValue, Kv,
    KvError, KvReader, KvResult, KvWriter, ListOptions, SortOrder, SECTIONS,
};

const PAGE: usize = 128;

pub struct MemKv {
    sections: RwLock<HashMap<&'static str, BTreeMap<String, Vec<u8>>>>,
}

impl Default for MemKv {
    fn default() -> Self { Self::new() }
}

impl MemKv {
    pub fn new() -> Self {
        Self { sections: RwLock::new(SECTIONS.iter().map(|s| (*s, BTreeMap::new())).collect()) }
    }

    fn with_section<T>(&self, section: &str, f: impl FnOnce(&BTreeMap<String, Vec<u8>>) -> T) -> KvResult<T> {
        check_section(section)?;
        let guard = self.sections.read();
        let map = guard
            .get(section)
            .ok_or_else(|| KvError::InvalidArgument(format!("unknown section '{}'", section)))?;
        Ok(f(map))
    }

    fn with_section_mut<T>(
        &self,
        section: &str,
        f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> KvResult<T>,
    ) -> KvResult<T> {
        check_section(section)?;
        let mut guard = self.sections.write();
        let map = guard
            .get_mut(section)
            .ok_or_else(|| KvError::InvalidArgument(format!("unknown section '{}'", section)))?;
        f(map)
    }

    fn page(&self, section: &str, opts: &ListOptions, cursor: Option<&str>, n: usize) -> KvResult<Vec<String>> {
        self.with_section(section, |map| {
            let lower = match (cursor, opts.sort) {
                (Some(c), SortOrder::Asc) => Bound::Excluded(c.to_string()),
                _ if opts.start_key.is_empty() => Bound::Unbounded,
                _ => Bound::Included(opts.start_key.clone()),
            };
            let upper = match (cursor, opts.sort) {
                (Some(c), SortOrder::Desc) => Bound::Excluded(c.to_string()),
                _ if opts.end_key.is_empty() => Bound::Unbounded,
                _ => Bound::Excluded(opts.end_key.clone()),
            };
            let range = map.range((lower, upper)).map(|(k, _)| k.clone());
            match opts.sort {
                SortOrder::Asc => range.take(n).collect(),
                SortOrder::Desc => range.rev().take(n).collect(),
            }
        })
    }
}

impl Kv for MemKv {
    fn get(&self, section: &str, key: &str) -> KvResult<KvReader> {
        check_args(section, key)?;
        self.with_section(section, |map| map.get(key).cloned())?
            .map(KvReader::new)
            .ok_or(KvError::NotFound)
    }

    fn save(&self, section: &str, key: &str) -> KvResult<KvWriter<'_>> {
        check_args(section, key)?;
        let (section, key) = (section.to_string(), key.to_string());
        Ok(KvWriter::new(Box::new(move |value: &[u8]| {
            self.with_section_mut(&section, |map| {
                map.insert(key, value.to_vec());
                Ok(())
            })
        })))
    }

    fn delete(&self, section: &str, key: &str) -> KvResult<()> {
        check_args(section, key)?;
        self.with_section_mut(section, |map| map.remove(key).map(|_| ()).ok_or(KvError::NotFound))
    }

    fn batch_get(&self, section: &str, keys: &[String]) -> KvResult<Vec<KeyValue>> {
        check_keys(section, keys)?;
        self.with_section(section, |map| {
            keys.iter()
                .filter_map(|k| map.get(k).map(|v| KeyValue { key: k.clone(), value: v.clone() }))
                .collect()
        })
    }

    fn batch_delete(&self, section: &str, keys: &[String]) -> KvResult<()> {
        check_keys(section, keys)?;
        self.with_section_mut(section, |map| {
            for k in keys {
                map.remove(k);
            }
            Ok(())
        })
    }

    fn keys<'a>(&'a self, section: &str, opts: ListOptions) -> KeyIter<'a> {
        if let Err(e) = check_section(section) {
            return failed_iter(e);
        }
        let section = section.to_string();
        let fetch_opts = opts.clone();
        Box::new(KeyPager::new(move |cursor: Option<&str>, n| self.page(&section, &fetch_opts, cursor, n), PAGE, &opts))
    }

    fn batch(&self, section: &str, ops: Vec<BatchOp>) -> KvResult<()> {
        check_batch(section, &ops)?;
        self.with_section_mut(section, |map| {
            // stage every op against an overlay; apply only if all succeed
            let mut overlay: HashMap<&str, Option<&[u8]>> = HashMap::new();
            for (index, op) in ops.iter().enumerate() {
                let exists = match overlay.get(op.key.as_str()) {
                    Some(staged) => staged.is_some(),
                    None => map.contains_key(&op.key),
                };
                let fail = |source: KvError| KvError::Batch { index, mode: op.mode, key: op.key.clone(), source: Box::new(source) };
                match op.mode {
                    BatchMode::Create if exists => return Err(fail(KvError::AlreadyExists(op.key.clone()))),
                    BatchMode::Update if !exists => return Err(fail(KvError::NotFound)),
                    BatchMode::Delete => {
                        overlay.insert(&op.key, None);
                    }
                    _ => {
                        overlay.insert(&op.key, Some(&op.value));
                    }
                }
            }
            for (k, v) in overlay {
                match v {
                    Some(v) => {
                        map.insert(k.to_string(), v.to_vec());
                    }
                    None => {
                        map.remove(k);
                    }
                }
            }
            Ok(())
        })
    }

    fn unix_timestamp(&self) -> KvResult<i64> {
        Ok(chrono::Utc::now().timestamp())
    }
}
