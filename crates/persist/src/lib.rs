//! Arca persistence: a section-scoped key/value store over a relational engine
//! (or plain memory), with ordered range scans and atomic batches.

#![forbid(unsafe_code)]

use std::fmt;
use std::io::{Read, Write};

pub mod dialect;
mod mem;
mod sql;

pub use dialect::Dialect;
pub use mem::MemKv;
pub use sql::{LegacyTx, SqlKv, LEGACY_TABLE};

pub const SECTION_DATA: &str = "unified/data";
pub const SECTION_EVENTS: &str = "unified/events";
pub const SECTION_BLOBS: &str = "unified/blobs";
pub const SECTIONS: [&str; 3] = [SECTION_DATA, SECTION_EVENTS, SECTION_BLOBS];

/// Upper bound on operations in one `batch` call.
pub const MAX_BATCH_OPS: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("key already exists: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("too many operations: {got} exceeds {max}")]
    TooManyOps { got: usize, max: usize },
    #[error("batch operation {index} ({mode} '{key}'): {source}")]
    Batch {
        index: usize,
        mode: BatchMode,
        key: String,
        #[source]
        source: Box<KvError>,
    },
    #[error("unknown driver '{0}'")]
    UnknownDriver(String),
    #[error("sql: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl KvError {
    pub fn is_not_found(&self) -> bool {
        match self {
            KvError::NotFound => true,
            KvError::Batch { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Range and ordering for `Kv::keys`. Start is inclusive, end exclusive; empty means unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub start_key: String,
    pub end_key: String,
    pub sort: SortOrder,
    /// 0 means no limit.
    pub limit: usize,
}

impl ListOptions {
    pub fn prefix(prefix: &str) -> Self {
        Self { start_key: prefix.to_string(), end_key: prefix_range_end(prefix), ..Default::default() }
    }

    pub fn desc(mut self) -> Self {
        self.sort = SortOrder::Desc;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    fn is_empty_range(&self) -> bool {
        !self.start_key.is_empty() && !self.end_key.is_empty() && self.end_key <= self.start_key
    }
}

/// Exclusive upper bound of a prefix scan: bump the last byte that can be bumped.
/// Returns "" (unbounded) when no byte can be.
pub fn prefix_range_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0xff {
            bytes.push(last + 1);
            return String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned());
        }
    }
    String::new()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// Insert or overwrite.
    Put,
    /// Fails when the key exists.
    Create,
    /// Fails when the key is missing.
    Update,
    /// Removes the key; missing keys are ignored.
    Delete,
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BatchMode::Put => "put",
            BatchMode::Create => "create",
            BatchMode::Update => "update",
            BatchMode::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    pub mode: BatchMode,
    pub key: String,
    pub value: Vec<u8>,
}

impl BatchOp {
    pub fn put(key: &str, value: &[u8]) -> Self { Self { mode: BatchMode::Put, key: key.into(), value: value.to_vec() } }
    pub fn create(key: &str, value: &[u8]) -> Self { Self { mode: BatchMode::Create, key: key.into(), value: value.to_vec() } }
    pub fn update(key: &str, value: &[u8]) -> Self { Self { mode: BatchMode::Update, key: key.into(), value: value.to_vec() } }
    pub fn delete(key: &str) -> Self { Self { mode: BatchMode::Delete, key: key.into(), value: Vec::new() } }
}

/// Reader over a fetched value.
#[derive(Debug)]
pub struct KvReader {
    inner: std::io::Cursor<Vec<u8>>,
}

impl KvReader {
    pub fn new(value: Vec<u8>) -> Self { Self { inner: std::io::Cursor::new(value) } }
    pub fn into_bytes(self) -> Vec<u8> { self.inner.into_inner() }
}

impl Read for KvReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> { self.inner.read(buf) }
}

type Commit<'a> = Box<dyn FnOnce(&[u8]) -> KvResult<()> + Send + 'a>;

/// Buffered writer returned by `Kv::save`. Nothing is stored until `close`;
/// dropping the writer discards the buffer.
pub struct KvWriter<'a> {
    buf: Vec<u8>,
    commit: Commit<'a>,
}

impl<'a> KvWriter<'a> {
    pub(crate) fn new(commit: Commit<'a>) -> Self { Self { buf: Vec::new(), commit } }

    /// Commit the buffered bytes, overwriting any existing value.
    pub fn close(self) -> KvResult<()> {
        (self.commit)(&self.buf)
    }
}

impl Write for KvWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

/// Lazy ordered key sequence; stops at the first error.
pub type KeyIter<'a> = Box<dyn Iterator<Item = KvResult<String>> + Send + 'a>;

/// Section-scoped key/value store.
pub trait Kv: Send + Sync {
    fn get(&self, section: &str, key: &str) -> KvResult<KvReader>;
    fn save(&self, section: &str, key: &str) -> KvResult<KvWriter<'_>>;
    fn delete(&self, section: &str, key: &str) -> KvResult<()>;
    /// Found pairs in request order; missing keys are skipped.
    fn batch_get(&self, section: &str, keys: &[String]) -> KvResult<Vec<KeyValue>>;
    /// Missing keys are skipped.
    fn batch_delete(&self, section: &str, keys: &[String]) -> KvResult<()>;
    fn keys<'a>(&'a self, section: &str, opts: ListOptions) -> KeyIter<'a>;
    /// All-or-nothing application of `ops`.
    fn batch(&self, section: &str, ops: Vec<BatchOp>) -> KvResult<()>;
    /// Seconds since the epoch, as seen by the store.
    fn unix_timestamp(&self) -> KvResult<i64>;
}

/// Whole-value helpers on top of the streaming interface.
pub trait KvExt {
    fn get_value(&self, section: &str, key: &str) -> KvResult<Vec<u8>>;
    fn put_value(&self, section: &str, key: &str, value: &[u8]) -> KvResult<()>;
}

impl<K: Kv + ?Sized> KvExt for K {
    fn get_value(&self, section: &str, key: &str) -> KvResult<Vec<u8>> {
        Ok(self.get(section, key)?.into_bytes())
    }

    fn put_value(&self, section: &str, key: &str, value: &[u8]) -> KvResult<()> {
        let mut w = self.save(section, key)?;
        w.write_all(value)?;
        w.close()
    }
}

pub(crate) fn check_section(section: &str) -> KvResult<()> {
    if section.is_empty() {
        return Err(KvError::InvalidArgument("section is required".into()));
    }
    if !SECTIONS.contains(&section) {
        return Err(KvError::InvalidArgument(format!("unknown section '{}'", section)));
    }
    Ok(())
}

pub(crate) fn check_args(section: &str, key: &str) -> KvResult<()> {
    check_section(section)?;
    if key.is_empty() {
        return Err(KvError::InvalidArgument("key is required".into()));
    }
    Ok(())
}

pub(crate) fn check_keys(section: &str, keys: &[String]) -> KvResult<()> {
    check_section(section)?;
    keys.iter().try_for_each(|k| check_args(section, k))
}

pub(crate) fn check_batch(section: &str, ops: &[BatchOp]) -> KvResult<()> {
    check_section(section)?;
    if ops.len() > MAX_BATCH_OPS {
        return Err(KvError::TooManyOps { got: ops.len(), max: MAX_BATCH_OPS });
    }
    for (index, op) in ops.iter().enumerate() {
        if op.key.is_empty() {
            return Err(KvError::Batch {
                index,
                mode: op.mode,
                key: String::new(),
                source: Box::new(KvError::InvalidArgument("key is required".into())),
            });
        }
    }
    Ok(())
}

/// Pages through a key range with a caller-supplied fetch, resuming after the last key seen.
/// Only one page is held at a time, so abandoning the iterator early costs nothing.
pub(crate) struct KeyPager<F> {
    fetch: F,
    page_size: usize,
    remaining: Option<usize>,
    cursor: Option<String>,
    page: std::vec::IntoIter<String>,
    done: bool,
}

impl<F> KeyPager<F>
where
    F: FnMut(Option<&str>, usize) -> KvResult<Vec<String>>,
{
    pub(crate) fn new(fetch: F, page_size: usize, opts: &ListOptions) -> Self {
        Self {
            fetch,
            page_size: page_size.max(1),
            remaining: (opts.limit > 0).then_some(opts.limit),
            cursor: None,
            page: Vec::new().into_iter(),
            done: opts.is_empty_range(),
        }
    }
}

impl<F> Iterator for KeyPager<F>
where
    F: FnMut(Option<&str>, usize) -> KvResult<Vec<String>>,
{
    type Item = KvResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining == Some(0) {
                return None;
            }
            if let Some(k) = self.page.next() {
                if let Some(r) = self.remaining.as_mut() {
                    *r -= 1;
                }
                self.cursor = Some(k.clone());
                return Some(Ok(k));
            }
            if self.done {
                return None;
            }
            let want = match self.remaining {
                Some(r) => r.min(self.page_size),
                None => self.page_size,
            };
            match (self.fetch)(self.cursor.as_deref(), want) {
                Ok(keys) => {
                    metrics::counter!("kv_keys_pages_total", 1u64);
                    // a short page means the range is exhausted
                    if keys.len() < want {
                        self.done = true;
                    }
                    self.page = keys.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Yields a single error, used when arguments are rejected up front.
pub(crate) fn failed_iter<'a>(err: KvError) -> KeyIter<'a> {
    Box::new(std::iter::once(Err(err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_end_bumps_last_byte() {
        assert_eq!(prefix_range_end("a/b/"), "a/b0");
        assert_eq!(prefix_range_end("abc"), "abd");
        assert_eq!(prefix_range_end(""), "");
    }

    #[test]
    fn empty_range_detection() {
        let o = ListOptions { start_key: "b".into(), end_key: "a".into(), ..Default::default() };
        assert!(o.is_empty_range());
        assert!(!ListOptions::prefix("a").is_empty_range());
    }

    #[test]
    fn argument_checks() {
        assert_eq!(check_args("", "k").unwrap_err().to_string(), "section is required");
        assert_eq!(check_args(SECTION_DATA, "").unwrap_err().to_string(), "key is required");
        assert!(check_args("nope", "k").unwrap_err().to_string().contains("unknown section"));
        let ops = vec![BatchOp::delete("k"); MAX_BATCH_OPS + 1];
        assert!(check_batch(SECTION_DATA, &ops).unwrap_err().to_string().contains("too many operations"));
    }
}
