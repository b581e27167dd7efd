//! Relational KV over an embedded SQLite connection, one table per section.

use std::time::Instant;

use arca_core::DataKey;
use metrics::histogram;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use crate::{
    check_args, check_batch, check_keys, check_section, failed_iter, BatchMode, BatchOp, Dialect, KeyIter, KeyPager, KeyValue,
    Kv, KvError, KvReader, KvResult, KvWriter, ListOptions, SortOrder, SECTION_BLOBS, SECTION_DATA, SECTION_EVENTS,
};

/// Wide table kept for readers that predate the generic sections.
pub const LEGACY_TABLE: &str = "resource_history";

/// The connection is always SQLite, whatever dialect renders the table statements.
const NOW_SQL: &str = "SELECT CAST(strftime('%s','now') AS INTEGER)";

const DEFAULT_PAGE_SIZE: usize = 256;

fn table_for(section: &str) -> KvResult<&'static str> {
    check_section(section)?;
    Ok(match section {
        SECTION_DATA => "kv_data",
        SECTION_EVENTS => "kv_events",
        SECTION_BLOBS => "kv_blobs",
        other => return Err(KvError::InvalidArgument(format!("unknown section '{}'", other))),
    })
}

/// Statements rendered once per table for the configured dialect.
struct TableSql {
    name: String,
    get: String,
    exists: String,
    insert: String,
    update: String,
    delete: String,
}

impl TableSql {
    fn render(d: Dialect, table: &str) -> Self {
        let t = d.quote_ident(table);
        let (k, v) = (d.quote_ident("key_path"), d.quote_ident("value"));
        let (p1, p2) = (d.placeholder(1), d.placeholder(2));
        Self {
            name: t.clone(),
            get: format!("SELECT {v} FROM {t} WHERE {k} = {p1}"),
            exists: format!("SELECT 1 FROM {t} WHERE {k} = {p1}"),
            insert: format!("INSERT INTO {t} ({k}, {v}) VALUES ({p1}, {p2})"),
            update: format!("UPDATE {t} SET {v} = {p1} WHERE {k} = {p2}"),
            delete: format!("DELETE FROM {t} WHERE {k} = {p1}"),
        }
    }

    /// One page of keys inside the range, resuming strictly after `cursor`.
    fn keys_page(&self, d: Dialect, opts: &ListOptions, cursor: Option<&str>, n: usize) -> (String, Vec<String>) {
        let k = d.quote_ident("key_path");
        let mut conds = Vec::new();
        let mut args = Vec::new();
        let mut push = |op: &str, val: &str, conds: &mut Vec<String>| {
            args.push(val.to_string());
            conds.push(format!("{k} {op} {}", d.placeholder(args.len())));
        };
        if !opts.start_key.is_empty() {
            push(">=", &opts.start_key, &mut conds);
        }
        if !opts.end_key.is_empty() {
            push("<", &opts.end_key, &mut conds);
        }
        let dir = match opts.sort {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        if let Some(c) = cursor {
            push(if opts.sort == SortOrder::Asc { ">" } else { "<" }, c, &mut conds);
        }
        let filter = if conds.is_empty() { String::new() } else { format!(" WHERE {}", conds.join(" AND ")) };
        (format!("SELECT {k} FROM {}{filter} ORDER BY {k} {dir} LIMIT {n}", self.name), args)
    }
}

struct Tables {
    data: TableSql,
    events: TableSql,
    blobs: TableSql,
}

impl Tables {
    fn get(&self, section: &str) -> KvResult<&TableSql> {
        Ok(match table_for(section)? {
            "kv_data" => &self.data,
            "kv_events" => &self.events,
            _ => &self.blobs,
        })
    }
}

/// Capability for the backward-compatible write path; see `SqlKv::save_compat`.
#[derive(Debug)]
pub struct LegacyTx {
    _private: (),
}

pub struct SqlKv {
    db: Mutex<Connection>,
    dialect: Dialect,
    page_size: usize,
    tables: Tables,
    legacy_insert: String,
}

impl SqlKv {
    /// Open using `ARCA_DB_PATH` (default `~/.arca/arca.db`), `ARCA_DB_DRIVER` (default sqlite)
    /// and `ARCA_KV_PAGE_SIZE`.
    pub fn open_default() -> KvResult<Self> {
        let path = std::env::var("ARCA_DB_PATH").unwrap_or_else(|_| default_db_path());
        let driver = std::env::var("ARCA_DB_DRIVER").unwrap_or_else(|_| "sqlite".to_string());
        let page_size = std::env::var("ARCA_KV_PAGE_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Ok(Self::open(&path, Dialect::from_driver(&driver)?)?.with_page_size(page_size))
    }

    pub fn open(path: &str, dialect: Dialect) -> KvResult<Self> {
        let started = Instant::now();
        let db = Connection::open(path)?;
        let me = Self::init(db, dialect)?;
        histogram!("kv_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(path, dialect = dialect.name(), took_ms = %started.elapsed().as_millis(), "kv opened");
        Ok(me)
    }

    pub fn open_in_memory(dialect: Dialect) -> KvResult<Self> {
        Self::init(Connection::open_in_memory()?, dialect)
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn init(db: Connection, dialect: Dialect) -> KvResult<Self> {
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        for table in ["kv_data", "kv_events", "kv_blobs"] {
            db.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} BLOB NOT NULL)",
                    dialect.quote_ident(table),
                    dialect.quote_ident("key_path"),
                    dialect.quote_ident("value"),
                ),
                [],
            )?;
        }
        let q = |s: &str| dialect.quote_ident(s);
        db.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} ({} TEXT NOT NULL, {} TEXT NOT NULL, {} TEXT NOT NULL, {} TEXT NOT NULL, \
                 {} TEXT NOT NULL, {} INTEGER NOT NULL, {} TEXT NOT NULL, {} TEXT NOT NULL, {} TEXT NOT NULL)",
                q(LEGACY_TABLE),
                q("guid"),
                q("group"),
                q("resource"),
                q("namespace"),
                q("name"),
                q("resource_version"),
                q("action"),
                q("folder"),
                q("key_path"),
            ),
            [],
        )?;
        let cols = ["guid", "group", "resource", "namespace", "name", "resource_version", "action", "folder", "key_path"];
        let legacy_insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            q(LEGACY_TABLE),
            cols.iter().map(|c| q(c)).collect::<Vec<_>>().join(", "),
            (1..=cols.len()).map(|i| dialect.placeholder(i)).collect::<Vec<_>>().join(", "),
        );
        Ok(Self {
            db: Mutex::new(db),
            dialect,
            page_size: DEFAULT_PAGE_SIZE,
            tables: Tables {
                data: TableSql::render(dialect, "kv_data"),
                events: TableSql::render(dialect, "kv_events"),
                blobs: TableSql::render(dialect, "kv_blobs"),
            },
            legacy_insert,
        })
    }

    /// Grants access to the backward-compatible write path.
    pub fn legacy_tx(&self) -> LegacyTx {
        LegacyTx { _private: () }
    }

    /// Like `save`, but the commit also records a `resource_history` row parsed from the
    /// data key, in the same transaction. Only the data section is accepted.
    pub fn save_compat(&self, section: &str, key: &str, _tx: &LegacyTx) -> KvResult<KvWriter<'_>> {
        check_args(section, key)?;
        if section != SECTION_DATA {
            return Err(KvError::InvalidArgument(format!("compat writes are not supported for section '{}'", section)));
        }
        let dk = DataKey::parse(key).map_err(|e| KvError::InvalidArgument(e.to_string()))?;
        let key = key.to_string();
        Ok(KvWriter::new(Box::new(move |value: &[u8]| {
            let started = Instant::now();
            let sql = self.tables.get(SECTION_DATA)?;
            let mut db = self.db.lock();
            let tx = db.transaction()?;
            upsert(&tx, sql, &key, value)?;
            let guid = if dk.guid.is_empty() { uuid::Uuid::new_v4().to_string() } else { dk.guid.clone() };
            tx.execute(
                &self.legacy_insert,
                rusqlite::params![
                    guid,
                    dk.group,
                    dk.resource,
                    dk.namespace,
                    dk.name,
                    dk.resource_version,
                    dk.action.as_str(),
                    dk.folder,
                    key,
                ],
            )?;
            tx.commit()?;
            histogram!("kv_save_ms", started.elapsed().as_secs_f64() * 1000.0, "path" => "compat");
            Ok(())
        })))
    }

    /// Number of legacy rows; used by operators to check the compat path is live.
    pub fn legacy_row_count(&self) -> KvResult<i64> {
        let db = self.db.lock();
        let n = db.query_row(&format!("SELECT COUNT(*) FROM {}", self.dialect.quote_ident(LEGACY_TABLE)), [], |r| {
            r.get(0)
        })?;
        Ok(n)
    }

    fn fetch_keys(&self, section: &str, opts: &ListOptions, cursor: Option<&str>, n: usize) -> KvResult<Vec<String>> {
        let sql = self.tables.get(section)?;
        let (query, args) = sql.keys_page(self.dialect, opts, cursor, n);
        let db = self.db.lock();
        let mut stmt = db.prepare_cached(&query)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| r.get::<_, String>(0))?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        debug!(section, fetched = keys.len(), "kv keys page");
        Ok(keys)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".arca");
        let _ = std::fs::create_dir_all(&p);
        p.push("arca.db");
        return p.to_string_lossy().to_string();
    }
    "arca.db".to_string()
}

fn exists(tx: &Transaction<'_>, sql: &TableSql, key: &str) -> KvResult<bool> {
    Ok(tx.query_row(&sql.exists, [key], |_| Ok(())).optional()?.is_some())
}

fn upsert(tx: &Transaction<'_>, sql: &TableSql, key: &str, value: &[u8]) -> KvResult<()> {
    let changed = tx.execute(&sql.update, rusqlite::params![value, key])?;
    if changed == 0 {
        tx.execute(&sql.insert, rusqlite::params![key, value])?;
    }
    Ok(())
}

fn apply_op(tx: &Transaction<'_>, sql: &TableSql, op: &BatchOp) -> KvResult<()> {
    match op.mode {
        BatchMode::Put => upsert(tx, sql, &op.key, &op.value),
        BatchMode::Create => {
            if exists(tx, sql, &op.key)? {
                return Err(KvError::AlreadyExists(op.key.clone()));
            }
            tx.execute(&sql.insert, rusqlite::params![op.key, op.value])?;
            Ok(())
        }
        BatchMode::Update => match tx.execute(&sql.update, rusqlite::params![op.value, op.key])? {
            0 => Err(KvError::NotFound),
            _ => Ok(()),
        },
        BatchMode::Delete => {
            tx.execute(&sql.delete, [&op.key])?;
            Ok(())
        }
    }
}

impl Kv for SqlKv {
    fn get(&self, section: &str, key: &str) -> KvResult<KvReader> {
        check_args(section, key)?;
        let started = Instant::now();
        let sql = self.tables.get(section)?;
        let db = self.db.lock();
        let value: Option<Vec<u8>> = db.query_row(&sql.get, [key], |r| r.get(0)).optional()?;
        histogram!("kv_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        value.map(KvReader::new).ok_or(KvError::NotFound)
    }

    fn save(&self, section: &str, key: &str) -> KvResult<KvWriter<'_>> {
        check_args(section, key)?;
        let sql = self.tables.get(section)?;
        let key = key.to_string();
        Ok(KvWriter::new(Box::new(move |value: &[u8]| {
            let started = Instant::now();
            let mut db = self.db.lock();
            let tx = db.transaction()?;
            upsert(&tx, sql, &key, value)?;
            tx.commit()?;
            histogram!("kv_save_ms", started.elapsed().as_secs_f64() * 1000.0, "path" => "generic");
            Ok(())
        })))
    }

    fn delete(&self, section: &str, key: &str) -> KvResult<()> {
        check_args(section, key)?;
        let sql = self.tables.get(section)?;
        let db = self.db.lock();
        match db.execute(&sql.delete, [key])? {
            0 => Err(KvError::NotFound),
            _ => Ok(()),
        }
    }

    fn batch_get(&self, section: &str, keys: &[String]) -> KvResult<Vec<KeyValue>> {
        check_keys(section, keys)?;
        let sql = self.tables.get(section)?;
        let db = self.db.lock();
        let mut stmt = db.prepare_cached(&sql.get)?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let value: Option<Vec<u8>> = stmt.query_row([key], |r| r.get(0)).optional()?;
            if let Some(value) = value {
                out.push(KeyValue { key: key.clone(), value });
            }
        }
        Ok(out)
    }

    fn batch_delete(&self, section: &str, keys: &[String]) -> KvResult<()> {
        check_keys(section, keys)?;
        let sql = self.tables.get(section)?;
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        for key in keys {
            tx.execute(&sql.delete, [key])?;
        }
        tx.commit()?;
        Ok(())
    }

    fn keys<'a>(&'a self, section: &str, opts: ListOptions) -> KeyIter<'a> {
        if let Err(e) = check_section(section) {
            return failed_iter(e);
        }
        let section = section.to_string();
        let fetch_opts = opts.clone();
        Box::new(KeyPager::new(
            move |cursor: Option<&str>, n| self.fetch_keys(&section, &fetch_opts, cursor, n),
            self.page_size,
            &opts,
        ))
    }

    fn batch(&self, section: &str, ops: Vec<BatchOp>) -> KvResult<()> {
        check_batch(section, &ops)?;
        if ops.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let sql = self.tables.get(section)?;
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        for (index, op) in ops.iter().enumerate() {
            // dropping the transaction on error rolls everything back
            apply_op(&tx, sql, op).map_err(|source| KvError::Batch {
                index,
                mode: op.mode,
                key: op.key.clone(),
                source: Box::new(source),
            })?;
        }
        tx.commit()?;
        histogram!("kv_batch_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    fn unix_timestamp(&self) -> KvResult<i64> {
        let db = self.db.lock();
        Ok(db.query_row(NOW_SQL, [], |r| r.get(0))?)
    }
}
