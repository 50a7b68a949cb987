use crate::{
    table::general::{
        Bucket, BucketRow, BucketStore, FingerprintSource, IndexStore, ParameterStore, RecordId,
    },
    Error, Result,
};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;

/// Rows per round trip when streaming fingerprints.
const FINGERPRINT_PAGE: usize = 1000;

/// Table names are interpolated into statements, so only plain identifiers are accepted.
pub(crate) fn check_name(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name)
    } else {
        Err(Error::param(format!("invalid table name: {:?}", name)))
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let n: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

fn create_bucket_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} (
             part       INTEGER NOT NULL,
             model      INTEGER NOT NULL,
             band       INTEGER NOT NULL,
             band_key   INTEGER NOT NULL,
             records    BLOB NOT NULL,
             PRIMARY KEY (part, model, band, band_key)
         );",
        table
    ))?;
    Ok(())
}

fn write_rows(tx: &Transaction, table: &str, rows: Vec<BucketRow>) -> Result<usize> {
    create_bucket_table(tx, table)?;
    tx.execute(&format!("DELETE FROM {}", table), params![])?;
    let mut stmt = tx.prepare(&format!(
        "INSERT INTO {} (part, model, band, band_key, records) VALUES (?1, ?2, ?3, ?4, ?5)",
        table
    ))?;
    let n = rows.len();
    for row in rows {
        let blob = bincode::serialize(&row.records)?;
        // sqlite integers are signed, the key is stored by its bit pattern
        stmt.execute(params![
            row.partition,
            row.model,
            row.band,
            row.key as i64,
            blob
        ])?;
    }
    Ok(n)
}

fn write_param(conn: &Connection, key: &str, value: &Value) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO config (key, value) VALUES (?1, ?2)",
        params![key, serde_json::to_string(value)?],
    )?;
    Ok(())
}

/// Sqlite backend for band tables, parameters and fingerprints.
///
/// Requirement on Debian: libsqlite3-dev (or the bundled feature).
pub struct SqlStore {
    pub(crate) conn: Connection,
}

impl SqlStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_conn(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    pub fn from_conn(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS config (
                 key    TEXT PRIMARY KEY,
                 value  TEXT NOT NULL
             );",
        )?;
        Ok(SqlStore { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn create_fingerprint_table(&self, table: &str) -> Result<()> {
        let table = check_name(table)?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                 id           INTEGER PRIMARY KEY,
                 fingerprint  BLOB NOT NULL
             );",
            table
        ))?;
        Ok(())
    }

    /// Store (or overwrite) the fingerprint of record `id`.
    pub fn put_fingerprint(&self, table: &str, id: RecordId, fingerprint: &[u64]) -> Result<()> {
        self.create_fingerprint_table(table)?;
        let blob = bincode::serialize(fingerprint)?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (id, fingerprint) VALUES (?1, ?2)",
                table
            ),
            params![id, blob],
        )?;
        Ok(())
    }

    /// Number of rows in a bucket table.
    pub fn table_len(&self, table: &str) -> Result<usize> {
        let table = check_name(table)?;
        if !table_exists(&self.conn, table)? {
            return Err(Error::TableNotExist(table.to_string()));
        }
        let n: i64 = self
            .conn
            .query_row(&format!("SELECT count(*) FROM {}", table), params![], |row| {
                row.get(0)
            })?;
        Ok(n as usize)
    }
}

impl FingerprintSource for SqlStore {
    fn stream_fingerprints<'a>(
        &'a self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<(RecordId, Vec<u64>)>> + 'a>> {
        let table = check_name(table)?;
        if !table_exists(&self.conn, table)? {
            return Err(Error::TableNotExist(table.to_string()));
        }
        Ok(Box::new(FingerprintPages {
            conn: &self.conn,
            sql: format!(
                "SELECT id, fingerprint FROM {} WHERE id > ?1 ORDER BY id LIMIT ?2",
                table
            ),
            last: None,
            buf: VecDeque::new(),
            done: false,
        }))
    }
}

/// Keyset paging over a fingerprint table. Only one page is held in memory.
struct FingerprintPages<'a> {
    conn: &'a Connection,
    sql: String,
    last: Option<RecordId>,
    buf: VecDeque<(RecordId, Vec<u64>)>,
    done: bool,
}

impl<'a> FingerprintPages<'a> {
    fn next_page(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(&self.sql)?;
        let rows = stmt.query_map(
            params![self.last.unwrap_or(i64::MIN), FINGERPRINT_PAGE as i64],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
        )?;
        for row in rows {
            let (id, blob) = row?;
            self.buf.push_back((id, bincode::deserialize(&blob)?));
        }
        if self.buf.len() < FINGERPRINT_PAGE {
            self.done = true
        }
        self.last = self.buf.back().map(|(id, _)| *id);
        Ok(())
    }
}

impl<'a> Iterator for FingerprintPages<'a> {
    type Item = Result<(RecordId, Vec<u64>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            if self.done {
                return None;
            }
            if let Err(e) = self.next_page() {
                self.done = true;
                self.buf.clear();
                return Some(Err(e));
            }
        }
        self.buf.pop_front().map(Ok)
    }
}

impl BucketStore for SqlStore {
    /// Delete and repopulate in one transaction. Other connections keep reading the
    /// previous rows until the commit.
    fn replace_table(&mut self, table: &str, rows: Vec<BucketRow>) -> Result<usize> {
        let table = check_name(table)?;
        let tx = self.conn.transaction()?;
        let n = write_rows(&tx, table, rows)?;
        tx.commit()?;
        debug!("replaced {} with {} rows", table, n);
        Ok(n)
    }

    fn clear_table(&mut self, table: &str) -> Result<()> {
        let table = check_name(table)?;
        if table_exists(&self.conn, table)? {
            self.conn
                .execute(&format!("DELETE FROM {}", table), params![])?;
        }
        Ok(())
    }

    fn lookup(
        &self,
        table: &str,
        partition: u32,
        model: u32,
        band: u32,
        key: u64,
    ) -> Result<Bucket> {
        let table = check_name(table)?;
        if !table_exists(&self.conn, table)? {
            return Err(Error::TableNotExist(table.to_string()));
        }
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT records FROM {} WHERE part = ?1 AND model = ?2 AND band = ?3 AND band_key = ?4",
            table
        ))?;
        let blob: Option<Vec<u8>> = stmt
            .query_row(params![partition, model, band, key as i64], |row| {
                row.get(0)
            })
            .optional()?;
        match blob {
            None => Err(Error::NotFound),
            Some(blob) => {
                let records: Vec<RecordId> = bincode::deserialize(&blob)?;
                Ok(records.into_iter().collect())
            }
        }
    }
}

impl ParameterStore for SqlStore {
    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        write_param(&self.conn, key, &value)
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let text: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match text {
            None => Ok(None),
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        }
    }
}

impl IndexStore for SqlStore {
    /// Table and parameters are committed together.
    fn replace_index(
        &mut self,
        table: &str,
        rows: Vec<BucketRow>,
        params: &[(&str, Value)],
    ) -> Result<usize> {
        let table = check_name(table)?;
        let tx = self.conn.transaction()?;
        let n = write_rows(&tx, table, rows)?;
        for (key, value) in params {
            write_param(&tx, key, value)?;
        }
        tx.commit()?;
        debug!("replaced {} with {} rows and {} parameters", table, n, params.len());
        Ok(n)
    }
}
