use super::sqlite::SqlStore;
use crate::{
    table::general::{
        Bucket, BucketRow, BucketStore, FingerprintSource, IndexStore, ParameterStore, RecordId,
    },
    Result,
};
use serde_json::Value;
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// In memory Sqlite store that can be written to disk once an index is built.
pub struct SqlStoreMem {
    sql_store: SqlStore,
}

impl SqlStoreMem {
    pub fn new() -> Result<Self> {
        Ok(SqlStoreMem {
            sql_store: SqlStore::open_in_memory()?,
        })
    }

    /// Copy the whole database to `db_path` with the online backup api. The store continues
    /// on the file afterwards.
    pub fn to_db<P: AsRef<Path>>(&mut self, db_path: P) -> Result<()> {
        let mut new_con = rusqlite::Connection::open(db_path)?;
        {
            let backup = rusqlite::backup::Backup::new(&self.conn, &mut new_con)?;
            backup.step(-1)?;
        }
        self.conn = new_con;
        Ok(())
    }
}

impl Deref for SqlStoreMem {
    type Target = SqlStore;

    fn deref(&self) -> &SqlStore {
        &self.sql_store
    }
}

impl DerefMut for SqlStoreMem {
    fn deref_mut(&mut self) -> &mut SqlStore {
        &mut self.sql_store
    }
}

impl FingerprintSource for SqlStoreMem {
    fn stream_fingerprints<'a>(
        &'a self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<(RecordId, Vec<u64>)>> + 'a>> {
        self.sql_store.stream_fingerprints(table)
    }
}

impl BucketStore for SqlStoreMem {
    fn replace_table(&mut self, table: &str, rows: Vec<BucketRow>) -> Result<usize> {
        self.sql_store.replace_table(table, rows)
    }

    fn clear_table(&mut self, table: &str) -> Result<()> {
        self.sql_store.clear_table(table)
    }

    fn lookup(
        &self,
        table: &str,
        partition: u32,
        model: u32,
        band: u32,
        key: u64,
    ) -> Result<Bucket> {
        self.sql_store.lookup(table, partition, model, band, key)
    }
}

impl ParameterStore for SqlStoreMem {
    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.sql_store.put(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        self.sql_store.get(key)
    }
}

impl IndexStore for SqlStoreMem {
    fn replace_index(
        &mut self,
        table: &str,
        rows: Vec<BucketRow>,
        params: &[(&str, Value)],
    ) -> Result<usize> {
        self.sql_store.replace_index(table, rows, params)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db3");

        let mut mem = SqlStoreMem::new().unwrap();
        mem.put("hashranges", json!([[0, 64]])).unwrap();
        mem.put_fingerprint("fp", 1, &[1, 2, 3]).unwrap();
        mem.to_db(&path).unwrap();
        // writes after the backup land in the file
        mem.put("seed", json!(1)).unwrap();
        drop(mem);

        let disk = SqlStore::open(&path).unwrap();
        assert_eq!(disk.get("hashranges").unwrap(), Some(json!([[0, 64]])));
        assert_eq!(disk.get("seed").unwrap(), Some(json!(1)));
        assert_eq!(disk.stream_fingerprints("fp").unwrap().count(), 1);
    }
}
