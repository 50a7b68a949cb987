use crate::{
    table::general::{
        Bucket, BucketRow, BucketStore, FingerprintSource, IndexStore, ParameterStore, RecordId,
    },
    Error, Result,
};
use fnv::FnvHashMap as HashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::iter::FromIterator;

type BucketAddress = (u32, u32, u32, u64);

/// In memory implementation of all storage collaborators.
#[derive(Default)]
pub struct MemoryStore {
    tables: HashMap<String, HashMap<BucketAddress, Vec<RecordId>>>,
    params: HashMap<String, Value>,
    fingerprints: HashMap<String, BTreeMap<RecordId, Vec<u64>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_fingerprint(&mut self, table: &str, id: RecordId, fingerprint: Vec<u64>) {
        self.fingerprints
            .entry(table.to_string())
            .or_insert_with(BTreeMap::new)
            .insert(id, fingerprint);
    }

    /// Number of buckets in `table`, `None` if the table was never written.
    pub fn table_len(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(|t| t.len())
    }

    /// All rows of `table`.
    pub fn rows(&self, table: &str) -> Result<Vec<BucketRow>> {
        let tbl = self
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotExist(table.to_string()))?;
        let mut rows: Vec<BucketRow> = tbl
            .iter()
            .map(|(&(partition, model, band, key), records)| BucketRow {
                partition,
                model,
                band,
                key,
                records: records.clone(),
            })
            .collect();
        rows.sort_by_key(|r| (r.partition, r.model, r.band, r.key));
        Ok(rows)
    }
}

impl FingerprintSource for MemoryStore {
    fn stream_fingerprints<'a>(
        &'a self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<(RecordId, Vec<u64>)>> + 'a>> {
        let fps = self
            .fingerprints
            .get(table)
            .ok_or_else(|| Error::TableNotExist(table.to_string()))?;
        Ok(Box::new(fps.iter().map(|(&id, fp)| Ok((id, fp.clone())))))
    }
}

impl BucketStore for MemoryStore {
    fn replace_table(&mut self, table: &str, rows: Vec<BucketRow>) -> Result<usize> {
        let n = rows.len();
        // build the new generation aside and swap it in
        let tbl = HashMap::from_iter(
            rows.into_iter()
                .map(|r| ((r.partition, r.model, r.band, r.key), r.records)),
        );
        self.tables.insert(table.to_string(), tbl);
        Ok(n)
    }

    fn clear_table(&mut self, table: &str) -> Result<()> {
        if let Some(tbl) = self.tables.get_mut(table) {
            tbl.clear()
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
        let tbl = self
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotExist(table.to_string()))?;
        match tbl.get(&(partition, model, band, key)) {
            None => Err(Error::NotFound),
            Some(records) => Ok(records.iter().copied().collect()),
        }
    }
}

impl ParameterStore for MemoryStore {
    fn put(&mut self, key: &str, value: Value) -> Result<()> {
        self.params.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.params.get(key).cloned())
    }
}

impl IndexStore for MemoryStore {}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "tables:")?;
        for (name, tbl) in self.tables.iter() {
            writeln!(f, "{}: {} buckets", name, tbl.len())?;
        }
        writeln!(f, "params: {:?}", self.params.keys().collect::<Vec<_>>())
    }
}
