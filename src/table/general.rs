use crate::Result;
use fnv::FnvHashSet;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Id of an indexed record in the backing store.
pub type RecordId = i64;
/// Bucket contains the ids of the records that hashed to it.
pub type Bucket = FnvHashSet<RecordId>;

/// One bucket of a persisted band table.
///
/// Plain similarity tables only use partition 0 and model 0. Ensemble tables store every
/// (partition, model) index in the same table.
///
/// Bands are numbered from 0 in every table. Tables written with 1-based band numbers (as
/// some older layouts of the similarity tables do) are not compatible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRow {
    pub partition: u32,
    pub model: u32,
    pub band: u32,
    pub key: u64,
    pub records: Vec<RecordId>,
}

/// Ordered supply of `(id, fingerprint)` pairs used by the index build pipeline.
pub trait FingerprintSource {
    /// Lazily stream the fingerprints of `table`, ordered by id.
    fn stream_fingerprints<'a>(
        &'a self,
        table: &str,
    ) -> Result<Box<dyn Iterator<Item = Result<(RecordId, Vec<u64>)>> + 'a>>;
}

/// Storage of band tables.
pub trait BucketStore {
    /// Replace all rows of `table`. Returns the number of rows written.
    ///
    /// Implementations should make the swap atomic. Readers then see the previous generation
    /// until the new one is complete.
    fn replace_table(&mut self, table: &str, rows: Vec<BucketRow>) -> Result<usize>;

    fn clear_table(&mut self, table: &str) -> Result<()>;

    /// Query the whole bucket. Fails with `Error::NotFound` if the bucket is empty.
    fn lookup(
        &self,
        table: &str,
        partition: u32,
        model: u32,
        band: u32,
        key: u64,
    ) -> Result<Bucket>;
}

/// String keyed JSON storage for persisted banding parameters and configuration.
pub trait ParameterStore {
    fn put(&mut self, key: &str, value: Value) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Value>>;
}

/// A store that can hold a complete index generation: band table plus parameters.
pub trait IndexStore: BucketStore + ParameterStore {
    /// Replace `table` and write `params`.
    ///
    /// The default implementation first sets every parameter to `null`, which marks the index
    /// as missing, then swaps the table and writes the parameters. If invalidating fails the
    /// previous generation is untouched. A later failure leaves the index marked missing and
    /// the table cleared. Stores with transactions should override it so that the table and
    /// its parameters become visible at once.
    fn replace_index(
        &mut self,
        table: &str,
        rows: Vec<BucketRow>,
        params: &[(&str, Value)],
    ) -> Result<usize> {
        for (key, _) in params {
            self.put(key, Value::Null)?;
        }
        let written = self.replace_table(table, rows).and_then(|n| {
            for (key, value) in params {
                self.put(key, value.clone())?;
            }
            Ok(n)
        });
        if written.is_err() {
            if let Err(e) = self.clear_table(table) {
                warn!("could not clear {} after a failed write: {}", table, e);
            }
        }
        written
    }
}
