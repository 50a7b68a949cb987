use crate::{
    hash::{HashPrimitive, MinHash, PermutationFamily},
    stats::optimal_param,
    table::general::{Bucket, BucketRow, RecordId},
    Error, Result,
};
use fnv::{FnvHashMap as HashMap, FnvHashSet, FnvHasher};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::hash::Hasher;
use std::io::{Read, Write};
use std::path::Path;

/// Hash `r` consecutive sketch slots into a single band key.
pub fn band_key(slots: &[HashPrimitive]) -> u64 {
    let mut hasher = FnvHasher::default();
    for &v in slots {
        hasher.write_u64(v);
    }
    hasher.finish()
}

/// Band keys of a sketch for banding `(b, r)`. Slots beyond `b * r` are ignored.
pub fn band_keys(hashvalues: &[HashPrimitive], b: usize, r: usize) -> Vec<u64> {
    hashvalues
        .chunks_exact(r)
        .take(b)
        .map(band_key)
        .collect()
}

/// Fails with `Error::MismatchedSketch` if `minhash` was made with another family.
pub(crate) fn check_family(family: &PermutationFamily, minhash: &MinHash) -> Result<()> {
    if family != minhash.family().as_ref() {
        return Err(Error::MismatchedSketch {
            expected: format!("permutation seed {}", family.seed()),
            found: format!("permutation seed {}", minhash.family().seed()),
        });
    }
    Ok(())
}

/// MinHash LSH over a single banding `(b, r)`.
///
/// Every band owns a map from band key to the bucket of record ids that produced that key.
/// The buckets are plain data: they can be exported as [BucketRow](struct.BucketRow.html)s
/// for a store and loaded back.
///
/// An index only accepts sketches of a single [PermutationFamily]. The family is fixed with
/// [with_family](#method.with_family) or taken from the first inserted sketch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinHashLsh {
    /// Length of the sketches `K`.
    num_perm: usize,
    /// Number of bands.
    b: usize,
    /// Rows per band.
    r: usize,
    /// One table per band.
    hash_tables: Vec<HashMap<u64, Bucket>>,
    /// Ids that have been inserted.
    keys: FnvHashSet<RecordId>,
    family: Option<PermutationFamily>,
}

impl MinHashLsh {
    /// # Arguments
    ///
    /// * `num_perm` - Length of the sketches that will be indexed.
    /// * `params` - Banding `(b, r)`. `b * r` must equal `num_perm`.
    pub fn new(num_perm: usize, params: (usize, usize)) -> Result<Self> {
        let (b, r) = params;
        if b == 0 || r == 0 || b * r != num_perm {
            return Err(Error::param(format!(
                "banding ({}, {}) does not cover {} permutations",
                b, r, num_perm
            )));
        }
        Ok(MinHashLsh {
            num_perm,
            b,
            r,
            hash_tables: vec![HashMap::default(); b],
            keys: FnvHashSet::default(),
            family: None,
        })
    }

    /// Only accept sketches of `family`.
    pub fn with_family(mut self, family: PermutationFamily) -> Result<Self> {
        if family.num_perm() != self.num_perm {
            return Err(Error::MismatchedSketch {
                expected: format!("num_perm {}", self.num_perm),
                found: format!("num_perm {}", family.num_perm()),
            });
        }
        self.family = Some(family);
        Ok(self)
    }

    /// Create an index tuned for a Jaccard `threshold`.
    ///
    /// # Arguments
    ///
    /// * `weights` - Relative cost of (false positives, false negatives).
    pub fn with_threshold(threshold: f64, num_perm: usize, weights: (f64, f64)) -> Result<Self> {
        let params = optimal_param(threshold, num_perm, weights.0, weights.1)?;
        Self::new(num_perm, params)
    }

    /// Rebuild an index from exported rows.
    pub fn from_rows<I>(num_perm: usize, params: (usize, usize), rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = BucketRow>,
    {
        let mut lsh = Self::new(num_perm, params)?;
        for row in rows {
            let tbl = lsh
                .hash_tables
                .get_mut(row.band as usize)
                .ok_or_else(|| Error::TableNotExist(format!("band {}", row.band)))?;
            let bucket = tbl.entry(row.key).or_insert_with(FnvHashSet::default);
            for id in row.records {
                bucket.insert(id);
                lsh.keys.insert(id);
            }
        }
        Ok(lsh)
    }

    pub fn params(&self) -> (usize, usize) {
        (self.b, self.r)
    }

    pub fn num_perm(&self) -> usize {
        self.num_perm
    }

    /// Permutation family of the indexed sketches, if already known.
    pub fn family(&self) -> Option<&PermutationFamily> {
        self.family.as_ref()
    }

    /// Slot ranges `[start, end)` of every band.
    pub fn hashranges(&self) -> Vec<(usize, usize)> {
        (0..self.b).map(|i| (i * self.r, (i + 1) * self.r)).collect()
    }

    fn validate_sketch(&self, minhash: &MinHash) -> Result<()> {
        if minhash.num_perm() != self.num_perm {
            return Err(Error::MismatchedSketch {
                expected: format!("num_perm {}", self.num_perm),
                found: format!("num_perm {}", minhash.num_perm()),
            });
        }
        match &self.family {
            Some(family) => check_family(family, minhash),
            None => Ok(()),
        }
    }

    fn adopt_family(&mut self, minhash: &MinHash) -> bool {
        if self.family.is_some() {
            return false;
        }
        self.family = Some(minhash.family().as_ref().clone());
        true
    }

    pub fn band_keys(&self, minhash: &MinHash) -> Result<Vec<u64>> {
        self.validate_sketch(minhash)?;
        Ok(band_keys(minhash.hashvalues(), self.b, self.r))
    }

    fn insert_keys(&mut self, id: RecordId, keys: &[u64]) {
        for (tbl, &key) in self.hash_tables.iter_mut().zip(keys) {
            tbl.entry(key)
                .or_insert_with(FnvHashSet::default)
                .insert(id);
        }
        self.keys.insert(id);
    }

    /// Store a single sketch under `id`.
    ///
    /// # Arguments
    /// * `check_duplication` - Fail if `id` is already indexed. If false, the insert is not
    ///   checked; buckets are sets so the id is still only stored once per bucket.
    pub fn insert(&mut self, id: RecordId, minhash: &MinHash, check_duplication: bool) -> Result<()> {
        if check_duplication && self.keys.contains(&id) {
            return Err(Error::param(format!("id {} is already indexed", id)));
        }
        let keys = self.band_keys(minhash)?;
        self.adopt_family(minhash);
        self.insert_keys(id, &keys);
        Ok(())
    }

    /// Store many sketches. Band keys are computed in parallel, the tables are written by
    /// this thread only.
    pub fn insert_batch(
        &mut self,
        items: &[(RecordId, MinHash)],
        check_duplication: bool,
    ) -> Result<()> {
        if check_duplication {
            let mut seen = FnvHashSet::default();
            for (id, _) in items {
                if self.keys.contains(id) || !seen.insert(*id) {
                    return Err(Error::param(format!("id {} is already indexed", id)));
                }
            }
        }
        let adopted = match items.first() {
            Some((_, m)) => self.validate_sketch(m).is_ok() && self.adopt_family(m),
            None => false,
        };
        let keys = match items
            .par_iter()
            .map(|(_, m)| self.band_keys(m))
            .collect::<Result<Vec<_>>>()
        {
            Ok(keys) => keys,
            Err(e) => {
                if adopted {
                    self.family = None;
                }
                return Err(e);
            }
        };
        for ((id, _), keys) in items.iter().zip(keys) {
            self.insert_keys(*id, &keys);
        }
        Ok(())
    }

    /// Query all bands. The union of the matching buckets is returned.
    ///
    /// Candidates are not verified against the threshold.
    pub fn query(&self, minhash: &MinHash) -> Result<Bucket> {
        self.query_b(minhash, self.b)
    }

    /// Query only the first `b` bands.
    pub fn query_b(&self, minhash: &MinHash, b: usize) -> Result<Bucket> {
        if b == 0 || b > self.b {
            return Err(Error::param(format!(
                "cannot query {} bands of an index with {} bands",
                b, self.b
            )));
        }
        let keys = self.band_keys(minhash)?;
        let mut bucket_union = Bucket::default();
        for (tbl, key) in self.hash_tables.iter().zip(&keys).take(b) {
            if let Some(bucket) = tbl.get(key) {
                bucket_union.extend(bucket.iter().copied());
            }
        }
        Ok(bucket_union)
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.keys.contains(&id)
    }

    /// Number of indexed ids.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Remove every bucket. A rebuild always starts here; there is no partial update.
    /// The permutation family stays fixed.
    pub fn clear(&mut self) {
        for tbl in self.hash_tables.iter_mut() {
            tbl.clear()
        }
        self.keys.clear();
    }

    /// Export all buckets as rows for a band table. Bands are numbered from 0, see
    /// [BucketRow].
    pub fn bucket_rows(&self, partition: u32, model: u32) -> Vec<BucketRow> {
        let mut rows = Vec::with_capacity(self.hash_tables.iter().map(|t| t.len()).sum());
        for (band, tbl) in self.hash_tables.iter().enumerate() {
            for (&key, bucket) in tbl.iter() {
                let mut records: Vec<RecordId> = bucket.iter().copied().collect();
                records.sort_unstable();
                rows.push(BucketRow {
                    partition,
                    model,
                    band: band as u32,
                    key,
                    records,
                });
            }
        }
        rows
    }

    pub fn describe(&self) -> Result<String> {
        let lengths: Vec<usize> = self
            .hash_tables
            .iter()
            .flat_map(|tbl| tbl.values().map(|b| b.len()))
            .collect();
        if lengths.is_empty() {
            return Ok(format!("No buckets. b: {}, r: {}", self.b, self.r));
        }
        let max_len = lengths.iter().max().copied().unwrap_or(0);
        let min_len = lengths.iter().min().copied().unwrap_or(0);
        Ok(format!(
            "Bucket lengths: max: {}, min: {}, avg: {}, buckets: {}, ids: {}, b: {}, r: {}",
            max_len,
            min_len,
            lengths.iter().sum::<usize>() as f32 / lengths.len() as f32,
            lengths.len(),
            self.keys.len(),
            self.b,
            self.r
        ))
    }

    pub fn dump<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let blob = bincode::serialize(self)?;
        let mut f = File::create(path)?;
        f.write_all(&blob)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut f = File::open(path)?;
        let mut buf: Vec<u8> = vec![];
        f.read_to_end(&mut buf)?;
        Ok(bincode::deserialize(&buf)?)
    }
}
