use crate::{
    hash::{MinHash, PermutationFamily},
    lsh::{
        lsh::{band_keys, check_family, MinHashLsh},
        partition::{optimal_partitions, Partition},
    },
    stats::optimal_containment_param,
    table::general::{Bucket, BucketRow, RecordId},
    utils::{linspace, search_sorted_left},
    Error, Result,
};
use itertools::Itertools;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of size ratios `|X| / |Q|` the banding is tuned for.
pub const NUM_SIZE_RATIOS: usize = 10;

/// Similarity threshold to use in a partition with upper bound `upper` for a query of
/// `query_size` elements and containment threshold `threshold`.
///
/// `t' = t * |Q| / max(|Q|, upper)`
pub fn adjusted_threshold(threshold: f64, query_size: usize, upper: usize) -> f64 {
    let q = query_size as f64;
    threshold * q / q.max(upper as f64)
}

/// Everything needed to reproduce the banding of an ensemble without its tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleParams {
    pub threshold: f64,
    pub num_perm: usize,
    pub num_part: usize,
    pub max_r: usize,
    pub weights: (f64, f64),
    /// Size ratios the banding was tuned for, increasing.
    pub xqs: Vec<f64>,
    /// Banding `(b, r)` per size ratio.
    pub params: Vec<(usize, usize)>,
    /// Distinct `r` values. The position of an `r` is its model number.
    pub rs: Vec<usize>,
    /// Bounds per partition. `None` for partitions that received no items.
    pub partitions: Vec<Option<Partition>>,
}

/// One LSH lookup of a containment query.
///
/// The model and `b` are picked from the size ratio `upper / |Q|`. `adjusted_threshold` does
/// not take part in that choice; it is kept for logging and inspection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    pub partition: usize,
    pub model: usize,
    /// Number of bands to look up.
    pub b: usize,
    pub r: usize,
    /// Similarity threshold equivalent to the containment threshold in this partition.
    pub adjusted_threshold: f64,
}

impl EnsembleParams {
    pub fn new(
        threshold: f64,
        num_perm: usize,
        num_part: usize,
        max_r: usize,
        weights: (f64, f64),
    ) -> Result<Self> {
        if !(0. ..=1.).contains(&threshold) {
            return Err(Error::param("threshold must be in [0.0, 1.0]"));
        }
        if num_perm < 2 {
            return Err(Error::param("too few permutation functions"));
        }
        if num_part < 1 {
            return Err(Error::param("num_part must be at least 1"));
        }
        if max_r < 2 || max_r > num_perm {
            return Err(Error::param("max_r must be in the range of [2, num_perm]"));
        }
        let (fp_w, fn_w) = weights;
        if !(0. ..=1.).contains(&fp_w) || !(0. ..=1.).contains(&fn_w) {
            return Err(Error::param("weight must be in [0.0, 1.0]"));
        }
        if (fp_w + fn_w - 1.).abs() > 1e-9 {
            return Err(Error::param("weights must sum to 1.0"));
        }

        let xqs: Vec<f64> = linspace(-5., 5., NUM_SIZE_RATIOS)
            .into_iter()
            .map(f64::exp)
            .collect();
        let params = xqs
            .iter()
            .map(|&xq| optimal_containment_param(threshold, num_perm, max_r, xq, fp_w, fn_w))
            .collect::<Result<Vec<_>>>()?;
        let rs: Vec<usize> = params.iter().map(|&(_, r)| r).sorted().dedup().collect();
        debug!("ensemble banding per size ratio: {:?}, models r={:?}", params, rs);

        Ok(EnsembleParams {
            threshold,
            num_perm,
            num_part,
            max_r,
            weights,
            xqs,
            params,
            rs,
            partitions: vec![None; num_part],
        })
    }

    /// Banding tuned for indexed sets of size `x` and a query of size `q`.
    pub fn banding_for(&self, x: usize, q: usize) -> (usize, usize) {
        let mut i = search_sorted_left(&self.xqs, x as f64 / q as f64);
        if i == self.params.len() {
            i -= 1
        }
        self.params[i]
    }

    pub fn model_of(&self, r: usize) -> Option<usize> {
        self.rs.iter().position(|&x| x == r)
    }

    /// Lookups needed to answer a containment query of `query_size` elements.
    ///
    /// Partitions whose sets are all smaller than `threshold * query_size` cannot contain
    /// enough of the query and are skipped.
    pub fn plan(&self, query_size: usize) -> Result<Vec<Probe>> {
        if query_size == 0 {
            return Err(Error::param("query set size must be positive"));
        }
        let min_size = self.threshold * query_size as f64;
        let mut probes = Vec::with_capacity(self.partitions.len());
        for (i, part) in self.partitions.iter().enumerate() {
            let part = match part {
                Some(part) => part,
                None => continue,
            };
            if (part.upper as f64) < min_size {
                continue;
            }
            let (b, r) = self.banding_for(part.upper, query_size);
            let model = self
                .model_of(r)
                .ok_or_else(|| Error::param(format!("no model for r={}", r)))?;
            probes.push(Probe {
                partition: i,
                model,
                b,
                r,
                adjusted_threshold: adjusted_threshold(self.threshold, query_size, part.upper),
            });
        }
        Ok(probes)
    }
}

/// LSH Ensemble for containment queries over sets of very different sizes.
///
/// Items are partitioned by cardinality. Every partition holds one [MinHashLsh] per model
/// (distinct `r` of the tuned bandings). The structure is built once from the full item
/// population with [index](#method.index); it does not support inserts afterwards.
#[derive(Debug, Clone)]
pub struct MinHashLshEnsemble {
    params: EnsembleParams,
    /// `indexes[partition][model]`
    indexes: Vec<Vec<MinHashLsh>>,
    /// Family of the indexed sketches, known after [index](#method.index).
    family: Option<PermutationFamily>,
}

impl MinHashLshEnsemble {
    /// # Arguments
    ///
    /// * `threshold` - Containment threshold in `[0, 1]`.
    /// * `num_perm` - Sketch length.
    /// * `num_part` - Number of cardinality partitions.
    /// * `max_r` - Upper bound on the rows per band.
    /// * `weights` - (false positive, false negative) weights, summing to 1.
    pub fn new(
        threshold: f64,
        num_perm: usize,
        num_part: usize,
        max_r: usize,
        weights: (f64, f64),
    ) -> Result<Self> {
        let params = EnsembleParams::new(threshold, num_perm, num_part, max_r, weights)?;
        let indexes = Self::empty_indexes(&params)?;
        Ok(MinHashLshEnsemble {
            params,
            indexes,
            family: None,
        })
    }

    fn empty_indexes(params: &EnsembleParams) -> Result<Vec<Vec<MinHashLsh>>> {
        (0..params.num_part)
            .map(|_| {
                params
                    .rs
                    .iter()
                    .map(|&r| MinHashLsh::new(params.num_perm, (params.num_perm / r, r)))
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }

    pub fn params(&self) -> &EnsembleParams {
        &self.params
    }

    pub fn partitions(&self) -> &[Option<Partition>] {
        &self.params.partitions
    }

    pub fn family(&self) -> Option<&PermutationFamily> {
        self.family.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.iter().flatten().all(|lsh| lsh.is_empty())
    }

    /// Index all entries `(id, sketch, set size)` at once.
    pub fn index(&mut self, mut entries: Vec<(RecordId, MinHash, usize)>) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::param("cannot call index again on a non-empty index"));
        }
        if entries.is_empty() {
            return Err(Error::param("entries is empty"));
        }
        if entries.iter().any(|(_, _, size)| *size == 0) {
            return Err(Error::param("set size must be positive"));
        }
        let family = entries[0].1.family().as_ref().clone();
        for (_, minhash, _) in entries.iter() {
            self.validate_sketch(minhash)?;
            check_family(&family, minhash)?;
        }
        entries.sort_by_key(|(_, _, size)| *size);

        let mut sizes = Vec::new();
        let mut counts = Vec::new();
        for (size, group) in &entries.iter().group_by(|(_, _, size)| *size) {
            sizes.push(size);
            counts.push(group.count());
        }
        let partitions = optimal_partitions(&sizes, &counts, self.params.num_part)?;
        debug!("ensemble partitions: {:?}", partitions);
        for (slot, part) in self.params.partitions.iter_mut().zip(&partitions) {
            *slot = Some(*part);
        }

        // entries are sorted by size, so every partition is a contiguous run
        let mut groups: Vec<Vec<(RecordId, MinHash)>> = vec![vec![]; self.params.num_part];
        let mut curr_part = 0;
        for (id, minhash, size) in entries {
            while size > partitions[curr_part].upper {
                curr_part += 1
            }
            groups[curr_part].push((id, minhash));
        }

        // partitions own disjoint tables: one writer per table
        let result = self
            .indexes
            .par_iter_mut()
            .zip(groups.par_iter())
            .try_for_each(|(models, items)| -> Result<()> {
                for lsh in models.iter_mut() {
                    lsh.insert_batch(items, true)?;
                }
                Ok(())
            });
        if result.is_err() {
            // never leave a half built ensemble behind
            self.indexes = Self::empty_indexes(&self.params)?;
            self.params.partitions = vec![None; self.params.num_part];
        } else {
            self.family = Some(family);
        }
        result
    }

    fn validate_sketch(&self, minhash: &MinHash) -> Result<()> {
        if minhash.num_perm() != self.params.num_perm {
            return Err(Error::MismatchedSketch {
                expected: format!("num_perm {}", self.params.num_perm),
                found: format!("num_perm {}", minhash.num_perm()),
            });
        }
        match &self.family {
            Some(family) => check_family(family, minhash),
            None => Ok(()),
        }
    }

    /// Candidate ids of indexed sets that may contain at least `threshold` of the query.
    ///
    /// # Arguments
    /// * `minhash` - Sketch of the query set.
    /// * `size` - Exact size of the query set.
    pub fn query(&self, minhash: &MinHash, size: usize) -> Result<Bucket> {
        self.validate_sketch(minhash)?;
        let mut candidates = Bucket::default();
        for probe in self.params.plan(size)? {
            debug!(
                "probing partition {} at threshold {:.3} with b={}, r={}",
                probe.partition, probe.adjusted_threshold, probe.b, probe.r
            );
            let lsh = &self.indexes[probe.partition][probe.model];
            candidates.extend(lsh.query_b(minhash, probe.b)?);
        }
        Ok(candidates)
    }

    /// Export all tables as rows.
    pub fn bucket_rows(&self) -> Vec<BucketRow> {
        self.indexes
            .iter()
            .enumerate()
            .flat_map(|(p, models)| {
                models
                    .iter()
                    .enumerate()
                    .flat_map(move |(m, lsh)| lsh.bucket_rows(p as u32, m as u32))
            })
            .collect()
    }

    /// Slot ranges of every model, keyed by model number.
    pub fn hashranges(&self) -> BTreeMap<usize, Vec<(usize, usize)>> {
        self.indexes
            .first()
            .map(|models| {
                models
                    .iter()
                    .enumerate()
                    .map(|(m, lsh)| (m, lsh.hashranges()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Band keys a probe looks up.
pub fn probe_keys(minhash: &MinHash, probe: &Probe) -> Vec<u64> {
    band_keys(minhash.hashvalues(), probe.b, probe.r)
}
