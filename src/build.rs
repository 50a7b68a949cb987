//! Index build pipeline and the query services over persisted indexes.
//!
//! A build streams every fingerprint of a source table, sketches them in parallel, fills an
//! in memory [MinHashLsh] or [MinHashLshEnsemble] and writes its buckets together with the
//! parameters needed to query them. Readers keep seeing the previous generation until the
//! store swaps the table.
use crate::{
    config::IndexConfig,
    hash::{Fingerprint, MinHash, PermutationFamily},
    lsh::{
        ensemble::{probe_keys, EnsembleParams, MinHashLshEnsemble},
        lsh::{band_keys, MinHashLsh},
    },
    stats::optimal_param,
    table::general::{Bucket, BucketStore, FingerprintSource, IndexStore, ParameterStore, RecordId},
    Error, Result,
};
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Fingerprints of molecules.
pub const MOLECULE_SOURCE: &str = "molecule_structure";
/// Fingerprints of condensed graphs of reactions.
pub const CGR_SOURCE: &str = "cgr";
pub const CONTAINMENT_TABLE: &str = "molecule_containment_index";
pub const CONTAINMENT_HASHRANGES: &str = "lsh_ensemble_hashranges";
pub const CONTAINMENT_PARAMS: &str = "lsh_ensemble_params";

/// Which similarity index to build or query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityTarget {
    Molecule,
    Cgr,
}

impl SimilarityTarget {
    pub fn source_table(&self) -> &'static str {
        match self {
            SimilarityTarget::Molecule => MOLECULE_SOURCE,
            SimilarityTarget::Cgr => CGR_SOURCE,
        }
    }

    pub fn index_table(&self) -> &'static str {
        match self {
            SimilarityTarget::Molecule => "molecule_similarity_index",
            SimilarityTarget::Cgr => "cgr_similarity_index",
        }
    }

    pub fn hashranges_key(&self) -> &'static str {
        match self {
            SimilarityTarget::Molecule => "hashranges",
            SimilarityTarget::Cgr => "cgr_hashranges",
        }
    }

    pub fn params_key(&self) -> &'static str {
        match self {
            SimilarityTarget::Molecule => "molecule_similarity_params",
            SimilarityTarget::Cgr => "cgr_similarity_params",
        }
    }

    fn settings(&self, config: &IndexConfig) -> (usize, f64) {
        match self {
            SimilarityTarget::Molecule => (config.lsh_num_permute, config.lsh_threshold),
            SimilarityTarget::Cgr => (config.cgr_lsh_num_permute, config.cgr_lsh_threshold),
        }
    }
}

/// Persisted parameters of a similarity index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityParams {
    pub b: usize,
    pub r: usize,
    pub threshold: f64,
    pub family: PermutationFamily,
}

/// Persisted parameters of the containment index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainmentParams {
    pub ensemble: EnsembleParams,
    pub family: PermutationFamily,
}

fn load_params<T: DeserializeOwned, S: ParameterStore + ?Sized>(
    store: &S,
    key: &str,
    table: &str,
) -> Result<T> {
    match store.get(key)? {
        None | Some(Value::Null) => Err(Error::TableNotExist(table.to_string())),
        Some(v) => Ok(serde_json::from_value(v)?),
    }
}

impl SimilarityParams {
    pub fn load<S: ParameterStore + ?Sized>(store: &S, target: SimilarityTarget) -> Result<Self> {
        load_params(store, target.params_key(), target.index_table())
    }
}

impl ContainmentParams {
    pub fn load<S: ParameterStore + ?Sized>(store: &S) -> Result<Self> {
        load_params(store, CONTAINMENT_PARAMS, CONTAINMENT_TABLE)
    }
}

/// Outcome of a build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    pub table: String,
    /// Records indexed.
    pub items: usize,
    /// Bucket rows written.
    pub rows: usize,
    /// Parameters written next to the table, by key.
    pub params: Vec<(String, Value)>,
}

fn interrupted(e: Error) -> Error {
    Error::BuildInterrupted(Box::new(e))
}

fn read_fingerprints<S: FingerprintSource + ?Sized>(
    store: &S,
    table: &str,
) -> Result<Vec<(RecordId, Vec<u64>)>> {
    store
        .stream_fingerprints(table)?
        .collect::<Result<Vec<_>>>()
}

/// Number of distinct elements of a fingerprint.
pub fn fingerprint_size(fingerprint: &Fingerprint) -> usize {
    fingerprint.iter().unique().count()
}

fn write_generation<S: IndexStore + ?Sized>(
    store: &mut S,
    table: &str,
    rows: Vec<crate::BucketRow>,
    params: Vec<(String, Value)>,
    items: usize,
) -> Result<BuildReport> {
    let refs: Vec<(&str, Value)> = params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    info!("writing {} rows to {}", rows.len(), table);
    let rows = store.replace_index(table, rows, &refs).map_err(interrupted)?;
    info!("built {}: {} items, {} rows", table, items, rows);
    Ok(BuildReport {
        table: table.to_string(),
        items,
        rows,
        params,
    })
}

/// Rebuild the similarity index of `target` from scratch.
///
/// Invalid settings fail with `Error::Parameter` before the store is touched. Any storage
/// failure is reported as `Error::BuildInterrupted`; the previous generation stays in place
/// if the store swaps atomically.
pub fn build_similarity_index<S>(
    store: &mut S,
    config: &IndexConfig,
    target: SimilarityTarget,
) -> Result<BuildReport>
where
    S: FingerprintSource + IndexStore + ?Sized,
{
    config.validate()?;
    let (num_perm, threshold) = target.settings(config);
    let (b, r) = optimal_param(threshold, num_perm, config.weights.0, config.weights.1)?;
    let family = Arc::new(PermutationFamily::new(num_perm, config.seed)?);
    let mut lsh = MinHashLsh::new(num_perm, (b, r))?;
    info!(
        "building {} with K={}, t={}, b={}, r={}",
        target.index_table(),
        num_perm,
        threshold,
        b,
        r
    );

    let fingerprints = read_fingerprints(&*store, target.source_table()).map_err(interrupted)?;
    info!("sketching {} fingerprints", fingerprints.len());
    let sketches: Vec<(RecordId, MinHash)> = fingerprints
        .into_par_iter()
        .map(|(id, fp)| (id, MinHash::from_fingerprint(family.clone(), &fp)))
        .collect();
    lsh.insert_batch(&sketches, true)?;
    debug!("{}", lsh.describe()?);

    let params = SimilarityParams {
        b,
        r,
        threshold,
        family: (*family).clone(),
    };
    let params = vec![
        (target.hashranges_key().to_string(), json!(lsh.hashranges())),
        (target.params_key().to_string(), serde_json::to_value(&params)?),
    ];
    write_generation(
        store,
        target.index_table(),
        lsh.bucket_rows(0, 0),
        params,
        sketches.len(),
    )
}

/// Rebuild the molecule containment index (LSH Ensemble) from scratch.
///
/// Uses the molecule similarity settings for the sketch length and threshold. Empty
/// fingerprints cannot be partitioned by size and are left out.
pub fn build_containment_index<S>(store: &mut S, config: &IndexConfig) -> Result<BuildReport>
where
    S: FingerprintSource + IndexStore + ?Sized,
{
    config.validate()?;
    let num_perm = config.lsh_num_permute;
    let mut ensemble = MinHashLshEnsemble::new(
        config.lsh_threshold,
        num_perm,
        config.ensemble_num_part,
        config.ensemble_max_r,
        config.normalized_weights(),
    )?;
    let family = Arc::new(PermutationFamily::new(num_perm, config.seed)?);
    info!(
        "building {} with K={}, t={}, partitions={}",
        CONTAINMENT_TABLE, num_perm, config.lsh_threshold, config.ensemble_num_part
    );

    let fingerprints = read_fingerprints(&*store, MOLECULE_SOURCE).map_err(interrupted)?;
    let total = fingerprints.len();
    info!("sketching {} fingerprints", total);
    let entries: Vec<(RecordId, MinHash, usize)> = fingerprints
        .into_par_iter()
        .filter_map(|(id, fp)| {
            let size = fingerprint_size(&fp);
            if size == 0 {
                return None;
            }
            Some((id, MinHash::from_fingerprint(family.clone(), &fp), size))
        })
        .collect();
    if entries.len() < total {
        warn!("skipped {} empty fingerprints", total - entries.len());
    }
    let items = entries.len();
    if items > 0 {
        ensemble.index(entries)?;
    }

    let params = ContainmentParams {
        ensemble: ensemble.params().clone(),
        family: (*family).clone(),
    };
    let params = vec![
        (
            CONTAINMENT_HASHRANGES.to_string(),
            json!(ensemble.hashranges()),
        ),
        (CONTAINMENT_PARAMS.to_string(), serde_json::to_value(&params)?),
    ];
    write_generation(store, CONTAINMENT_TABLE, ensemble.bucket_rows(), params, items)
}

fn collect_bucket<S: BucketStore + ?Sized>(
    store: &S,
    table: &str,
    partition: u32,
    model: u32,
    keys: &[u64],
    candidates: &mut Bucket,
) -> Result<()> {
    for (band, &key) in keys.iter().enumerate() {
        match store.lookup(table, partition, model, band as u32, key) {
            Ok(bucket) => candidates.extend(bucket),
            Err(Error::NotFound) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Candidate ids of records similar to `fingerprint` in a persisted similarity index.
pub fn similarity_candidates<S>(
    store: &S,
    target: SimilarityTarget,
    fingerprint: &Fingerprint,
) -> Result<Bucket>
where
    S: BucketStore + ParameterStore + ?Sized,
{
    let params = SimilarityParams::load(store, target)?;
    let minhash = MinHash::from_fingerprint(Arc::new(params.family), fingerprint);
    let keys = band_keys(minhash.hashvalues(), params.b, params.r);
    let mut candidates = Bucket::default();
    collect_bucket(store, target.index_table(), 0, 0, &keys, &mut candidates)?;
    Ok(candidates)
}

/// Candidate ids of molecules that may contain `fingerprint` in the persisted containment
/// index.
pub fn containment_candidates<S>(store: &S, fingerprint: &Fingerprint) -> Result<Bucket>
where
    S: BucketStore + ParameterStore + ?Sized,
{
    let params = ContainmentParams::load(store)?;
    let size = fingerprint_size(fingerprint);
    let minhash = MinHash::from_fingerprint(Arc::new(params.family), fingerprint);
    let mut candidates = Bucket::default();
    for probe in params.ensemble.plan(size)? {
        debug!(
            "probing partition {} at threshold {:.3}",
            probe.partition, probe.adjusted_threshold
        );
        let keys = probe_keys(&minhash, &probe);
        collect_bucket(
            store,
            CONTAINMENT_TABLE,
            probe.partition as u32,
            probe.model as u32,
            &keys,
            &mut candidates,
        )?;
    }
    Ok(candidates)
}
