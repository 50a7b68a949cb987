//! # molsketch
//!
//! Approximate similarity and containment search over molecular fingerprints.
//!
//! A fingerprint is a set of integers describing structural features of a record. This crate
//! turns fingerprints into [MinHash](struct.MinHash.html) sketches and indexes the sketches with
//! locality sensitive hashing, so that candidates can be retrieved without comparing against
//! every record.
//!
//! ## Components
//! * [MinHash](struct.MinHash.html) sketches over a shared
//!   [PermutationFamily](struct.PermutationFamily.html).
//! * [MinHashLsh](struct.MinHashLsh.html): banded LSH for Jaccard similarity. The banding
//!   `(b, r)` is solved by [optimal_param](stats/fn.optimal_param.html).
//! * [MinHashLshEnsemble](struct.MinHashLshEnsemble.html): containment search over sets of very
//!   different sizes by partitioning on cardinality.
//! * The index build pipeline in [build](build/index.html), writing to a
//!   [BucketStore](trait.BucketStore.html) (in memory or Sqlite).
//! * [ResultCursor](cursor/stream/struct.ResultCursor.html): lazy streaming of large result sets
//!   with growing batches, bulk prefetch and early termination.
//!
//! ## Getting started
//!
//! ```rust
//! use molsketch::prelude::*;
//! use std::sync::Arc;
//!
//! let family = Arc::new(PermutationFamily::new(64, 1).unwrap());
//! let mut lsh = MinHashLsh::with_threshold(0.7, 64, (0.5, 0.5)).unwrap();
//!
//! let a = MinHash::from_fingerprint(family.clone(), &[1, 5, 9, 12, 40]);
//! lsh.insert(1, &a, true).unwrap();
//!
//! let candidates = lsh.query(&a).unwrap();
//! assert!(candidates.contains(&1));
//! ```
//!
//! ## Building persisted indexes
//!
//! ```rust
//! use molsketch::prelude::*;
//! use molsketch::build::{build_similarity_index, similarity_candidates, SimilarityTarget};
//!
//! let mut store = MemoryStore::new();
//! store.put_fingerprint("molecule_structure", 1, vec![1, 2, 3, 4]);
//! store.put_fingerprint("molecule_structure", 2, vec![100, 200, 300]);
//!
//! let config = IndexConfig::load(&store).unwrap();
//! build_similarity_index(&mut store, &config, SimilarityTarget::Molecule).unwrap();
//! let hits = similarity_candidates(&store, SimilarityTarget::Molecule, &[1, 2, 3, 4]).unwrap();
//! assert!(hits.contains(&1));
//! ```
//!
//! ## Logging
//! Build phases are logged at `info`, solver and cursor decisions at `debug` through the
//! [log](https://docs.rs/log) facade. No logger is installed by this crate.
mod hash;
mod lsh {
    pub mod ensemble;
    pub mod lsh;
    pub mod partition;
    mod test;
}
mod table {
    pub mod general;
    pub mod mem;
    #[cfg(feature = "sqlite")]
    pub mod sqlite;
    #[cfg(feature = "sqlite")]
    pub mod sqlite_mem;
}
pub mod cursor {
    pub mod stream;
    #[cfg(feature = "sqlite")]
    pub mod sql;
}
pub mod build;
mod config;
mod error;
pub mod prelude;
pub mod stats;
pub mod utils;

pub use crate::lsh::{
    ensemble::{adjusted_threshold, EnsembleParams, MinHashLshEnsemble, Probe},
    lsh::{band_key, band_keys, MinHashLsh},
    partition::{optimal_partitions, Partition},
};
pub use config::IndexConfig;
pub use error::Error;
pub use hash::{
    fnv_element_hash, identity_hash, ElementHash, Fingerprint, Hash, HashPrimitive, MinHash,
    PermutationFamily,
};
#[cfg(feature = "sqlite")]
pub use table::{sqlite::SqlStore, sqlite_mem::SqlStoreMem};
pub use table::{
    general::{
        Bucket, BucketRow, BucketStore, FingerprintSource, IndexStore, ParameterStore, RecordId,
    },
    mem::MemoryStore,
};

pub type Result<T> = std::result::Result<T, Error>;
