//! Re-export of the public api of molsketch.
#[cfg(feature = "sqlite")]
pub use crate::cursor::sql::{open_request, SqlCursor, SqlResolver};
#[cfg(feature = "sqlite")]
pub use crate::table::{sqlite::SqlStore, sqlite_mem::SqlStoreMem};
pub use crate::{
    build::{
        build_containment_index, build_similarity_index, containment_candidates,
        similarity_candidates, BuildReport, SimilarityTarget,
    },
    config::IndexConfig,
    cursor::stream::{PrefetchMap, RequestPack, ResultCursor, RowSource, Step, Termination},
    hash::{MinHash, PermutationFamily},
    lsh::{ensemble::MinHashLshEnsemble, lsh::MinHashLsh},
    table::{
        general::{BucketStore, FingerprintSource, IndexStore, ParameterStore, RecordId},
        mem::MemoryStore,
    },
    Error, Result,
};
