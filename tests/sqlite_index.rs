#![cfg(feature = "sqlite")]
use molsketch::build::{
    build_containment_index, build_similarity_index, containment_candidates,
    similarity_candidates, SimilarityTarget, MOLECULE_SOURCE,
};
use molsketch::cursor::sql::{open_request, SqlResolver};
use molsketch::cursor::stream::{
    PrefetchMap, Record, RelatedResolver, RequestPack, Step, Termination,
};
use molsketch::{IndexConfig, ParameterStore, RecordId, SqlStore, SqlStoreMem};
use rusqlite::types::Value;
use serde_json::json;

fn fingerprint(id: RecordId) -> Vec<u64> {
    // overlapping windows of growing size
    let start = id as u64 * 5;
    (start..start + 30 + id as u64 * 2).collect()
}

fn populate(store: &SqlStore, n: RecordId) {
    for id in 1..=n {
        store
            .put_fingerprint(MOLECULE_SOURCE, id, &fingerprint(id))
            .unwrap();
    }
}

#[test]
fn test_similarity_index_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("molecules.db3");
    {
        let mut store = SqlStore::open(&path).unwrap();
        populate(&store, 80);
        store.put("lsh_num_permute", json!(128)).unwrap();
        let config = IndexConfig::load(&store).unwrap();
        assert_eq!(config.lsh_num_permute, 128);
        let report =
            build_similarity_index(&mut store, &config, SimilarityTarget::Molecule).unwrap();
        assert_eq!(report.items, 80);
        assert_eq!(store.table_len("molecule_similarity_index").unwrap(), report.rows);
    }

    // parameters travel with the table
    let store = SqlStore::open(&path).unwrap();
    assert_eq!(store.get("hashranges").unwrap().unwrap()[0], json!([0, 8]));
    for id in 1..=80 {
        let hits =
            similarity_candidates(&store, SimilarityTarget::Molecule, &fingerprint(id)).unwrap();
        assert!(hits.contains(&id));
    }
}

#[test]
fn test_rebuild_swaps_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("molecules.db3");
    let mut store = SqlStore::open(&path).unwrap();
    populate(&store, 20);
    let config = IndexConfig::default();
    build_similarity_index(&mut store, &config, SimilarityTarget::Molecule).unwrap();

    let reader = SqlStore::open(&path).unwrap();
    let fp: Vec<u64> = (10_000..10_050).collect();
    assert!(!similarity_candidates(&reader, SimilarityTarget::Molecule, &fp)
        .unwrap()
        .contains(&99));

    store.put_fingerprint(MOLECULE_SOURCE, 99, &fp).unwrap();
    build_similarity_index(&mut store, &config, SimilarityTarget::Molecule).unwrap();
    assert!(similarity_candidates(&reader, SimilarityTarget::Molecule, &fp)
        .unwrap()
        .contains(&99));
}

#[test]
fn test_containment_index_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = SqlStore::open(dir.path().join("molecules.db3")).unwrap();
    // disjoint sets of sizes 10..=500
    for id in 1..=50i64 {
        let base = id as u64 * 1_000_000;
        let fp: Vec<u64> = (base..base + id as u64 * 10).collect();
        store.put_fingerprint(MOLECULE_SOURCE, id, &fp).unwrap();
    }
    let config = IndexConfig {
        ensemble_num_part: 8,
        lsh_threshold: 0.8,
        ..Default::default()
    };
    let report = build_containment_index(&mut store, &config).unwrap();
    assert_eq!(report.items, 50);
    assert!(store.get("lsh_ensemble_hashranges").unwrap().is_some());

    for id in 1..=50i64 {
        let base = id as u64 * 1_000_000;
        let fp: Vec<u64> = (base..base + id as u64 * 10).collect();
        assert!(containment_candidates(&store, &fp).unwrap().contains(&id));
    }
}

#[test]
fn test_in_memory_build_then_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backup.db3");
    let mut mem = SqlStoreMem::new().unwrap();
    populate(&mem, 10);
    build_similarity_index(&mut *mem, &IndexConfig::default(), SimilarityTarget::Molecule)
        .unwrap();
    mem.to_db(&path).unwrap();
    drop(mem);

    let store = SqlStore::open(&path).unwrap();
    let hits = similarity_candidates(&store, SimilarityTarget::Molecule, &fingerprint(3)).unwrap();
    assert!(hits.contains(&3));
}

#[test]
fn test_stream_candidates_through_cursor() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = SqlStore::open(dir.path().join("molecules.db3")).unwrap();
    populate(&store, 40);
    build_similarity_index(&mut store, &IndexConfig::default(), SimilarityTarget::Molecule)
        .unwrap();
    store
        .conn()
        .execute_batch(
            "CREATE TABLE molecule (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO molecule (id, name) SELECT id, 'mol' || id FROM molecule_structure;",
        )
        .unwrap();

    let hits = similarity_candidates(&store, SimilarityTarget::Molecule, &fingerprint(20)).unwrap();
    let ids = hits.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
    let request = format!(
        "SELECT id, id FROM molecule_structure WHERE id IN ({}) ORDER BY id",
        ids
    );
    let pack = RequestPack::new(request, |row: Vec<Value>, related: &SqlResolver| {
        match row.related_id(1).and_then(|id| related.get(id)) {
            Some(fields) => Step::Yield(fields[0].clone()),
            None => Step::Skip,
        }
    })
    .with_prefetch(PrefetchMap {
        entity: "molecule".to_string(),
        id_position: 1,
        fields: vec!["name".to_string()],
    });
    let mut cursor = open_request(store.conn(), pack).unwrap();
    let names: Vec<Value> = cursor.by_ref().map(|r| r.unwrap()).collect();
    assert_eq!(names.len(), hits.len());
    assert!(names.contains(&Value::Text("mol20".to_string())));
    assert_eq!(cursor.termination(), Some(Termination::Exhausted));
}
