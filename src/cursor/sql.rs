//! Sqlite implementations of the cursor collaborators.
use crate::{
    cursor::stream::{Record, RelatedResolver, RequestPack, ResultCursor, RowSource},
    table::{general::RecordId, sqlite::check_name},
    Result,
};
use fnv::{FnvHashMap, FnvHashSet};
use itertools::Itertools;
use log::{debug, warn};
use rusqlite::{params, params_from_iter, types::Value, Connection};
use uuid::Uuid;

/// Ids per `IN (...)` lookup. Sqlite limits the number of bound parameters.
const RESOLVE_CHUNK: usize = 500;

impl Record for Vec<Value> {
    fn related_id(&self, position: usize) -> Option<RecordId> {
        match self.get(position) {
            Some(Value::Integer(id)) => Some(*id),
            _ => None,
        }
    }
}

/// Server side cursor emulation.
///
/// The request is materialized once into a uniquely named TEMP table that is paged through
/// by rowid. The table is dropped on [close](#method.close) and on drop.
pub struct SqlCursor<'conn> {
    conn: &'conn Connection,
    table: String,
    last_rowid: i64,
    open: bool,
}

impl<'conn> SqlCursor<'conn> {
    /// # Arguments
    /// * `request` - A SELECT statement. Its order is the order rows are produced in.
    pub fn open(conn: &'conn Connection, request: &str) -> Result<Self> {
        let table = format!("cursor_{}", Uuid::new_v4().simple());
        conn.execute_batch(&format!("CREATE TEMP TABLE {} AS {}", table, request))?;
        debug!("opened cursor table {}", table);
        Ok(SqlCursor {
            conn,
            table,
            last_rowid: 0,
            open: true,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn fetch(&mut self, n: usize) -> Result<Vec<Vec<Value>>> {
        if !self.open {
            return Ok(vec![]);
        }
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT rowid, * FROM temp.{} WHERE rowid > ?1 ORDER BY rowid LIMIT ?2",
            self.table
        ))?;
        let ncols = stmt.column_count();
        let rows = stmt.query_map(params![self.last_rowid, n as i64], |row| {
            let rowid: i64 = row.get(0)?;
            let values = (1..ncols)
                .map(|i| row.get::<_, Value>(i))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok((rowid, values))
        })?;
        let mut out = Vec::with_capacity(n.min(1000));
        for row in rows {
            let (rowid, values) = row?;
            self.last_rowid = rowid;
            out.push(values);
        }
        Ok(out)
    }
}

impl<'conn> RowSource for SqlCursor<'conn> {
    type Row = Vec<Value>;

    fn fetch_one(&mut self) -> Result<Option<Vec<Value>>> {
        Ok(self.fetch(1)?.pop())
    }

    fn fetch_many(&mut self, n: usize) -> Result<Vec<Vec<Value>>> {
        self.fetch(n)
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.conn
                .execute_batch(&format!("DROP TABLE IF EXISTS temp.{}", self.table))?;
            debug!("dropped cursor table {}", self.table);
        }
        Ok(())
    }
}

impl<'conn> Drop for SqlCursor<'conn> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("could not drop cursor table {}: {}", self.table, e);
        }
    }
}

/// Loads related rows with one `SELECT ... WHERE id IN (...)` per chunk of ids.
pub struct SqlResolver<'conn> {
    conn: &'conn Connection,
    cache: FnvHashMap<RecordId, Vec<Value>>,
}

impl<'conn> SqlResolver<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        SqlResolver {
            conn,
            cache: FnvHashMap::default(),
        }
    }
}

impl<'conn> RelatedResolver for SqlResolver<'conn> {
    /// Requested fields in request order.
    type Entity = Vec<Value>;

    fn resolve_many(
        &mut self,
        kind: &str,
        ids: &FnvHashSet<RecordId>,
        fields: &[String],
    ) -> Result<()> {
        let kind = check_name(kind)?;
        let mut columns = vec!["id"];
        for f in fields {
            columns.push(check_name(f)?);
        }
        let columns = columns.join(", ");

        for chunk in &ids.iter().copied().sorted().chunks(RESOLVE_CHUNK) {
            let chunk: Vec<RecordId> = chunk.collect();
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {} FROM {} WHERE id IN ({})",
                columns, kind, placeholders
            ))?;
            let ncols = stmt.column_count();
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                let id: i64 = row.get(0)?;
                let values = (1..ncols)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((id, values))
            })?;
            for row in rows {
                let (id, values) = row?;
                self.cache.insert(id, values);
            }
        }
        Ok(())
    }

    fn get(&self, id: RecordId) -> Option<&Vec<Value>> {
        self.cache.get(&id)
    }
}

/// Run `pack.request` on `conn` and stream its rows through the pack's postprocessing.
pub fn open_request<'conn, F>(
    conn: &'conn Connection,
    pack: RequestPack<F>,
) -> Result<ResultCursor<SqlCursor<'conn>, SqlResolver<'conn>, F>> {
    let source = SqlCursor::open(conn, &pack.request)?;
    Ok(ResultCursor::from_pack(source, SqlResolver::new(conn), pack))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cursor::stream::{PrefetchMap, Step, Termination};
    use crate::Error;

    fn temp_tables(conn: &Connection) -> i64 {
        conn.query_row(
            "SELECT count(*) FROM sqlite_temp_master WHERE type = 'table'",
            params![],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE structure (id INTEGER PRIMARY KEY, smiles TEXT);
             CREATE TABLE hit (id INTEGER PRIMARY KEY, structure_id INTEGER, score REAL);",
        )
        .unwrap();
        for i in 1..=25i64 {
            conn.execute(
                "INSERT INTO structure (id, smiles) VALUES (?1, ?2)",
                params![i, format!("C{}", i)],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO hit (id, structure_id, score) VALUES (?1, ?2, ?3)",
                params![i, 26 - i, i as f64 / 25.],
            )
            .unwrap();
        }
        conn
    }

    #[test]
    fn test_cursor_streams_in_order() {
        let conn = setup();
        let pack = RequestPack::new(
            "SELECT id, structure_id FROM hit ORDER BY score DESC",
            |row: Vec<Value>, _: &SqlResolver| match row[0] {
                Value::Integer(id) => Step::Yield(id),
                _ => Step::Skip,
            },
        );
        let mut cursor = open_request(&conn, pack).unwrap();
        assert_eq!(temp_tables(&conn), 1);
        let ids: Vec<RecordId> = cursor.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(ids, (1..=25).rev().collect::<Vec<_>>());
        assert_eq!(cursor.termination(), Some(Termination::Exhausted));
        assert_eq!(temp_tables(&conn), 0);
    }

    #[test]
    fn test_cursor_prefetch_and_stop() {
        let conn = setup();
        let prefetch = PrefetchMap {
            entity: "structure".to_string(),
            id_position: 1,
            fields: vec!["smiles".to_string()],
        };
        let mut found = 0;
        let pack = RequestPack::new(
            "SELECT id, structure_id FROM hit ORDER BY id",
            move |row: Vec<Value>, related: &SqlResolver| {
                if found == 3 {
                    return Step::Stop;
                }
                match row.related_id(1).and_then(|id| related.get(id)) {
                    Some(fields) => {
                        found += 1;
                        Step::Yield(fields[0].clone())
                    }
                    None => Step::Skip,
                }
            },
        )
        .with_prefetch(prefetch);
        let mut cursor = open_request(&conn, pack).unwrap();
        let smiles: Vec<Value> = cursor.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(
            smiles,
            vec![
                Value::Text("C25".to_string()),
                Value::Text("C24".to_string()),
                Value::Text("C23".to_string())
            ]
        );
        assert_eq!(cursor.termination(), Some(Termination::EarlyStop));
        assert_eq!(temp_tables(&conn), 0);
    }

    #[test]
    fn test_drop_releases_temp_table() {
        let conn = setup();
        {
            let mut cursor = SqlCursor::open(&conn, "SELECT id FROM hit").unwrap();
            assert_eq!(cursor.fetch_many(5).unwrap().len(), 5);
            assert_eq!(temp_tables(&conn), 1);
        }
        assert_eq!(temp_tables(&conn), 0);
    }

    #[test]
    fn test_invalid_request() {
        let conn = setup();
        let pack = RequestPack::new("SELECT nope FROM missing", |_: Vec<Value>, _: &SqlResolver| {
            Step::Yield(())
        });
        assert!(matches!(open_request(&conn, pack), Err(Error::SqlFailure(_))));
    }

    #[test]
    fn test_resolver_chunks() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE structure (id INTEGER PRIMARY KEY, smiles TEXT);")
            .unwrap();
        for i in 0..1200i64 {
            conn.execute(
                "INSERT INTO structure (id, smiles) VALUES (?1, ?2)",
                params![i, "C"],
            )
            .unwrap();
        }
        let mut resolver = SqlResolver::new(&conn);
        let ids: FnvHashSet<RecordId> = (0..1200).collect();
        resolver
            .resolve_many("structure", &ids, &["smiles".to_string()])
            .unwrap();
        assert!(ids.iter().all(|id| resolver.get(*id).is_some()));
        assert!(resolver
            .resolve_many("structure; DROP TABLE structure", &ids, &[])
            .is_err());
    }
}
