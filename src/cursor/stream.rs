//! Lazy consumption of a large ordered result set.
//!
//! A [ResultCursor] pulls rows from a [RowSource] in growing batches, bulk prefetches
//! related records for every batch and passes each row through a postprocessing function
//! that decides whether the row is yielded, skipped, or ends the stream.
use crate::{table::general::RecordId, Error, Result};
use fnv::{FnvHashMap, FnvHashSet};
use log::{debug, warn};
use std::collections::VecDeque;
use std::iter::FusedIterator;

/// Size of the first batch after the single row fetch.
pub const INITIAL_BATCH_SIZE: usize = 10;
pub const BATCH_GROWTH: usize = 10;
pub const MAX_BATCH_SIZE: usize = 1000;

/// Decision of the postprocessing function for a single row.
#[derive(Debug, Clone, PartialEq)]
pub enum Step<V> {
    /// Produce a value.
    Yield(V),
    /// Drop the row and continue with the next one.
    Skip,
    /// End the stream. Remaining rows are never fetched.
    Stop,
}

/// Which related records to load ahead for every fetched batch.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchMap {
    /// Kind (table) of the related records.
    pub entity: String,
    /// Column of a row that holds the related id.
    pub id_position: usize,
    /// Fields of the related records to load.
    pub fields: Vec<String>,
}

/// A query plus everything needed to turn its rows into values.
pub struct RequestPack<F> {
    pub request: String,
    pub postprocess: F,
    pub prefetch_map: Option<PrefetchMap>,
}

impl<F> RequestPack<F> {
    pub fn new<S: Into<String>>(request: S, postprocess: F) -> Self {
        RequestPack {
            request: request.into(),
            postprocess,
            prefetch_map: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch_map: PrefetchMap) -> Self {
        self.prefetch_map = Some(prefetch_map);
        self
    }
}

/// A fetched row.
pub trait Record {
    /// Id stored at column `position`, if that column holds one.
    fn related_id(&self, position: usize) -> Option<RecordId>;
}

impl Record for Vec<RecordId> {
    fn related_id(&self, position: usize) -> Option<RecordId> {
        self.get(position).copied()
    }
}

impl Record for RecordId {
    fn related_id(&self, position: usize) -> Option<RecordId> {
        if position == 0 {
            Some(*self)
        } else {
            None
        }
    }
}

/// Forward only cursor over ordered rows.
pub trait RowSource {
    type Row: Record;

    fn fetch_one(&mut self) -> Result<Option<Self::Row>>;

    /// Up to `n` rows. An empty result means the source is exhausted.
    fn fetch_many(&mut self, n: usize) -> Result<Vec<Self::Row>>;

    /// Release the underlying resource. Must be safe to call more than once.
    fn close(&mut self) -> Result<()>;
}

/// Bulk loader of related records into a local cache.
pub trait RelatedResolver {
    type Entity;

    fn resolve_many(
        &mut self,
        kind: &str,
        ids: &FnvHashSet<RecordId>,
        fields: &[String],
    ) -> Result<()>;

    fn get(&self, id: RecordId) -> Option<&Self::Entity>;
}

/// Resolver for cursors without a prefetch map.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrefetch;

impl RelatedResolver for NoPrefetch {
    type Entity = ();

    fn resolve_many(&mut self, _: &str, _: &FnvHashSet<RecordId>, _: &[String]) -> Result<()> {
        Ok(())
    }

    fn get(&self, _: RecordId) -> Option<&()> {
        None
    }
}

/// Rows held in memory, e.g. candidates of an index query.
#[derive(Debug, Clone)]
pub struct MemoryRows<T> {
    rows: VecDeque<T>,
    requests: Vec<usize>,
    closed: bool,
}

impl<T> MemoryRows<T> {
    pub fn new<I: IntoIterator<Item = T>>(rows: I) -> Self {
        MemoryRows {
            rows: rows.into_iter().collect(),
            requests: vec![],
            closed: false,
        }
    }

    /// Row counts asked for by every fetch so far.
    pub fn requests(&self) -> &[usize] {
        &self.requests
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::param("fetch from a closed source"));
        }
        Ok(())
    }
}

impl<T: Record> RowSource for MemoryRows<T> {
    type Row = T;

    fn fetch_one(&mut self) -> Result<Option<T>> {
        self.check_open()?;
        self.requests.push(1);
        Ok(self.rows.pop_front())
    }

    fn fetch_many(&mut self, n: usize) -> Result<Vec<T>> {
        self.check_open()?;
        self.requests.push(n);
        let n = n.min(self.rows.len());
        Ok(self.rows.drain(..n).collect())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }
}

/// Resolver over in memory tables of related records.
#[derive(Debug, Clone)]
pub struct MemoryResolver<E> {
    tables: FnvHashMap<String, FnvHashMap<RecordId, E>>,
    cache: FnvHashMap<RecordId, E>,
    lookups: usize,
}

impl<E> Default for MemoryResolver<E> {
    fn default() -> Self {
        MemoryResolver {
            tables: FnvHashMap::default(),
            cache: FnvHashMap::default(),
            lookups: 0,
        }
    }
}

impl<E: Clone> MemoryResolver<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: &str, id: RecordId, entity: E) {
        self.tables
            .entry(kind.to_string())
            .or_insert_with(FnvHashMap::default)
            .insert(id, entity);
    }

    /// Number of bulk lookups done.
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}

impl<E: Clone> RelatedResolver for MemoryResolver<E> {
    type Entity = E;

    fn resolve_many(
        &mut self,
        kind: &str,
        ids: &FnvHashSet<RecordId>,
        _fields: &[String],
    ) -> Result<()> {
        let tbl = self
            .tables
            .get(kind)
            .ok_or_else(|| Error::TableNotExist(kind.to_string()))?;
        self.lookups += 1;
        for id in ids {
            if let Some(e) = tbl.get(id) {
                self.cache.insert(*id, e.clone());
            }
        }
        Ok(())
    }

    fn get(&self, id: RecordId) -> Option<&E> {
        self.cache.get(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing fetched yet.
    Open,
    Streaming,
    /// Terminal. See [Termination] for the reason.
    Exhausted,
}

/// Why a cursor reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The source has no more rows.
    Exhausted,
    /// The postprocessing function returned `Step::Stop`.
    EarlyStop,
    /// A fetch or prefetch failed.
    Failed,
    /// Closed (or dropped) by the owner.
    Closed,
}

/// Streaming cursor over a [RowSource].
///
/// The first pull fetches a single row. After that rows are fetched in batches of
/// 10, 100 and then 1000 rows. If a [PrefetchMap] is given, the related ids of every
/// fetched batch are resolved in one bulk lookup before any row of the batch is processed.
///
/// Values are produced as `Ok(v)`. A failing fetch produces a single
/// `Err(Error::StreamFailure)` after which the cursor ends. Values already produced stay
/// valid. The source is closed on every terminal transition and on drop.
pub struct ResultCursor<S: RowSource, R, F> {
    source: S,
    resolver: R,
    prefetch: Option<PrefetchMap>,
    postprocess: F,
    buf: VecDeque<S::Row>,
    batch_size: usize,
    state: CursorState,
    termination: Option<Termination>,
}

impl<S: RowSource, R, F> ResultCursor<S, R, F> {
    pub fn new(source: S, resolver: R, prefetch: Option<PrefetchMap>, postprocess: F) -> Self {
        ResultCursor {
            source,
            resolver,
            prefetch,
            postprocess,
            buf: VecDeque::new(),
            batch_size: INITIAL_BATCH_SIZE,
            state: CursorState::Open,
            termination: None,
        }
    }

    /// Cursor over `source` with the postprocessing and prefetch of `pack`. The request text
    /// was already used to open `source`.
    pub fn from_pack(source: S, resolver: R, pack: RequestPack<F>) -> Self {
        Self::new(source, resolver, pack.prefetch_map, pack.postprocess)
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Stop the stream and release the source. Does nothing on a terminated cursor.
    pub fn close(&mut self) {
        if self.state != CursorState::Exhausted {
            self.finish(Termination::Closed)
        }
    }

    fn finish(&mut self, termination: Termination) {
        debug!("cursor finished: {:?}", termination);
        self.state = CursorState::Exhausted;
        self.termination = Some(termination);
        self.buf.clear();
        if let Err(e) = self.source.close() {
            warn!("could not release cursor resource: {}", e);
        }
    }
}

impl<S, R, F> ResultCursor<S, R, F>
where
    S: RowSource,
    R: RelatedResolver,
{
    fn fetch(&mut self) -> Result<Vec<S::Row>> {
        match self.state {
            CursorState::Open => Ok(self.source.fetch_one()?.into_iter().collect()),
            _ => {
                debug!("cursor fetching batch of {}", self.batch_size);
                let rows = self.source.fetch_many(self.batch_size)?;
                if !rows.is_empty() && self.batch_size < MAX_BATCH_SIZE {
                    self.batch_size = (self.batch_size * BATCH_GROWTH).min(MAX_BATCH_SIZE);
                }
                Ok(rows)
            }
        }
    }

    fn prefetch(&mut self, rows: &[S::Row]) -> Result<()> {
        if let Some(map) = &self.prefetch {
            let ids: FnvHashSet<RecordId> = rows
                .iter()
                .filter_map(|row| row.related_id(map.id_position))
                .collect();
            if !ids.is_empty() {
                self.resolver.resolve_many(&map.entity, &ids, &map.fields)?;
            }
        }
        Ok(())
    }

    /// Refill the buffer. Returns false if the source is exhausted.
    fn refill(&mut self) -> Result<bool> {
        let rows = self.fetch()?;
        if rows.is_empty() {
            return Ok(false);
        }
        self.state = CursorState::Streaming;
        self.prefetch(&rows)?;
        self.buf.extend(rows);
        Ok(true)
    }
}

impl<S, R, F, V> Iterator for ResultCursor<S, R, F>
where
    S: RowSource,
    R: RelatedResolver,
    F: FnMut(S::Row, &R) -> Step<V>,
{
    type Item = Result<V>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.state == CursorState::Exhausted {
                return None;
            }
            let row = match self.buf.pop_front() {
                Some(row) => row,
                None => {
                    match self.refill() {
                        Ok(true) => {}
                        Ok(false) => self.finish(Termination::Exhausted),
                        Err(e) => {
                            self.finish(Termination::Failed);
                            return Some(Err(Error::StreamFailure(Box::new(e))));
                        }
                    }
                    continue;
                }
            };
            match (self.postprocess)(row, &self.resolver) {
                Step::Yield(v) => return Some(Ok(v)),
                Step::Skip => continue,
                Step::Stop => {
                    self.finish(Termination::EarlyStop);
                    return None;
                }
            }
        }
    }
}

impl<S, R, F, V> FusedIterator for ResultCursor<S, R, F>
where
    S: RowSource,
    R: RelatedResolver,
    F: FnMut(S::Row, &R) -> Step<V>,
{
}

impl<S: RowSource, R, F> Drop for ResultCursor<S, R, F> {
    fn drop(&mut self) {
        self.close()
    }
}
