//! An index: settings, the discovered mapping and a fixed set of shards.
//!
//! Writes are queued as jobs on one writer thread and return once queued.
//! Queries fan out over the shards on a rayon pool and are merged here.

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use threadpool::ThreadPool;

use crate::aggs::Aggs;
use crate::analyzer::{Analyzer, AnalyzerRegistry};
use crate::config::{read_settings, write_settings, Settings};
use crate::error::Error;
use crate::filter::Filter;
use crate::mapping::{read_mapping, write_mapping, FieldType, Mapping};
use crate::query::{num_pages, FacetCount, Query, QueryRequest, QueryResponse};
use crate::sdata::{generate_id, ID_FIELD};
use crate::shard::{shard_for, Shard};
use crate::sort::{RankOrder, Rule};
use crate::squery::{ShardHits, ShardQuery};

enum Job {
    Add(Vec<Value>),
    Update(Vec<Value>),
    Delete(Vec<String>),
    Clear,
    Reindex,
}

struct IndexState {
    settings: Settings,
    mapping: Mapping,
}

struct Inner {
    path: PathBuf,
    shards: Vec<Shard>,
    state: RwLock<IndexState>,
    analyzer: Box<dyn Analyzer>,
    rayon_pool: rayon::ThreadPool,
}

pub struct Index {
    name: String,
    inner: Arc<Inner>,
    writer: Mutex<ThreadPool>,
    pending: Arc<AtomicUsize>,
}

impl Index {
    /// Creates a new index at `path`. The directory must not hold one yet.
    pub fn create(path: &Path, settings: Settings) -> Result<Index, Error> {
        settings.validate()?;
        AnalyzerRegistry::new().get(&settings.analyzer)?;
        std::fs::create_dir_all(path)?;
        if path.join(crate::config::SETTINGS_FILE).exists() {
            return Err(Error::invalid(format!("Index already exists at {}", path.display())));
        }
        write_settings(path, &settings)?;
        let mut mapping = Mapping::new();
        mapping.apply_config(&settings)?;
        write_mapping(path, &mapping)?;
        Index::open(path)
    }

    pub fn open(path: &Path) -> Result<Index, Error> {
        let settings = read_settings(path)?;
        let mapping = read_mapping(path)?.unwrap_or_default();
        let analyzer = AnalyzerRegistry::new().get(&settings.analyzer)?;
        let mut shards = Vec::with_capacity(settings.num_shards);
        for id in 0..settings.num_shards {
            shards.push(Shard::open(path, id, analyzer.clone(), settings.durable)?);
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        tracing::info!(index = %name, shards = shards.len(), ready = mapping.ready_to_index(), "opened index");
        let writer_name = format!("marlin-writer-{}", name);
        Ok(Index {
            inner: Arc::new(Inner {
                path: path.to_path_buf(),
                shards,
                state: RwLock::new(IndexState { settings, mapping }),
                analyzer,
                rayon_pool: rayon::ThreadPoolBuilder::new()
                    .thread_name(|i| format!("marlin-search-{}", i))
                    .build()?,
            }),
            name,
            writer: Mutex::new(ThreadPool::with_name(writer_name, 1)),
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn settings(&self) -> Settings {
        self.inner.state.read().settings.clone()
    }

    pub fn mapping_json(&self) -> Value {
        self.inner.state.read().mapping.to_json()
    }

    /// Queues documents for indexing and returns their external ids. A
    /// document without an id gets a generated one.
    pub fn add_documents(&self, docs: Vec<Value>) -> Result<Vec<String>, Error> {
        let id_field = self.inner.state.read().settings.id_field.clone();
        let mut ids = Vec::with_capacity(docs.len());
        let mut prepared = Vec::with_capacity(docs.len());
        for mut doc in docs {
            let obj = match doc {
                Value::Object(ref mut obj) => obj,
                _ => return Err(Error::invalid("Document must be a JSON object")),
            };
            let ext = match obj.get(&id_field) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                None => generate_id(),
                Some(_) => return Err(Error::invalid(format!("Invalid {} in document", id_field))),
            };
            obj.insert(ID_FIELD.to_string(), Value::String(ext.clone()));
            ids.push(ext);
            prepared.push(doc);
        }
        self.submit(Job::Add(prepared))?;
        Ok(ids)
    }

    /// Queues a shallow merge of each document into the stored one with the
    /// same id.
    pub fn update_documents(&self, docs: Vec<Value>) -> Result<(), Error> {
        for doc in &docs {
            match doc.get(ID_FIELD) {
                Some(Value::String(s)) if !s.is_empty() => {}
                _ => return Err(Error::invalid("Update without document id")),
            }
        }
        self.submit(Job::Update(docs))
    }

    pub fn delete_documents(&self, ids: Vec<String>) -> Result<(), Error> {
        self.submit(Job::Delete(ids))
    }

    /// Queues removal of every document. Settings and mapping stay.
    pub fn clear(&self) -> Result<(), Error> {
        self.submit(Job::Clear)
    }

    pub fn get_document(&self, ext: &str) -> Result<Option<Value>, Error> {
        let shard = shard_for(ext, self.inner.shards.len());
        self.inner.shards[shard].get(ext)
    }

    pub fn num_docs(&self) -> Result<u64, Error> {
        let mut n = 0;
        for shard in &self.inner.shards {
            n += shard.count()?;
        }
        Ok(n)
    }

    /// Applies a JSON object of changed settings. A change of indexed or
    /// facet fields queues a rebuild of every shard index.
    pub fn update_settings(&self, update: &Value) -> Result<Settings, Error> {
        let mut state = self.inner.state.write();
        let next = state.settings.merged(update)?;
        if next.analyzer != state.settings.analyzer {
            return Err(Error::invalid("analyzer cannot be changed"));
        }
        let reindex = state.settings.fields_changed(&next);
        if reindex {
            let mut probe = state.mapping.clone();
            probe.apply_config(&next)?;
        }
        write_settings(&self.inner.path, &next)?;
        state.settings = next.clone();
        drop(state);
        if reindex {
            self.submit(Job::Reindex)?;
        }
        Ok(next)
    }

    /// Blocks until every queued write has run.
    pub fn wait_for_writes(&self) {
        self.writer.lock().join();
    }

    fn submit(&self, job: Job) -> Result<(), Error> {
        let limit = self.inner.state.read().settings.queue_length;
        if self.pending.fetch_add(1, Ordering::SeqCst) >= limit {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::TooManyRequests);
        }
        let inner = self.inner.clone();
        let pending = self.pending.clone();
        self.writer.lock().execute(move || {
            if let Err(e) = inner.run(job) {
                tracing::error!(path = ?inner.path, error = %e, "write job failed");
            }
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    pub fn search(&self, req: &QueryRequest) -> Result<QueryResponse, Error> {
        let started = Instant::now();
        req.validate()?;
        let state = self.inner.state.read();
        let settings = &state.settings;
        let mapping = &state.mapping;

        let hits_per_page = req.hits_per_page.unwrap_or(settings.hits_per_page);
        let max_hits = req.max_hits.unwrap_or(settings.max_hits);
        let max_facet_results = req.max_facet_results.unwrap_or(settings.max_facet_results);
        let rules = match req.rules {
            Some(ref names) => Rule::parse_all(names)?,
            None => settings.sort_rules()?,
        };
        let rank_by = settings.rank_by.as_ref().and_then(|path| match mapping.index_field(path) {
            Some(f) if f.indexed && f.ftype == FieldType::Number => Some(f.i_priority),
            _ => {
                tracing::debug!(field = %path, "rank field not indexed as a number");
                None
            }
        });
        let order = RankOrder::new(&rules, rank_by.map(|_| settings.rank_asc));
        let query = Query::parse(&req.q, self.inner.analyzer.as_ref(), settings.prefix_search, settings.typos);
        let filter = match req.filter {
            Some(ref f) => Some(Filter::parse(f, mapping)?),
            None => None,
        };
        let aggs = match req.aggs {
            Some(ref a) => Some(Aggs::parse(a, mapping)?),
            None => None,
        };
        let facet_names: Vec<String> = match req.facets {
            Some(ref names) => names.clone(),
            None => mapping.facets.iter().map(|f| f.name.clone()).collect(),
        };
        let mut facets = Vec::with_capacity(facet_names.len());
        for name in &facet_names {
            match mapping.facets.iter().position(|f| &f.name == name) {
                Some(p) => facets.push(p as u8),
                None => return Err(Error::invalid(format!("Unknown facet field {}", name))),
            }
        }
        let keep = req.page.saturating_mul(hits_per_page).min(max_hits);
        let sq = ShardQuery {
            query: &query,
            filter: filter.as_ref(),
            facets: &facets,
            aggs: aggs.as_ref(),
            order: &order,
            rank_by,
            rank_asc: settings.rank_asc,
            keep,
            max_hits,
            full_scan_threshold: settings.full_scan_threshold,
            force_full_scan: req.full_scan,
        };

        let shards = &self.inner.shards;
        let results: Vec<Result<ShardHits, Error>> = self
            .inner
            .rayon_pool
            .install(|| shards.par_iter().map(|s| s.search(&sq)).collect());
        drop(state);

        let mut failures = Vec::new();
        let mut parts = Vec::with_capacity(results.len());
        for (shard, result) in results.into_iter().enumerate() {
            match result {
                Ok(hits) => parts.push(hits),
                Err(error) => {
                    tracing::warn!(index = %self.name, shard, error = %error, "shard query failed");
                    failures.push(Error::ShardFailed {
                        shard,
                        error: Box::new(error),
                    });
                }
            }
        }
        if !failures.is_empty() {
            if shards.len() == 1 {
                return Err(failures.remove(0));
            }
            return Err(Error::ShardsFailed(failures));
        }

        let mut total = 0;
        let mut full_scan = true;
        let mut rank_lists = Vec::with_capacity(parts.len());
        let mut counts: Vec<HashMap<String, u64>> = vec![HashMap::new(); facets.len()];
        let mut merged_aggs: Option<Aggs> = None;
        for part in parts {
            total += part.total;
            full_scan &= part.full_scan;
            rank_lists.push(part.ranks);
            for (slot, field) in part.facets.into_iter().enumerate() {
                for (value, n) in field {
                    *counts[slot].entry(value).or_insert(0) += n;
                }
            }
            if let Some(a) = part.aggs {
                match merged_aggs {
                    Some(ref mut m) => m.merge(a),
                    None => merged_aggs = Some(a),
                }
            }
        }
        let ranks = order.merge(rank_lists, keep);

        let start = (req.page - 1).saturating_mul(hits_per_page);
        let mut hits = Vec::new();
        for rank in ranks.iter().skip(start).take(hits_per_page) {
            let doc = match shards[rank.shard as usize].fetch(rank.docid)? {
                Some(doc) => doc,
                None => continue,
            };
            hits.push(match (req.explain, doc) {
                (true, Value::Object(mut obj)) => {
                    obj.insert(
                        "_rank".to_string(),
                        json!({
                            "typos": rank.typos,
                            "proximity": rank.proximity,
                            "position": rank.position,
                            "exact": rank.exact,
                            "field": rank.field,
                        }),
                    );
                    Value::Object(obj)
                }
                (_, doc) => doc,
            });
        }

        let mut facet_json = Map::new();
        for (name, field) in facet_names.into_iter().zip(counts) {
            facet_json.insert(name, top_facets(field, max_facet_results)?);
        }

        Ok(QueryResponse {
            total_hits: total,
            num_hits: hits.len(),
            page: req.page,
            num_pages: num_pages(total, max_hits, hits_per_page),
            hits,
            facets: facet_json,
            aggs: merged_aggs.map(|a| a.to_json()).unwrap_or_default(),
            took: started.elapsed().as_millis() as u64,
            full_scan,
        })
    }
}

/// Most frequent values first, ties by value.
fn top_facets(counts: HashMap<String, u64>, limit: usize) -> Result<Value, Error> {
    let mut values: Vec<FacetCount> = counts
        .into_iter()
        .map(|(value, count)| FacetCount { value, count })
        .collect();
    values.sort_unstable_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    values.truncate(limit);
    Ok(serde_json::to_value(values)?)
}

impl Inner {
    fn run(&self, job: Job) -> Result<(), Error> {
        match job {
            Job::Add(docs) => self.put(docs),
            Job::Update(docs) => {
                let mut merged = Vec::with_capacity(docs.len());
                for doc in docs {
                    let (ext, changes) = match (doc.get(ID_FIELD).and_then(Value::as_str), &doc) {
                        (Some(ext), Value::Object(changes)) => (ext.to_string(), changes),
                        _ => continue,
                    };
                    let shard = &self.shards[shard_for(&ext, self.shards.len())];
                    match shard.get(&ext)? {
                        Some(Value::Object(mut stored)) => {
                            for (k, v) in changes {
                                stored.insert(k.clone(), v.clone());
                            }
                            merged.push(Value::Object(stored));
                        }
                        _ => tracing::warn!(id = %ext, "update of unknown document skipped"),
                    }
                }
                self.put(merged)
            }
            Job::Delete(ids) => {
                let mapping = self.state.read().mapping.clone();
                let mut by_shard: Vec<Vec<String>> = vec![Vec::new(); self.shards.len()];
                for ext in ids {
                    by_shard[shard_for(&ext, self.shards.len())].push(ext);
                }
                let deleted = self.rayon_pool.install(|| {
                    self.shards
                        .par_iter()
                        .zip(by_shard.par_iter())
                        .map(|(shard, ids)| if ids.is_empty() { Ok(0) } else { shard.delete(ids, &mapping) })
                        .collect::<Result<Vec<usize>, Error>>()
                })?;
                tracing::info!(path = ?self.path, deleted = deleted.iter().sum::<usize>(), "deleted documents");
                Ok(())
            }
            Job::Clear => {
                self.rayon_pool.install(|| self.shards.par_iter().try_for_each(Shard::clear))?;
                tracing::info!(path = ?self.path, "cleared index");
                Ok(())
            }
            Job::Reindex => {
                let (mapping, batch_size) = {
                    let mut state = self.state.write();
                    let settings = state.settings.clone();
                    state.mapping.apply_config(&settings)?;
                    write_mapping(&self.path, &state.mapping)?;
                    (state.mapping.clone(), settings.batch_size)
                };
                self.reindex(&mapping, batch_size)
            }
        }
    }

    /// Learns the mapping from the documents, indexes stored documents if
    /// that made the mapping ready, then stores and indexes the documents.
    fn put(&self, docs: Vec<Value>) -> Result<(), Error> {
        if docs.is_empty() {
            return Ok(());
        }
        let (mapping, batch_size, became_ready) = {
            let mut state = self.state.write();
            let mut changed = false;
            for doc in &docs {
                if let Value::Object(obj) = doc {
                    changed |= state.mapping.extract(obj);
                }
            }
            let mut became_ready = false;
            if changed {
                if !state.mapping.ready_to_index() {
                    let settings = state.settings.clone();
                    became_ready = state.mapping.apply_config(&settings)?;
                }
                write_mapping(&self.path, &state.mapping)?;
            }
            (state.mapping.clone(), state.settings.batch_size, became_ready)
        };
        if became_ready {
            tracing::info!(path = ?self.path, "mapping ready, indexing stored documents");
            self.reindex(&mapping, batch_size)?;
        }

        let mut by_shard: Vec<Vec<Value>> = vec![Vec::new(); self.shards.len()];
        for doc in docs {
            let shard = match doc.get(ID_FIELD).and_then(Value::as_str) {
                Some(ext) => shard_for(ext, self.shards.len()),
                None => {
                    tracing::warn!("skipping document without id");
                    continue;
                }
            };
            by_shard[shard].push(doc);
        }
        self.rayon_pool.install(|| {
            self.shards
                .par_iter()
                .zip(by_shard.par_iter())
                .try_for_each(|(shard, docs)| -> Result<(), Error> {
                    for chunk in docs.chunks(batch_size) {
                        shard.put(chunk, &mapping)?;
                    }
                    Ok(())
                })
        })
    }

    fn reindex(&self, mapping: &Mapping, batch_size: usize) -> Result<(), Error> {
        self.rayon_pool
            .install(|| self.shards.par_iter().try_for_each(|s| s.reindex(mapping, batch_size)))
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use tempfile::TempDir;

    fn settings() -> Settings {
        Settings {
            num_shards: 3,
            indexed_fields: vec!["title".into(), "likes".into()],
            facet_fields: vec!["color".into()],
            durable: false,
            ..Settings::default()
        }
    }

    #[test]
    fn create_twice_fails_and_reopen_keeps_settings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movies");
        let index = Index::create(&path, settings()).unwrap();
        assert_eq!("movies", index.name());
        drop(index);
        assert!(Index::create(&path, settings()).is_err());
        let index = Index::open(&path).unwrap();
        assert_eq!(settings(), index.settings());
    }

    #[test]
    fn add_search_update_delete() {
        let dir = TempDir::new().unwrap();
        let index = Index::create(&dir.path().join("i"), settings()).unwrap();
        let ids = index
            .add_documents(vec![
                json!({"_id": "1", "title": "blue sky", "likes": 3, "color": "blue"}),
                json!({"_id": "2", "title": "red sky", "likes": 9, "color": "red"}),
                json!({"title": "green grass", "likes": 1, "color": "green"}),
            ])
            .unwrap();
        assert_eq!("1", ids[0]);
        assert_eq!(22, ids[2].len());
        index.wait_for_writes();
        assert_eq!(3, index.num_docs().unwrap());

        let res = index.search(&QueryRequest::new("sky")).unwrap();
        assert_eq!(2, res.total_hits);
        assert!(res.full_scan);
        assert_eq!(json!([{"value": "blue", "count": 1}, {"value": "red", "count": 1}]), res.facets["color"]);

        index
            .update_documents(vec![json!({"_id": "1", "title": "blue sea"})])
            .unwrap();
        index.delete_documents(vec!["2".to_string()]).unwrap();
        index.wait_for_writes();
        assert_eq!(0, index.search(&QueryRequest::new("sky")).unwrap().total_hits);
        let doc = index.get_document("1").unwrap().unwrap();
        assert_eq!(json!("blue sea"), doc["title"]);
        assert_eq!(json!(3), doc["likes"]);
    }

    #[test]
    fn stored_documents_indexed_when_mapping_ready() {
        let dir = TempDir::new().unwrap();
        let index = Index::create(&dir.path().join("i"), settings()).unwrap();
        index.add_documents(vec![json!({"_id": "a", "title": "late"})]).unwrap();
        index.wait_for_writes();
        assert_eq!(json!(false), index.mapping_json()["ready"]);
        assert_eq!(0, index.search(&QueryRequest::new("late")).unwrap().total_hits);
        index
            .add_documents(vec![json!({"_id": "b", "title": "later", "likes": 1, "color": "red"})])
            .unwrap();
        index.wait_for_writes();
        assert_eq!(json!(true), index.mapping_json()["ready"]);
        assert_eq!(2, index.search(&QueryRequest::new("late")).unwrap().total_hits);
    }

    #[test]
    fn settings_change_reindexes() {
        let dir = TempDir::new().unwrap();
        let index = Index::create(&dir.path().join("i"), settings()).unwrap();
        index
            .add_documents(vec![json!({"_id": "a", "title": "x", "body": "hidden words", "likes": 1, "color": "red"})])
            .unwrap();
        index.wait_for_writes();
        assert_eq!(0, index.search(&QueryRequest::new("hidden")).unwrap().total_hits);
        assert!(index.update_settings(&json!({"numShards": 2})).is_err());
        index
            .update_settings(&json!({"indexedFields": ["title", "body", "likes"]}))
            .unwrap();
        index.wait_for_writes();
        assert_eq!(1, index.search(&QueryRequest::new("hidden")).unwrap().total_hits);
    }

    #[test]
    fn search_rejects_zero_page_and_page_size() {
        let dir = TempDir::new().unwrap();
        let index = Index::create(&dir.path().join("i"), settings()).unwrap();
        let mut req = QueryRequest::new("sky");
        req.page = 0;
        match index.search(&req) {
            Err(Error::InvalidInput(msg)) => assert_eq!("page starts at 1", msg),
            other => panic!("unexpected {:?}", other.map(|r| r.total_hits)),
        }
        let req = QueryRequest {
            hits_per_page: Some(0),
            ..QueryRequest::new("sky")
        };
        assert!(index.search(&req).is_err());
        assert!(index.search(&QueryRequest::new("sky")).is_ok());
    }

    #[test]
    fn queue_limit() {
        let dir = TempDir::new().unwrap();
        let mut s = settings();
        s.queue_length = 1;
        let index = Index::create(&dir.path().join("i"), s).unwrap();
        let mut refused = false;
        for i in 0..50 {
            match index.add_documents(vec![json!({"_id": i.to_string(), "title": "t"})]) {
                Err(Error::TooManyRequests) => refused = true,
                other => {
                    other.unwrap();
                }
            }
        }
        index.wait_for_writes();
        assert!(refused);
    }
}
