//! Shard index: turns documents into postings, the numeric index and the
//! per document blobs.
//!
//! All writes of a batch go through one KV write transaction. Postings are
//! cached as managed bitmaps for the whole batch and saved once on commit.

use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Instant;

use crate::analyzer::Analyzer;
use crate::blob::{DocData, WordBlobBuilder};
use crate::dtrie::DiskTrie;
use crate::error::Error;
use crate::kv::{Dbi, KvRead, ReadTxn, Store, WriteTxn, INDEX_DBIS};
use crate::mapping::{FieldType, Mapping, Schema};
use crate::mbmap::{bmap_key, ManagedBitmap};
use crate::util::{f64_to_key, hash32, number_facet_string};
use crate::DocId;

pub const KV_FILE: &str = "index";
pub const TRIE_FILE: &str = "trie";

/// Tables emptied by `clear`. The word dictionary and its prefix postings
/// survive, since the trie does.
const CLEARED_DBIS: &[Dbi] = &[
    Dbi::FacetStr,
    Dbi::FacetBmap,
    Dbi::BoolBmap,
    Dbi::TwidDocs,
    Dbi::WidDocs,
    Dbi::DocData,
    Dbi::DocWords,
    Dbi::Numbers,
    Dbi::Docs,
];

pub const NUMBER_KEY_LEN: usize = 14;

/// Key of one entry in the numeric index.
pub fn number_key(priority: u8, value: f64, docid: DocId) -> [u8; NUMBER_KEY_LEN] {
    let mut key = [0u8; NUMBER_KEY_LEN];
    key[0..2].copy_from_slice(&u16::from(priority).to_be_bytes());
    key[2..10].copy_from_slice(&f64_to_key(value));
    key[10..14].copy_from_slice(&docid.to_be_bytes());
    key
}

/// Key prefix of every entry for `value` in the numeric index.
pub fn number_prefix(priority: u8, value: f64) -> [u8; 10] {
    let mut key = [0u8; 10];
    key[0..2].copy_from_slice(&u16::from(priority).to_be_bytes());
    key[2..10].copy_from_slice(&f64_to_key(value));
    key
}

pub fn bool_key(value: bool, priority: u8) -> u64 {
    bmap_key(value as u32, priority)
}

pub fn facet_key(facet_id: u32, priority: u8) -> u64 {
    bmap_key(facet_id, priority)
}

/// Word postings: priority 0 spans all fields, field `i` is at `i + 1`.
pub fn word_key(wid: u32, field: Option<u8>) -> u64 {
    bmap_key(wid, field.map_or(0, |p| p + 1))
}

pub const DOCS_KEY: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Index,
    Deindex,
}

pub struct ShardIndex {
    store: Store,
    trie: DiskTrie,
    analyzer: Box<dyn Analyzer>,
}

impl ShardIndex {
    pub fn open(dir: &Path, analyzer: Box<dyn Analyzer>, durable: bool) -> Result<ShardIndex, Error> {
        std::fs::create_dir_all(dir)?;
        let store = Store::open(&dir.join(KV_FILE), INDEX_DBIS, durable)?;
        let trie = DiskTrie::open(&dir.join(TRIE_FILE), &store.read()?)?;
        Ok(ShardIndex {
            store,
            trie,
            analyzer,
        })
    }

    pub fn read(&self) -> Result<ReadTxn, Error> {
        self.store.read()
    }

    pub fn trie(&self) -> &DiskTrie {
        &self.trie
    }

    pub fn analyzer(&self) -> &dyn Analyzer {
        self.analyzer.as_ref()
    }

    /// Starts a write batch. Fails if the mapping has no index schema yet.
    pub fn batch<'a>(&'a self, mapping: &'a Mapping) -> Result<IndexBatch<'a>, Error> {
        let schema = mapping
            .index_schema()
            .ok_or_else(|| Error::invalid("Mapping is not ready to index"))?;
        Ok(IndexBatch {
            index: self,
            mapping,
            schema,
            txn: self.store.write()?,
            postings: HashMap::new(),
            facets_seen: HashSet::new(),
            docs: 0,
            started: Instant::now(),
        })
    }

    /// Drops every posting and blob. Words stay in the dictionary.
    pub fn clear(&self) -> Result<(), Error> {
        let txn = self.store.write()?;
        for &dbi in CLEARED_DBIS {
            txn.clear(dbi)?;
        }
        txn.commit()
    }
}

/// Looks up the string a facet id was created from.
pub fn lookup_facet<T: KvRead>(txn: &T, facet_id: u32) -> Result<Option<String>, Error> {
    match txn.get(Dbi::FacetStr, &facet_id.to_be_bytes())? {
        Some(buf) => String::from_utf8(buf)
            .map(Some)
            .map_err(|_| Error::corrupt(format!("facet {} is not utf-8", facet_id))),
        None => Ok(None),
    }
}

pub fn doc_words<T: KvRead>(txn: &T, docid: DocId) -> Result<Option<Vec<u8>>, Error> {
    txn.get(Dbi::DocWords, &docid.to_be_bytes())
}

pub fn doc_data<T: KvRead>(txn: &T, docid: DocId) -> Result<Option<DocData>, Error> {
    match txn.get(Dbi::DocData, &docid.to_be_bytes())? {
        Some(buf) => Ok(Some(DocData::decode(&buf)?)),
        None => Ok(None),
    }
}

struct DocState {
    docid: DocId,
    words: WordBlobBuilder,
    data: DocData,
}

/// One write transaction worth of indexing and deindexing.
pub struct IndexBatch<'a> {
    index: &'a ShardIndex,
    mapping: &'a Mapping,
    schema: &'a Schema,
    txn: WriteTxn,
    postings: HashMap<(Dbi, u64), ManagedBitmap>,
    facets_seen: HashSet<u32>,
    docs: usize,
    started: Instant,
}

impl<'a> IndexBatch<'a> {
    pub fn add(&mut self, docid: DocId, doc: &Value) -> Result<(), Error> {
        let obj = match doc {
            Value::Object(obj) => obj,
            _ => return Err(Error::invalid("Document must be a JSON object")),
        };
        let mut state = DocState {
            docid,
            words: WordBlobBuilder::new(),
            data: DocData::new(self.mapping.numbers.len(), self.mapping.facets.len()),
        };
        let schema = self.schema;
        self.walk(Op::Index, &mut state, schema, Schema::ROOT, obj)?;
        let key = docid.to_be_bytes();
        if !state.words.is_empty() {
            self.txn.put(Dbi::DocWords, &key, &state.words.encode()?)?;
        }
        self.txn.put(Dbi::DocData, &key, &state.data.encode()?)?;
        self.posting(Op::Index, Dbi::Docs, DOCS_KEY, docid)?;
        self.docs += 1;
        Ok(())
    }

    /// Reverses `add` for the same document content.
    pub fn remove(&mut self, docid: DocId, doc: &Value) -> Result<(), Error> {
        let mut state = DocState {
            docid,
            words: WordBlobBuilder::new(),
            data: DocData::default(),
        };
        if let Value::Object(obj) = doc {
            let schema = self.schema;
            self.walk(Op::Deindex, &mut state, schema, Schema::ROOT, obj)?;
        }
        let key = docid.to_be_bytes();
        self.txn.del(Dbi::DocWords, &key)?;
        self.txn.del(Dbi::DocData, &key)?;
        self.posting(Op::Deindex, Dbi::Docs, DOCS_KEY, docid)?;
        self.docs += 1;
        Ok(())
    }

    /// Saves the cached postings and the trie free lists, then commits.
    pub fn commit(mut self) -> Result<(), Error> {
        for (&(dbi, _), bmap) in self.postings.iter_mut() {
            bmap.save(&self.txn, dbi)?;
        }
        self.index.trie.save(&self.txn)?;
        self.txn.commit()?;
        tracing::info!(
            docs = self.docs,
            postings = self.postings.len(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "committed index batch"
        );
        Ok(())
    }

    pub fn abort(self) -> Result<(), Error> {
        self.txn.abort()
    }

    fn posting(&mut self, op: Op, dbi: Dbi, key: u64, item: u32) -> Result<(), Error> {
        let txn = &self.txn;
        let bmap = match self.postings.entry((dbi, key)) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(ManagedBitmap::open(txn, dbi, key)?),
        };
        match op {
            Op::Index => bmap.add(txn, dbi, item)?,
            Op::Deindex => bmap.remove(txn, dbi, item)?,
        };
        Ok(())
    }

    fn walk(
        &mut self,
        op: Op,
        doc: &mut DocState,
        schema: &Schema,
        node: usize,
        obj: &Map<String, Value>,
    ) -> Result<(), Error> {
        for &child in schema.children(node) {
            let field = schema.field(child);
            let value = match obj.get(&field.name) {
                Some(v) => v,
                None => continue,
            };
            match (field.ftype, value) {
                (FieldType::String, Value::String(s)) => {
                    if field.facet {
                        self.facet(op, doc, s, field.f_priority)?;
                    }
                    if field.indexed {
                        self.string(op, doc, s, field.i_priority)?;
                    }
                }
                (FieldType::StrList, Value::Array(items)) => {
                    for s in items.iter().filter_map(Value::as_str) {
                        if field.facet {
                            self.facet(op, doc, s, field.f_priority)?;
                        }
                        if field.indexed {
                            self.string(op, doc, s, field.i_priority)?;
                        }
                    }
                }
                (FieldType::Number, Value::Number(n)) => {
                    let d = n.as_f64().unwrap_or(0.0);
                    if field.indexed {
                        if let Some(slot) = doc.data.numbers.get_mut(field.i_priority as usize) {
                            *slot = d;
                        }
                        self.number(op, doc.docid, d, field.i_priority)?;
                    }
                    if field.facet {
                        self.facet(op, doc, &number_facet_string(d), field.f_priority)?;
                    }
                }
                (FieldType::NumList, Value::Array(items)) => {
                    for d in items.iter().filter_map(Value::as_f64) {
                        if field.indexed {
                            self.number(op, doc.docid, d, field.i_priority)?;
                        }
                        if field.facet {
                            self.facet(op, doc, &number_facet_string(d), field.f_priority)?;
                        }
                    }
                }
                (FieldType::Boolean, Value::Bool(b)) => {
                    if field.indexed {
                        self.posting(op, Dbi::BoolBmap, bool_key(*b, field.i_priority), doc.docid)?;
                    }
                }
                (FieldType::Object, Value::Object(inner)) => {
                    self.walk(op, doc, schema, child, inner)?;
                }
                (FieldType::ObjList, Value::Array(items)) | (FieldType::List, Value::Array(items)) => {
                    for item in items {
                        if let Value::Object(inner) = item {
                            self.walk(op, doc, schema, child, inner)?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn facet(&mut self, op: Op, doc: &mut DocState, value: &str, priority: u8) -> Result<(), Error> {
        let facet_id = hash32(value);
        if op == Op::Index {
            if self.facets_seen.insert(facet_id) {
                let key = facet_id.to_be_bytes();
                if !self.txn.contains(Dbi::FacetStr, &key)? {
                    self.txn.put(Dbi::FacetStr, &key, value.as_bytes())?;
                }
            }
            if let Some(ids) = doc.data.facets.get_mut(priority as usize) {
                ids.push(facet_id);
            }
        }
        self.posting(op, Dbi::FacetBmap, facet_key(facet_id, priority), doc.docid)
    }

    fn number(&mut self, op: Op, docid: DocId, value: f64, priority: u8) -> Result<(), Error> {
        let key = number_key(priority, value, docid);
        match op {
            Op::Index => self.txn.put(Dbi::Numbers, &key, &[]),
            Op::Deindex => self.txn.del(Dbi::Numbers, &key).map(|_| ()),
        }
    }

    fn string(&mut self, op: Op, doc: &mut DocState, value: &str, priority: u8) -> Result<(), Error> {
        let mut tokens = Vec::new();
        self.index
            .analyzer
            .analyze_for_indexing(value, &mut |word, pos| tokens.push((word.to_vec(), pos)));
        for (word, position) in tokens {
            let ids = match op {
                Op::Index => self.index.trie.insert(&word)?,
                Op::Deindex => self.index.trie.exact_lookup(&word)?,
            };
            if ids.wid == 0 {
                tracing::warn!(docid = doc.docid, "deindexing a word missing from the dictionary");
                continue;
            }
            // Re-added on every index: the trie is not rolled back with an
            // aborted batch, so a word may exist without its postings.
            if op == Op::Index {
                for &twid in ids.twids.iter().filter(|&&t| t != 0) {
                    self.posting(op, Dbi::TwidWids, word_key(twid, None), ids.wid)?;
                    self.posting(op, Dbi::TwidWids, word_key(twid, Some(priority)), ids.wid)?;
                }
            }
            for &twid in &ids.twids {
                self.posting(op, Dbi::TwidDocs, word_key(twid, None), doc.docid)?;
                self.posting(op, Dbi::TwidDocs, word_key(twid, Some(priority)), doc.docid)?;
            }
            self.posting(op, Dbi::WidDocs, word_key(ids.wid, None), doc.docid)?;
            self.posting(op, Dbi::WidDocs, word_key(ids.wid, Some(priority)), doc.docid)?;
            if op == Op::Index {
                doc.words.add(ids.wid, priority, position);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::analyzer::DefaultAnalyzer;
    use crate::blob::WordBlob;
    use crate::config::Settings;
    use crate::mbmap::{load_bmap, load_or_empty};
    use serde_json::json;
    use std::ops::Bound;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, docs: &[Value], indexed: &[&str], facets: &[&str]) -> (ShardIndex, Mapping) {
        let mut mapping = Mapping::new();
        for d in docs {
            if let Value::Object(obj) = d {
                mapping.extract(obj);
            }
        }
        let settings = Settings {
            indexed_fields: indexed.iter().map(|s| s.to_string()).collect(),
            facet_fields: facets.iter().map(|s| s.to_string()).collect(),
            ..Settings::default()
        };
        assert!(mapping.apply_config(&settings).unwrap());
        let si = ShardIndex::open(dir.path(), Box::new(DefaultAnalyzer), false).unwrap();
        (si, mapping)
    }

    fn wid(si: &ShardIndex, word: &str) -> u32 {
        let chars: Vec<char> = word.chars().collect();
        si.trie().exact_lookup(&chars).unwrap().wid
    }

    #[test]
    fn indexes_words_facets_numbers_and_bools() {
        let dir = TempDir::new().unwrap();
        let doc = json!({"title": "hello big world", "color": "red", "likes": 4, "ok": true, "meta": {"lang": "en"}});
        let (si, mapping) = setup(&dir, &[doc.clone()], &["title", "likes", "ok", "meta.lang"], &["color", "likes"]);
        let mut batch = si.batch(&mapping).unwrap();
        batch.add(1, &doc).unwrap();
        batch.commit().unwrap();

        let txn = si.read().unwrap();
        let hello = wid(&si, "hello");
        assert!(hello > 0);
        assert!(load_or_empty(&txn, Dbi::WidDocs, word_key(hello, None)).unwrap().contains(1));
        assert!(load_or_empty(&txn, Dbi::WidDocs, word_key(hello, Some(0))).unwrap().contains(1));
        assert!(load_bmap(&txn, Dbi::WidDocs, word_key(hello, Some(1))).unwrap().is_none());
        let en = wid(&si, "en");
        assert!(load_or_empty(&txn, Dbi::WidDocs, word_key(en, Some(1))).unwrap().contains(1));

        let red = hash32("red");
        assert_eq!(Some("red".to_string()), lookup_facet(&txn, red).unwrap());
        assert!(load_or_empty(&txn, Dbi::FacetBmap, facet_key(red, 0)).unwrap().contains(1));
        let four = hash32("4.000000");
        assert!(load_or_empty(&txn, Dbi::FacetBmap, facet_key(four, 1)).unwrap().contains(1));
        assert!(load_or_empty(&txn, Dbi::BoolBmap, bool_key(true, 0)).unwrap().contains(1));
        assert!(txn.contains(Dbi::Numbers, &number_key(0, 4.0, 1)).unwrap());

        let data = doc_data(&txn, 1).unwrap().unwrap();
        assert_eq!(Some(4.0), data.number(0));
        assert_eq!(vec![vec![red], vec![four]], data.facets);

        let buf = doc_words(&txn, 1).unwrap().unwrap();
        let blob = WordBlob::parse(&buf).unwrap();
        assert_eq!(4, blob.len());
        let world = blob.find(wid(&si, "world")).unwrap();
        assert_eq!((0, 2), blob.first(&world).unwrap());
        assert!(load_or_empty(&txn, Dbi::Docs, DOCS_KEY).unwrap().contains(1));
    }

    #[test]
    fn aborted_batch_leaves_prefix_postings_recoverable() {
        let dir = TempDir::new().unwrap();
        let doc = json!({"title": "hello"});
        let (si, mapping) = setup(&dir, &[doc.clone()], &["title"], &[]);
        let mut batch = si.batch(&mapping).unwrap();
        batch.add(1, &doc).unwrap();
        batch.abort().unwrap();

        let hello = wid(&si, "hello");
        assert!(hello > 0);
        let mut batch = si.batch(&mapping).unwrap();
        batch.add(1, &doc).unwrap();
        batch.commit().unwrap();

        let chars: Vec<char> = "hello".chars().collect();
        let twids = si.trie().exact_lookup(&chars).unwrap().twids;
        assert_eq!(3, twids.len());
        let txn = si.read().unwrap();
        for twid in twids {
            assert!(load_or_empty(&txn, Dbi::TwidWids, word_key(twid, None)).unwrap().contains(hello));
            assert!(load_or_empty(&txn, Dbi::TwidWids, word_key(twid, Some(0))).unwrap().contains(hello));
            assert!(load_or_empty(&txn, Dbi::TwidDocs, word_key(twid, None)).unwrap().contains(1));
        }
    }

    #[test]
    fn deindex_mirrors_index() {
        let dir = TempDir::new().unwrap();
        let a = json!({"title": "red fox", "tags": ["x", "y"], "n": [1, 2]});
        let b = json!({"title": "red dog", "tags": ["y"], "n": [2]});
        let (si, mapping) = setup(&dir, &[a.clone(), b.clone()], &["title", "n"], &["tags"]);
        let mut batch = si.batch(&mapping).unwrap();
        batch.add(1, &a).unwrap();
        batch.add(2, &b).unwrap();
        batch.commit().unwrap();

        let mut batch = si.batch(&mapping).unwrap();
        batch.remove(1, &a).unwrap();
        batch.commit().unwrap();

        let txn = si.read().unwrap();
        let fox = wid(&si, "fox");
        assert!(fox > 0);
        assert!(load_bmap(&txn, Dbi::WidDocs, word_key(fox, None)).unwrap().is_none());
        let red = load_or_empty(&txn, Dbi::WidDocs, word_key(wid(&si, "red"), None)).unwrap();
        assert_eq!(vec![2], red.iter().collect::<Vec<_>>());
        assert!(load_bmap(&txn, Dbi::FacetBmap, facet_key(hash32("x"), 0)).unwrap().is_none());
        assert!(doc_words(&txn, 1).unwrap().is_none());
        assert!(doc_data(&txn, 1).unwrap().is_none());
        let mut numbers = Vec::new();
        txn.scan(Dbi::Numbers, Bound::Unbounded, Bound::Unbounded, |k, _| {
            numbers.push(k.to_vec());
            Ok(true)
        })
        .unwrap();
        assert_eq!(vec![number_key(0, 2.0, 2).to_vec()], numbers);
        assert_eq!(vec![2], load_or_empty(&txn, Dbi::Docs, DOCS_KEY).unwrap().iter().collect::<Vec<_>>());
    }

    #[test]
    fn new_words_feed_prefix_postings() {
        let dir = TempDir::new().unwrap();
        let doc = json!({"title": "hello help"});
        let (si, mapping) = setup(&dir, &[doc.clone()], &["title"], &[]);
        let mut batch = si.batch(&mapping).unwrap();
        batch.add(5, &doc).unwrap();
        batch.commit().unwrap();

        let chars: Vec<char> = "hel".chars().collect();
        let ids = si.trie().exact_lookup(&chars).unwrap();
        let twid = ids.twids[2];
        let txn = si.read().unwrap();
        let wids = load_or_empty(&txn, Dbi::TwidWids, word_key(twid, None)).unwrap();
        assert_eq!(2, wids.cardinality());
        assert!(load_or_empty(&txn, Dbi::TwidDocs, word_key(twid, Some(0))).unwrap().contains(5));
    }

    #[test]
    fn clear_keeps_dictionary() {
        let dir = TempDir::new().unwrap();
        let doc = json!({"title": "alpha"});
        let (si, mapping) = setup(&dir, &[doc.clone()], &["title"], &[]);
        let mut batch = si.batch(&mapping).unwrap();
        batch.add(1, &doc).unwrap();
        batch.commit().unwrap();
        si.clear().unwrap();
        let txn = si.read().unwrap();
        let alpha = wid(&si, "alpha");
        assert!(alpha > 0);
        assert!(load_bmap(&txn, Dbi::WidDocs, word_key(alpha, None)).unwrap().is_none());
        assert!(load_bmap(&txn, Dbi::Docs, DOCS_KEY).unwrap().is_none());
    }

    #[test]
    fn batch_requires_ready_mapping() {
        let dir = TempDir::new().unwrap();
        let si = ShardIndex::open(dir.path(), Box::new(DefaultAnalyzer), false).unwrap();
        assert!(si.batch(&Mapping::new()).is_err());
    }
}
