//! A shard pairs a document store with its index. Each lives in its own
//! KV environment under `s_<id>/`.

use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::analyzer::Analyzer;
use crate::error::Error;
use crate::mapping::Mapping;
use crate::sdata::{ShardData, ID_FIELD};
use crate::sindex::ShardIndex;
use crate::squery::{ShardHits, ShardQuery};
use crate::util::hash32;
use crate::DocId;

const DATA_FILE: &str = "data";
const INDEX_DIR: &str = "index";
const REPAIR_BATCH: usize = 1000;

/// Shard holding the document with external id `ext`.
pub fn shard_for(ext: &str, num_shards: usize) -> usize {
    hash32(ext) as usize % num_shards
}

pub fn shard_dir(index_dir: &Path, id: usize) -> PathBuf {
    index_dir.join(format!("s_{}", id))
}

/// Commits the index before the documents, so a failed index commit leaves
/// both stores as they were. If the documents then fail to commit, the index
/// is rebuilt from what is stored.
fn commit_in_order<I, D, R>(index: I, data: D, repair: R) -> Result<(), Error>
where
    I: FnOnce() -> Result<(), Error>,
    D: FnOnce() -> Result<(), Error>,
    R: FnOnce() -> Result<(), Error>,
{
    index()?;
    if let Err(e) = data() {
        tracing::error!(error = %e, "document commit failed after index commit, rebuilding index");
        repair()?;
        return Err(e);
    }
    Ok(())
}

pub struct Shard {
    id: usize,
    data: ShardData,
    index: ShardIndex,
}

impl Shard {
    pub fn open(index_dir: &Path, id: usize, analyzer: Box<dyn Analyzer>, durable: bool) -> Result<Shard, Error> {
        let path = shard_dir(index_dir, id);
        std::fs::create_dir_all(&path)?;
        let data = ShardData::open(&path.join(DATA_FILE), durable)?;
        let index = ShardIndex::open(&path.join(INDEX_DIR), analyzer, durable)?;
        tracing::info!(shard = id, path = ?path, "opened shard");
        Ok(Shard { id, data, index })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Stores documents, replacing any with the same external id, and
    /// indexes them once the mapping is ready.
    pub fn put(&self, docs: &[Value], mapping: &Mapping) -> Result<(), Error> {
        let txn = self.data.write()?;
        let mut batch = if mapping.ready_to_index() {
            Some(self.index.batch(mapping)?)
        } else {
            None
        };
        for doc in docs {
            let ext = doc
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .ok_or_else(|| Error::invalid("Document without id"))?;
            if let Some((old_docid, old)) = self.data.remove(&txn, ext)? {
                if let Some(ref mut b) = batch {
                    b.remove(old_docid, &old)?;
                }
            }
            let docid = self.data.put(&txn, doc)?;
            if let Some(ref mut b) = batch {
                b.add(docid, doc)?;
            }
        }
        commit_in_order(
            || batch.map_or(Ok(()), |b| b.commit()),
            || txn.commit(),
            || self.reindex(mapping, REPAIR_BATCH),
        )
    }

    /// Returns how many of the ids existed.
    pub fn delete(&self, ids: &[String], mapping: &Mapping) -> Result<usize, Error> {
        let txn = self.data.write()?;
        let mut batch = if mapping.ready_to_index() {
            Some(self.index.batch(mapping)?)
        } else {
            None
        };
        let mut deleted = 0;
        for ext in ids {
            if let Some((docid, doc)) = self.data.remove(&txn, ext)? {
                if let Some(ref mut b) = batch {
                    b.remove(docid, &doc)?;
                }
                deleted += 1;
            }
        }
        commit_in_order(
            || batch.map_or(Ok(()), |b| b.commit()),
            || txn.commit(),
            || self.reindex(mapping, REPAIR_BATCH),
        )?;
        Ok(deleted)
    }

    pub fn clear(&self) -> Result<(), Error> {
        let txn = self.data.write()?;
        self.data.clear(&txn)?;
        txn.commit()?;
        self.index.clear()
    }

    /// Rebuilds the index from the stored documents, `batch_size` documents
    /// per write transaction.
    pub fn reindex(&self, mapping: &Mapping, batch_size: usize) -> Result<(), Error> {
        self.index.clear()?;
        if !mapping.ready_to_index() {
            return Ok(());
        }
        let index = &self.index;
        let flush = |docs: &mut Vec<(DocId, Value)>| -> Result<(), Error> {
            let mut batch = index.batch(mapping)?;
            for (docid, doc) in docs.drain(..) {
                batch.add(docid, &doc)?;
            }
            batch.commit()
        };
        let mut pending = Vec::with_capacity(batch_size);
        let mut total = 0usize;
        let txn = self.data.read()?;
        self.data.for_each(&txn, |docid, doc| {
            pending.push((docid, doc));
            total += 1;
            if pending.len() >= batch_size {
                flush(&mut pending)?;
            }
            Ok(())
        })?;
        if !pending.is_empty() {
            flush(&mut pending)?;
        }
        tracing::info!(shard = self.id, docs = total, "reindexed shard");
        Ok(())
    }

    pub fn search(&self, query: &ShardQuery) -> Result<ShardHits, Error> {
        query.run(&self.index, self.id as u16)
    }

    pub fn fetch(&self, docid: DocId) -> Result<Option<Value>, Error> {
        self.data.get(&self.data.read()?, docid)
    }

    pub fn get(&self, ext: &str) -> Result<Option<Value>, Error> {
        self.data.get_by_id(&self.data.read()?, ext)
    }

    pub fn count(&self) -> Result<u64, Error> {
        self.data.count(&self.data.read()?)
    }
}
