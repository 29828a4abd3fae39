//! Shard document store: compressed JSON by docid and the external id map.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::ops::Bound;
use std::path::Path;

use crate::error::Error;
use crate::kv::{Dbi, KvRead, ReadTxn, Store, WriteTxn, DATA_DBIS};
use crate::DocId;

pub const ID_FIELD: &str = "_id";
const GENERATED_ID_LEN: usize = 22;
const LAST_DOCID: &[u8] = b"lastdocid";
const FIRST_DOCID: DocId = 1;

pub fn generate_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_ID_LEN)
        .map(char::from)
        .collect()
}

pub fn compress_doc(doc: &Value) -> Result<Vec<u8>, Error> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut enc, doc)?;
    enc.flush()?;
    Ok(enc.finish()?)
}

pub fn decompress_doc(buf: &[u8]) -> Result<Value, Error> {
    let mut json = Vec::with_capacity(buf.len() * 3);
    ZlibDecoder::new(buf)
        .read_to_end(&mut json)
        .map_err(|e| Error::corrupt(format!("bad stored document: {}", e)))?;
    Ok(serde_json::from_slice(&json)?)
}

/// The external id of a document, if it carries a usable one.
pub fn external_id(doc: &Map<String, Value>) -> Option<&str> {
    match doc.get(ID_FIELD) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

pub struct ShardData {
    store: Store,
}

impl ShardData {
    pub fn open(path: &Path, durable: bool) -> Result<ShardData, Error> {
        Ok(ShardData {
            store: Store::open(path, DATA_DBIS, durable)?,
        })
    }

    pub fn read(&self) -> Result<ReadTxn, Error> {
        self.store.read()
    }

    pub fn write(&self) -> Result<WriteTxn, Error> {
        self.store.write()
    }

    /// Hands out the next docid. Ids are never reused.
    pub fn next_docid(&self, txn: &WriteTxn) -> Result<DocId, Error> {
        let next = match txn.get(Dbi::DocMeta, LAST_DOCID)? {
            Some(buf) if buf.len() == 4 => u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            Some(_) => return Err(Error::corrupt("bad docid counter")),
            None => FIRST_DOCID,
        };
        if next == u32::max_value() {
            return Err(Error::invalid("Shard document id space exhausted"));
        }
        txn.put(Dbi::DocMeta, LAST_DOCID, &(next + 1).to_be_bytes())?;
        Ok(next)
    }

    /// Stores `doc` under a fresh docid. The document must carry `_id`.
    pub fn put(&self, txn: &WriteTxn, doc: &Value) -> Result<DocId, Error> {
        let ext = match doc {
            Value::Object(map) => external_id(map),
            _ => None,
        }
        .ok_or_else(|| Error::invalid("Document without id"))?;
        let docid = self.next_docid(txn)?;
        txn.put(Dbi::DocJson, &docid.to_be_bytes(), &compress_doc(doc)?)?;
        txn.put(Dbi::ExtId, ext.as_bytes(), &docid.to_be_bytes())?;
        Ok(docid)
    }

    pub fn docid<T: KvRead>(&self, txn: &T, ext: &str) -> Result<Option<DocId>, Error> {
        match txn.get(Dbi::ExtId, ext.as_bytes())? {
            Some(buf) if buf.len() == 4 => Ok(Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))),
            Some(_) => Err(Error::corrupt(format!("bad docid for {}", ext))),
            None => Ok(None),
        }
    }

    pub fn get<T: KvRead>(&self, txn: &T, docid: DocId) -> Result<Option<Value>, Error> {
        match txn.get(Dbi::DocJson, &docid.to_be_bytes())? {
            Some(buf) => Ok(Some(decompress_doc(&buf)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_id<T: KvRead>(&self, txn: &T, ext: &str) -> Result<Option<Value>, Error> {
        match self.docid(txn, ext)? {
            Some(docid) => self.get(txn, docid),
            None => Ok(None),
        }
    }

    /// Removes a document, returning its docid and the stored JSON.
    pub fn remove(&self, txn: &WriteTxn, ext: &str) -> Result<Option<(DocId, Value)>, Error> {
        let docid = match self.docid(txn, ext)? {
            Some(docid) => docid,
            None => return Ok(None),
        };
        let doc = self
            .get(txn, docid)?
            .ok_or_else(|| Error::corrupt(format!("id {} maps to missing doc {}", ext, docid)))?;
        txn.del(Dbi::DocJson, &docid.to_be_bytes())?;
        txn.del(Dbi::ExtId, ext.as_bytes())?;
        Ok(Some((docid, doc)))
    }

    /// Visits every stored document in docid order.
    pub fn for_each<T, F>(&self, txn: &T, mut f: F) -> Result<(), Error>
    where
        T: KvRead,
        F: FnMut(DocId, Value) -> Result<(), Error>,
    {
        txn.scan(Dbi::DocJson, Bound::Unbounded, Bound::Unbounded, |k, v| {
            if k.len() != 4 {
                return Err(Error::corrupt("bad docid key"));
            }
            let docid = u32::from_be_bytes([k[0], k[1], k[2], k[3]]);
            f(docid, decompress_doc(v)?)?;
            Ok(true)
        })
    }

    pub fn count<T: KvRead>(&self, txn: &T) -> Result<u64, Error> {
        let mut n = 0;
        txn.scan(Dbi::ExtId, Bound::Unbounded, Bound::Unbounded, |_, _| {
            n += 1;
            Ok(true)
        })?;
        Ok(n)
    }

    /// Drops every document. The docid counter keeps counting.
    pub fn clear(&self, txn: &WriteTxn) -> Result<(), Error> {
        txn.clear(Dbi::DocJson)?;
        txn.clear(Dbi::ExtId)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> ShardData {
        ShardData::open(&dir.path().join("data"), false).unwrap()
    }

    #[test]
    fn docids_start_at_one_and_are_not_reused() {
        let dir = TempDir::new().unwrap();
        let sd = open(&dir);
        let txn = sd.write().unwrap();
        assert_eq!(1, sd.put(&txn, &json!({"_id": "a"})).unwrap());
        assert_eq!(2, sd.put(&txn, &json!({"_id": "b"})).unwrap());
        assert_eq!(Some((2, json!({"_id": "b"}))), sd.remove(&txn, "b").unwrap());
        assert_eq!(3, sd.put(&txn, &json!({"_id": "c"})).unwrap());
        txn.commit().unwrap();

        let read = sd.read().unwrap();
        assert_eq!(Some(json!({"_id": "a"})), sd.get_by_id(&read, "a").unwrap());
        assert_eq!(None, sd.get_by_id(&read, "b").unwrap());
        assert_eq!(2, sd.count(&read).unwrap());
    }

    #[test]
    fn clear_keeps_counter() {
        let dir = TempDir::new().unwrap();
        let sd = open(&dir);
        let txn = sd.write().unwrap();
        sd.put(&txn, &json!({"_id": "a", "x": [1, 2]})).unwrap();
        sd.clear(&txn).unwrap();
        assert_eq!(2, sd.put(&txn, &json!({"_id": "a"})).unwrap());
        txn.commit().unwrap();
        let mut seen = Vec::new();
        sd.for_each(&sd.read().unwrap(), |docid, _| {
            seen.push(docid);
            Ok(())
        })
        .unwrap();
        assert_eq!(vec![2], seen);
    }

    #[test]
    fn generated_ids() {
        let id = generate_id();
        assert_eq!(GENERATED_ID_LEN, id.len());
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(put_without_id_fails());
    }

    fn put_without_id_fails() -> bool {
        let dir = TempDir::new().unwrap();
        let sd = open(&dir);
        let txn = sd.write().unwrap();
        sd.put(&txn, &json!({"x": 1})).is_err()
    }

    #[test]
    fn corrupt_document_is_an_error() {
        assert!(decompress_doc(b"not zlib").is_err());
    }
}
