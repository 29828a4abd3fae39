//! Bitmaps persisted in the KV store. A bitmap lives under a u64 key: the
//! header (container count and ids) at the key itself and every container
//! at `key + container id + 1`. Containers are only read when touched.

use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use std::collections::{BTreeMap, BTreeSet};

use crate::bmap::Bitmap;
use crate::cont::Container;
use crate::error::Error;
use crate::kv::{Dbi, KvRead, WriteTxn};

/// Key of the bitmap for `id` under a given priority. Priorities are spaced
/// far enough apart to hold every container sub-key.
#[inline]
pub fn bmap_key(id: u32, priority: u8) -> u64 {
    (u64::from(id) << 32) | (u64::from(priority) << 24)
}

#[inline]
pub fn encode_key(key: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, key);
    buf
}

fn read_header(buf: &[u8]) -> Result<Vec<u16>, Error> {
    if buf.len() < 2 {
        return Err(Error::corrupt("truncated bitmap header"));
    }
    let count = LittleEndian::read_u16(&buf[0..2]) as usize;
    if buf.len() < 2 + count * 2 {
        return Err(Error::corrupt("truncated bitmap header"));
    }
    let mut ids = vec![0u16; count];
    LittleEndian::read_u16_into(&buf[2..2 + count * 2], &mut ids);
    Ok(ids)
}

fn write_header(ids: &BTreeSet<u16>) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(2 + ids.len() * 2);
    out.write_u16::<LittleEndian>(ids.len() as u16)?;
    for &id in ids {
        out.write_u16::<LittleEndian>(id)?;
    }
    Ok(out)
}

fn load_container<T: KvRead>(txn: &T, dbi: Dbi, key: u64, cid: u16) -> Result<Container, Error> {
    let sub = encode_key(key + u64::from(cid) + 1);
    match txn.get(dbi, &sub)? {
        Some(buf) => {
            let (c, _) = Container::load(&buf)?;
            if c.id() != cid {
                return Err(Error::corrupt(format!("container {} stored under {}", c.id(), cid)));
            }
            Ok(c)
        }
        None => Err(Error::corrupt(format!("missing container {} of bitmap {:x}", cid, key))),
    }
}

/// Reads a whole bitmap, `None` if nothing is stored under `key`.
pub fn load_bmap<T: KvRead>(txn: &T, dbi: Dbi, key: u64) -> Result<Option<Bitmap>, Error> {
    let header = match txn.get(dbi, &encode_key(key))? {
        Some(buf) => read_header(&buf)?,
        None => return Ok(None),
    };
    let mut conts = Vec::with_capacity(header.len());
    for cid in header {
        conts.push(load_container(txn, dbi, key, cid)?);
    }
    Ok(Some(Bitmap::from_containers(conts)))
}

/// Reads a bitmap, treating absence as the empty set.
pub fn load_or_empty<T: KvRead>(txn: &T, dbi: Dbi, key: u64) -> Result<Bitmap, Error> {
    Ok(load_bmap(txn, dbi, key)?.unwrap_or_default())
}

/// A KV-backed bitmap under mutation.
pub struct ManagedBitmap {
    key: u64,
    ids: BTreeSet<u16>,
    loaded: BTreeMap<u16, Container>,
    dirty: BTreeSet<u16>,
    dropped: BTreeSet<u16>,
    header_dirty: bool,
}

impl ManagedBitmap {
    pub fn open<T: KvRead>(txn: &T, dbi: Dbi, key: u64) -> Result<ManagedBitmap, Error> {
        let ids = match txn.get(dbi, &encode_key(key))? {
            Some(buf) => read_header(&buf)?.into_iter().collect(),
            None => BTreeSet::new(),
        };
        Ok(ManagedBitmap {
            key,
            ids,
            loaded: BTreeMap::new(),
            dirty: BTreeSet::new(),
            dropped: BTreeSet::new(),
            header_dirty: false,
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn container<T: KvRead>(&mut self, txn: &T, dbi: Dbi, cid: u16, create: bool) -> Result<Option<&mut Container>, Error> {
        if !self.loaded.contains_key(&cid) {
            if self.ids.contains(&cid) {
                let c = load_container(txn, dbi, self.key, cid)?;
                self.loaded.insert(cid, c);
            } else if create {
                self.ids.insert(cid);
                self.dropped.remove(&cid);
                self.header_dirty = true;
                self.loaded.insert(cid, Container::new(cid));
            } else {
                return Ok(None);
            }
        }
        Ok(self.loaded.get_mut(&cid))
    }

    pub fn add<T: KvRead>(&mut self, txn: &T, dbi: Dbi, item: u32) -> Result<bool, Error> {
        let cid = (item >> 16) as u16;
        let added = match self.container(txn, dbi, cid, true)? {
            Some(c) => c.add((item & 0xFFFF) as u16),
            None => false,
        };
        if added {
            self.dirty.insert(cid);
        }
        Ok(added)
    }

    pub fn remove<T: KvRead>(&mut self, txn: &T, dbi: Dbi, item: u32) -> Result<bool, Error> {
        let cid = (item >> 16) as u16;
        let low = (item & 0xFFFF) as u16;
        let (removed, empty) = match self.container(txn, dbi, cid, false)? {
            Some(c) => {
                let had = c.contains(low);
                (had, c.remove(low))
            }
            None => return Ok(false),
        };
        if empty {
            self.loaded.remove(&cid);
            self.ids.remove(&cid);
            self.dirty.remove(&cid);
            self.dropped.insert(cid);
            self.header_dirty = true;
        } else if removed {
            self.dirty.insert(cid);
        }
        Ok(removed)
    }

    /// Writes back what changed. Returns false when the bitmap ended up empty
    /// and its header was deleted.
    pub fn save(&mut self, txn: &WriteTxn, dbi: Dbi) -> Result<bool, Error> {
        for cid in &self.dropped {
            txn.del(dbi, &encode_key(self.key + u64::from(*cid) + 1))?;
        }
        self.dropped.clear();
        if self.ids.is_empty() {
            txn.del(dbi, &encode_key(self.key))?;
            self.header_dirty = false;
            return Ok(false);
        }
        if self.header_dirty {
            txn.put(dbi, &encode_key(self.key), &write_header(&self.ids)?)?;
            self.header_dirty = false;
        }
        let mut buf = Vec::new();
        for cid in &self.dirty {
            if let Some(c) = self.loaded.get(cid) {
                buf.clear();
                c.dump(&mut buf)?;
                txn.put(dbi, &encode_key(self.key + u64::from(*cid) + 1), &buf)?;
            }
        }
        self.dirty.clear();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::kv::{Store, INDEX_DBIS};
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> Store {
        Store::open(&dir.path().join("kv"), INDEX_DBIS, false).unwrap()
    }

    #[test]
    fn save_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = bmap_key(42, 1);
        let txn = store.write().unwrap();
        let mut mb = ManagedBitmap::open(&txn, Dbi::WidDocs, key).unwrap();
        for v in (0..200_000).step_by(7) {
            mb.add(&txn, Dbi::WidDocs, v).unwrap();
        }
        assert!(mb.save(&txn, Dbi::WidDocs).unwrap());
        txn.commit().unwrap();

        let read = store.read().unwrap();
        let b = load_bmap(&read, Dbi::WidDocs, key).unwrap().unwrap();
        assert_eq!((0..200_000).step_by(7).count() as u64, b.cardinality());
        assert!(b.contains(199_997));
        assert!(load_bmap(&read, Dbi::WidDocs, bmap_key(42, 2)).unwrap().is_none());
    }

    #[test]
    fn touches_only_needed_containers() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = bmap_key(7, 0);
        let txn = store.write().unwrap();
        let mut mb = ManagedBitmap::open(&txn, Dbi::FacetBmap, key).unwrap();
        mb.add(&txn, Dbi::FacetBmap, 1).unwrap();
        mb.add(&txn, Dbi::FacetBmap, 1 << 16).unwrap();
        mb.save(&txn, Dbi::FacetBmap).unwrap();
        txn.commit().unwrap();

        let txn = store.write().unwrap();
        let mut mb = ManagedBitmap::open(&txn, Dbi::FacetBmap, key).unwrap();
        mb.add(&txn, Dbi::FacetBmap, (1 << 16) + 5).unwrap();
        assert_eq!(1, mb.loaded.len());
        mb.save(&txn, Dbi::FacetBmap).unwrap();
        txn.commit().unwrap();

        let read = store.read().unwrap();
        let b = load_or_empty(&read, Dbi::FacetBmap, key).unwrap();
        assert_eq!(vec![1, 1 << 16, (1 << 16) + 5], b.iter().collect::<Vec<_>>());
    }

    #[test]
    fn emptied_bitmap_is_deleted() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let key = bmap_key(9, 3);
        let txn = store.write().unwrap();
        let mut mb = ManagedBitmap::open(&txn, Dbi::BoolBmap, key).unwrap();
        mb.add(&txn, Dbi::BoolBmap, 10).unwrap();
        mb.save(&txn, Dbi::BoolBmap).unwrap();
        txn.commit().unwrap();

        let txn = store.write().unwrap();
        let mut mb = ManagedBitmap::open(&txn, Dbi::BoolBmap, key).unwrap();
        assert!(!mb.remove(&txn, Dbi::BoolBmap, 11).unwrap());
        assert!(mb.remove(&txn, Dbi::BoolBmap, 10).unwrap());
        assert!(!mb.save(&txn, Dbi::BoolBmap).unwrap());
        txn.commit().unwrap();

        let read = store.read().unwrap();
        assert!(!read.contains(Dbi::BoolBmap, &encode_key(key)).unwrap());
        assert!(!read.contains(Dbi::BoolBmap, &encode_key(key + 1)).unwrap());
    }
}
