//! Thin layer over redb: named tables of byte keys to byte values, read and
//! write transactions, and an ordered scan.

use redb::{Database, Durability, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::path::Path;

use crate::error::Error;

type Def = TableDefinition<'static, &'static [u8], &'static [u8]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dbi {
    /// docid -> compressed json
    DocJson,
    /// external id -> docid
    ExtId,
    /// shard data counters
    DocMeta,
    FacetStr,
    FacetBmap,
    BoolBmap,
    TwidWids,
    TwidDocs,
    WidDocs,
    /// docid -> numbers and facet ids
    DocData,
    /// docid -> word positions
    DocWords,
    /// field priority ++ value ++ docid -> ()
    Numbers,
    TrieFree,
    /// every indexed docid
    Docs,
}

pub const DATA_DBIS: &[Dbi] = &[Dbi::DocJson, Dbi::ExtId, Dbi::DocMeta];

pub const INDEX_DBIS: &[Dbi] = &[
    Dbi::FacetStr,
    Dbi::FacetBmap,
    Dbi::BoolBmap,
    Dbi::TwidWids,
    Dbi::TwidDocs,
    Dbi::WidDocs,
    Dbi::DocData,
    Dbi::DocWords,
    Dbi::Numbers,
    Dbi::TrieFree,
    Dbi::Docs,
];

impl Dbi {
    pub fn name(self) -> &'static str {
        match self {
            Dbi::DocJson => "docid2json",
            Dbi::ExtId => "id2docid",
            Dbi::DocMeta => "usedfree",
            Dbi::FacetStr => "facetid2str",
            Dbi::FacetBmap => "facetid2bmap",
            Dbi::BoolBmap => "boolid2bmap",
            Dbi::TwidWids => "twid2widbmap",
            Dbi::TwidDocs => "twid2bmap",
            Dbi::WidDocs => "wid2bmap",
            Dbi::DocData => "docid2data",
            Dbi::DocWords => "docid2words",
            Dbi::Numbers => "numbers",
            Dbi::TrieFree => "triefree",
            Dbi::Docs => "docids",
        }
    }

    fn def(self) -> Def {
        TableDefinition::new(self.name())
    }
}

pub trait KvRead {
    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Visits entries in key order within the bounds until `f` returns false.
    fn scan<F>(&self, dbi: Dbi, from: Bound<&[u8]>, to: Bound<&[u8]>, f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, Error>;

    /// Like `scan` but from the last key down.
    fn scan_rev<F>(&self, dbi: Dbi, from: Bound<&[u8]>, to: Bound<&[u8]>, f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, Error>;

    fn contains(&self, dbi: Dbi, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(dbi, key)?.is_some())
    }
}

pub struct Store {
    db: Database,
    durable: bool,
}

impl Store {
    /// Opens or creates the database file and makes sure every table exists.
    pub fn open(path: &Path, dbis: &[Dbi], durable: bool) -> Result<Store, Error> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        for dbi in dbis {
            txn.open_table(dbi.def())?;
        }
        txn.commit()?;
        Ok(Store { db, durable })
    }

    pub fn read(&self) -> Result<ReadTxn, Error> {
        Ok(ReadTxn {
            txn: self.db.begin_read()?,
        })
    }

    pub fn write(&self) -> Result<WriteTxn, Error> {
        let mut txn = self.db.begin_write()?;
        if !self.durable {
            txn.set_durability(Durability::Eventual);
        }
        Ok(WriteTxn { txn })
    }
}

pub struct ReadTxn {
    txn: redb::ReadTransaction,
}

impl KvRead for ReadTxn {
    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let table = self.txn.open_table(dbi.def())?;
        let value = table.get(key)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn scan<F>(&self, dbi: Dbi, from: Bound<&[u8]>, to: Bound<&[u8]>, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, Error>,
    {
        let table = self.txn.open_table(dbi.def())?;
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (from, to);
        for entry in table.range::<&[u8]>(bounds)? {
            let (k, v) = entry?;
            if !f(k.value(), v.value())? {
                break;
            }
        }
        Ok(())
    }

    fn scan_rev<F>(&self, dbi: Dbi, from: Bound<&[u8]>, to: Bound<&[u8]>, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, Error>,
    {
        let table = self.txn.open_table(dbi.def())?;
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (from, to);
        for entry in table.range::<&[u8]>(bounds)?.rev() {
            let (k, v) = entry?;
            if !f(k.value(), v.value())? {
                break;
            }
        }
        Ok(())
    }
}

pub struct WriteTxn {
    txn: redb::WriteTransaction,
}

impl WriteTxn {
    pub fn put(&self, dbi: Dbi, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut table = self.txn.open_table(dbi.def())?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Returns true if the key existed.
    pub fn del(&self, dbi: Dbi, key: &[u8]) -> Result<bool, Error> {
        let mut table = self.txn.open_table(dbi.def())?;
        let old = table.remove(key)?;
        Ok(old.is_some())
    }

    /// Removes every entry of the table.
    pub fn clear(&self, dbi: Dbi) -> Result<(), Error> {
        self.txn.delete_table(dbi.def())?;
        self.txn.open_table(dbi.def())?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), Error> {
        self.txn.commit()?;
        Ok(())
    }

    pub fn abort(self) -> Result<(), Error> {
        self.txn.abort()?;
        Ok(())
    }
}

impl KvRead for WriteTxn {
    fn get(&self, dbi: Dbi, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let table = self.txn.open_table(dbi.def())?;
        let value = table.get(key)?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn scan<F>(&self, dbi: Dbi, from: Bound<&[u8]>, to: Bound<&[u8]>, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, Error>,
    {
        let table = self.txn.open_table(dbi.def())?;
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (from, to);
        for entry in table.range::<&[u8]>(bounds)? {
            let (k, v) = entry?;
            if !f(k.value(), v.value())? {
                break;
            }
        }
        Ok(())
    }

    fn scan_rev<F>(&self, dbi: Dbi, from: Bound<&[u8]>, to: Bound<&[u8]>, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, Error>,
    {
        let table = self.txn.open_table(dbi.def())?;
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (from, to);
        for entry in table.range::<&[u8]>(bounds)?.rev() {
            let (k, v) = entry?;
            if !f(k.value(), v.value())? {
                break;
            }
        }
        Ok(())
    }
}
