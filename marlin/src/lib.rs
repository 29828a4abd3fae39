extern crate byteorder;
extern crate memmap;
extern crate rand;
extern crate unicode_normalization;
extern crate unicode_segmentation;
extern crate walkdir;

extern crate parking_lot;
extern crate rayon;
extern crate threadpool;

extern crate redb;
extern crate rmp_serde as rmps;
extern crate serde;
extern crate serde_json;

#[macro_use]
extern crate serde_derive;

extern crate flate2;
extern crate thiserror;
extern crate tracing;
extern crate xxhash_rust;

#[cfg(test)]
extern crate proptest;

pub mod aggs;
pub mod analyzer;
pub mod blob;
pub mod bmap;
pub mod config;
pub mod cont;
pub mod docrank;
pub mod dtrie;
pub mod error;
pub mod filter;
pub mod filter_apply;
pub mod index;
pub mod index_manager;
pub mod kv;
pub mod mapping;
pub mod mbmap;
pub mod query;
pub mod sdata;
pub mod shard;
pub mod sindex;
pub mod sort;
pub mod squery;
mod util;
pub use error::Error;

/// Shard local document id.
pub type DocId = u32;
pub use config::Settings;
pub use index::Index;
pub use index_manager::IndexManager;
pub use query::{QueryRequest, QueryResponse};
