use marlin::{Error, IndexManager};
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;

pub mod clear;
pub mod create;
pub mod delete;
pub mod drop;
pub mod get;
pub mod index;
pub mod list;
pub mod mapping;
pub mod search;
pub mod settings;

pub fn open_manager(path: &str) -> Result<IndexManager, Error> {
    IndexManager::open(Path::new(path))
}

pub fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<(), Error> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if pretty {
        serde_json::to_writer_pretty(&mut out, value)?;
    } else {
        serde_json::to_writer(&mut out, value)?;
    }
    writeln!(out)?;
    Ok(())
}

pub fn parse_json(arg: &str, what: &str) -> Result<serde_json::Value, Error> {
    serde_json::from_str(arg).map_err(|e| Error::invalid(format!("Invalid {} JSON: {}", what, e)))
}
