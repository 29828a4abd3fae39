use docopt::Docopt;
use marlin::{Error, Index};
use serde_json::Value;
use std::io::{self, BufReader};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use super::open_manager;

static USAGE: &'static str = concat!(
    "
Index JSON documents from standard input. Documents with an existing id
replace the stored one.

Usage:
    marlin index <name> [options]
    marlin index --help

Options:
    -p, --path <path>     Data directory [default: .]
    -b, --batch <batch>   Documents per write job [default: 1000]
    -h, --help            Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    flag_path: String,
    flag_batch: usize,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    if args.flag_batch == 0 {
        return Err(Error::invalid("batch must be positive"));
    }
    let manager = open_manager(&args.flag_path)?;
    let index = manager.get(&args.arg_name)?;

    let (sender, receiver) = mpsc::sync_channel(100_000);
    thread::spawn(move || {
        let stream = serde_json::Deserializer::from_reader(BufReader::new(io::stdin())).into_iter::<Value>();
        for doc in stream {
            if sender.send(doc).is_err() {
                break;
            }
        }
    });

    let started = Instant::now();
    let mut batch = Vec::with_capacity(args.flag_batch);
    let mut total = 0usize;
    for doc in receiver {
        batch.push(doc?);
        if batch.len() >= args.flag_batch {
            total += submit(&index, &mut batch)?;
            tracing::debug!(index = %args.arg_name, docs = total, "queued documents");
        }
    }
    total += submit(&index, &mut batch)?;
    index.wait_for_writes();
    tracing::info!(
        index = %args.arg_name,
        docs = total,
        took_ms = started.elapsed().as_millis() as u64,
        "indexing done"
    );
    Ok(())
}

/// Queues the batch, waiting for the writer whenever its queue is full.
fn submit(index: &Index, batch: &mut Vec<Value>) -> Result<usize, Error> {
    if batch.is_empty() {
        return Ok(0);
    }
    let docs: Vec<Value> = batch.drain(..).collect();
    let n = docs.len();
    loop {
        match index.add_documents(docs.clone()) {
            Err(Error::TooManyRequests) => index.wait_for_writes(),
            other => {
                other?;
                return Ok(n);
            }
        }
    }
}
