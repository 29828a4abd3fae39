use docopt::Docopt;
use marlin::Error;

use super::{open_manager, print_json};

static USAGE: &'static str = concat!(
    "
Prints a stored document.

Usage:
    marlin get <name> <id> [options]
    marlin get --help

Options:
    -p, --path <path>    Data directory [default: .]
    -h, --help           Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    arg_id: String,
    flag_path: String,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let manager = open_manager(&args.flag_path)?;
    match manager.get(&args.arg_name)?.get_document(&args.arg_id)? {
        Some(doc) => print_json(&doc, false),
        None => Err(Error::NotFound(format!("document {}", args.arg_id))),
    }
}
