use docopt::Docopt;
use marlin::Error;

use super::{open_manager, print_json};

static USAGE: &'static str = concat!(
    "
Prints the field mapping discovered from the indexed documents.

Usage:
    marlin mapping <name> [options]
    marlin mapping --help

Options:
    -p, --path <path>    Data directory [default: .]
    -h, --help           Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    flag_path: String,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let manager = open_manager(&args.flag_path)?;
    print_json(&manager.get(&args.arg_name)?.mapping_json(), true)
}
