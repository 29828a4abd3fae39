use docopt::Docopt;
use marlin::Error;

use super::open_manager;

static USAGE: &'static str = concat!(
    "
Removes an index and all of its data.

Usage:
    marlin drop <name> [options]
    marlin drop --help

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
    open_manager(&args.flag_path)?.drop_index(&args.arg_name)
}
