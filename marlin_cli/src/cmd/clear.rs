use docopt::Docopt;
use marlin::Error;

use super::open_manager;

static USAGE: &'static str = concat!(
    "
Deletes every document of an index. Settings and mapping are kept.

Usage:
    marlin clear <name> [options]
    marlin clear --help

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
    let index = manager.get(&args.arg_name)?;
    index.clear()?;
    index.wait_for_writes();
    Ok(())
}
