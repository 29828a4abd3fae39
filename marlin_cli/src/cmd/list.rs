use docopt::Docopt;
use marlin::Error;

use super::open_manager;

static USAGE: &'static str = concat!(
    "
Lists the indexes under a data directory with their document counts.

Usage:
    marlin list [options]
    marlin list --help

Options:
    -p, --path <path>    Data directory [default: .]
    -h, --help           Show this message
"
);

#[derive(Deserialize)]
struct Args {
    flag_path: String,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let manager = open_manager(&args.flag_path)?;
    for name in manager.list() {
        let docs = manager.get(&name)?.num_docs()?;
        println!("{}\t{}", name, docs);
    }
    Ok(())
}
