use docopt::Docopt;
use marlin::Error;

use super::open_manager;

static USAGE: &'static str = concat!(
    "
Deletes documents by id.

Usage:
    marlin delete <name> <id>... [options]
    marlin delete --help

Options:
    -p, --path <path>    Data directory [default: .]
    -h, --help           Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    arg_id: Vec<String>,
    flag_path: String,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let manager = open_manager(&args.flag_path)?;
    let index = manager.get(&args.arg_name)?;
    index.delete_documents(args.arg_id)?;
    index.wait_for_writes();
    Ok(())
}
