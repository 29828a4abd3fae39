use docopt::Docopt;
use marlin::Error;

use super::{open_manager, parse_json, print_json};

static USAGE: &'static str = concat!(
    "
Prints the settings of an index, or applies a JSON object of changes
and prints the result. Changing indexed or facet fields rebuilds the
index.

Usage:
    marlin settings <name> [<update>] [options]
    marlin settings --help

Options:
    -p, --path <path>    Data directory [default: .]
    -h, --help           Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    arg_update: Option<String>,
    flag_path: String,
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let manager = open_manager(&args.flag_path)?;
    let index = manager.get(&args.arg_name)?;
    let settings = match args.arg_update {
        Some(ref json) => {
            let next = index.update_settings(&parse_json(json, "settings")?)?;
            index.wait_for_writes();
            next
        }
        None => index.settings(),
    };
    print_json(&settings, true)
}
