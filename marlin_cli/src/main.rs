extern crate docopt;
extern crate marlin;
extern crate serde;
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
extern crate tracing;
extern crate tracing_subscriber;

mod cmd;

use docopt::Docopt;
use marlin::Error;
use tracing_subscriber::EnvFilter;

static USAGE: &'static str = concat!(
    "
Command line interface for marlin indexes.

Usage:
    marlin [options] <command> [<args>...]
    marlin --help

Commands:
    create      Create an index
    index       Index JSON documents from standard input
    search      Search an index
    get         Print one document
    delete      Delete documents by id
    clear       Delete every document of an index
    settings    Print or update the settings of an index
    mapping     Print the discovered mapping of an index
    list        List the indexes under a data directory
    drop        Remove an index and its data

Options:
    -v, --verbose...    More logging, repeat for even more
    -h, --help          Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_command: String,
    arg_args: Vec<String>,
    flag_verbose: usize,
}

fn init_tracing(verbose: usize) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.options_first(true).deserialize())
        .unwrap_or_else(|e| e.exit());
    init_tracing(args.flag_verbose);

    let mut argv: Vec<&str> = vec!["marlin", args.arg_command.as_str()];
    argv.extend(args.arg_args.iter().map(|s| s.as_str()));
    let result: Result<(), Error> = match args.arg_command.as_str() {
        "create" => cmd::create::run(&argv),
        "index" => cmd::index::run(&argv),
        "search" => cmd::search::run(&argv),
        "get" => cmd::get::run(&argv),
        "delete" => cmd::delete::run(&argv),
        "clear" => cmd::clear::run(&argv),
        "settings" => cmd::settings::run(&argv),
        "mapping" => cmd::mapping::run(&argv),
        "list" => cmd::list::run(&argv),
        "drop" => cmd::drop::run(&argv),
        other => {
            eprintln!("Unknown command {}\n{}", other, USAGE);
            std::process::exit(2);
        }
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("marlin: {}", e);
        std::process::exit(1);
    }
}
