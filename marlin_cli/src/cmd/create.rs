use docopt::Docopt;
use marlin::{Error, Settings};

use super::{open_manager, parse_json, print_json};

static USAGE: &'static str = concat!(
    "
Creates an index. Settings not given keep their defaults.

Usage:
    marlin create <name> [options]
    marlin create --help

Options:
    -p, --path <path>           Data directory [default: .]
    -n, --shards <shards>       Number of shards
    -i, --indexed <fields>      Comma separated indexed fields, best first
    -f, --facets <fields>       Comma separated facet fields
    -s, --settings <settings>   Settings as a JSON object, applied first
    -h, --help                  Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    flag_path: String,
    flag_shards: Option<usize>,
    flag_indexed: Option<String>,
    flag_facets: Option<String>,
    flag_settings: Option<String>,
}

fn fields(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let mut settings = Settings::default();
    if let Some(ref json) = args.flag_settings {
        let update = parse_json(json, "settings")?;
        if let Some(n) = update.get("numShards").and_then(|v| v.as_u64()) {
            settings.num_shards = n as usize;
        }
        settings = settings.merged(&update)?;
    }
    if let Some(n) = args.flag_shards {
        settings.num_shards = n;
    }
    if let Some(ref list) = args.flag_indexed {
        settings.indexed_fields = fields(list);
    }
    if let Some(ref list) = args.flag_facets {
        settings.facet_fields = fields(list);
    }
    let manager = open_manager(&args.flag_path)?;
    let index = manager.create(&args.arg_name, settings)?;
    print_json(&index.settings(), true)
}
