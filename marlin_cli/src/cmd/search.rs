use docopt::Docopt;
use marlin::{Error, QueryRequest};
use serde_json::{Map, Value};

use super::{open_manager, parse_json, print_json};

static USAGE: &'static str = concat!(
    "
Searches an index and prints the response as JSON.

Usage:
    marlin search <name> [<query>] [options]
    marlin search --help

Options:
    -p, --path <path>         Data directory [default: .]
    -f, --filter <filter>     Filter as a JSON object
    -r, --request <request>   Full request as a JSON object, the other
                              options are applied on top
    --page <page>             Page to show, starting at 1
    --hits <hits>             Hits per page
    --facets <facets>         Comma separated facet fields
    --explain                 Include rank details in every hit
    --full-scan               Rank every candidate
    -h, --help                Show this message
"
);

#[derive(Deserialize)]
struct Args {
    arg_name: String,
    arg_query: Option<String>,
    flag_path: String,
    flag_filter: Option<String>,
    flag_request: Option<String>,
    flag_page: Option<usize>,
    flag_hits: Option<usize>,
    flag_facets: Option<String>,
    flag_explain: bool,
    flag_full_scan: bool,
}

fn request(args: &Args) -> Result<QueryRequest, Error> {
    let mut req = match args.flag_request {
        Some(ref json) => match parse_json(json, "request")? {
            Value::Object(map) => map,
            _ => return Err(Error::invalid("Request must be a JSON object")),
        },
        None => Map::new(),
    };
    if let Some(ref q) = args.arg_query {
        req.insert("q".into(), Value::String(q.clone()));
    }
    if let Some(ref filter) = args.flag_filter {
        req.insert("filter".into(), parse_json(filter, "filter")?);
    }
    if let Some(page) = args.flag_page {
        req.insert("page".into(), page.into());
    }
    if let Some(hits) = args.flag_hits {
        req.insert("hitsPerPage".into(), hits.into());
    }
    if let Some(ref facets) = args.flag_facets {
        let names: Vec<Value> = facets
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect();
        req.insert("facets".into(), Value::Array(names));
    }
    if args.flag_explain {
        req.insert("explain".into(), true.into());
    }
    if args.flag_full_scan {
        req.insert("fullScan".into(), true.into());
    }
    QueryRequest::from_json(&Value::Object(req))
}

pub fn run(argv: &[&str]) -> Result<(), Error> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.argv(argv.iter().map(|&x| x)).deserialize())
        .unwrap_or_else(|e| e.exit());
    let req = request(&args)?;
    let manager = open_manager(&args.flag_path)?;
    let res = manager.get(&args.arg_name)?.search(&req)?;
    print_json(&res, true)
}
