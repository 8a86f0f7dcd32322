use clap::{Parser, Subcommand, ValueEnum};
use couchkit::config::parse_config;
use couchkit::{ChangeFeedCursor, ClientConfig, DesignDirectory, FeedMode, Params, Server};
use serde_json::Value;
use std::path::PathBuf;
use std::process;

/// couchkit CLI: query a CouchDB server and build design documents
#[derive(Parser)]
#[command(name = "couchkit", version, about)]
struct Cli {
    /// Server URI (overrides the config file)
    #[arg(long)]
    uri: Option<String>,

    /// Path to a couchkit.yaml config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    /// Log requests and macro processing
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Feed {
    Normal,
    Longpoll,
    Continuous,
}

impl From<Feed> for FeedMode {
    fn from(feed: Feed) -> Self {
        match feed {
            Feed::Normal => FeedMode::Normal,
            Feed::Longpoll => FeedMode::LongPoll,
            Feed::Continuous => FeedMode::Continuous,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Show server information
    Info,

    /// List databases
    Dbs,

    /// Get a single document by ID
    Get {
        /// Database name
        db: String,
        /// Document ID
        id: String,
    },

    /// Query a view
    View {
        /// Database name
        db: String,
        /// View name as design/view, or _all_docs
        name: String,
        /// View parameters (e.g. --param limit=10 --param key='"abc"')
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Read the change feed of a database
    Changes {
        /// Database name
        db: String,
        /// Start after this sequence
        #[arg(long)]
        since: Option<String>,
        /// Feed mode
        #[arg(long, default_value = "normal")]
        feed: Feed,
        /// Maximum number of changes
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Build a design document from a couchapp directory
    Design {
        /// Design directory
        dir: PathBuf,
        /// Push the document to these databases instead of printing it
        #[arg(long)]
        push: Vec<String>,
    },

    /// Rebuild a design directory from a stored design document
    Clone {
        /// Database name
        db: String,
        /// Design document ID (e.g. _design/blog)
        docid: String,
        /// Target directory (defaults to the design name)
        dest: Option<PathBuf>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => parse_config(path)?,
        None => ClientConfig::default(),
    };
    if let Some(uri) = &cli.uri {
        config.uri = uri.clone();
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&cli)?;

    match &cli.command {
        Command::Info => {
            let server = Server::from_config(&config)?;
            print_output(&server.info()?, &cli.format)?;
        }

        Command::Dbs => {
            let server = Server::from_config(&config)?;
            print_output(&Value::from(server.all_dbs()?), &cli.format)?;
        }

        Command::Get { db, id } => {
            let db = Server::from_config(&config)?.database(db)?;
            print_output(&db.open_doc(id)?, &cli.format)?;
        }

        Command::View { db, name, params } => {
            let db = Server::from_config(&config)?.database(db)?;
            let results = db.view(name, params_to_map(params))?;
            let output = serde_json::json!({
                "total_rows": results.total_rows()?,
                "offset": results.offset()?,
                "rows": results.all()?,
            });
            print_output(&output, &cli.format)?;
        }

        Command::Changes {
            db,
            since,
            feed,
            limit,
        } => {
            let db = Server::from_config(&config)?.database(db)?;
            let mode = FeedMode::from(*feed);

            let mut extra = Params::new();
            if let Some(limit) = limit {
                extra.insert("limit".into(), Value::from(*limit));
            }
            let mut cursor = ChangeFeedCursor::new(mode).with_params(extra);
            if let Some(since) = since {
                cursor = cursor.starting_at(parse_scalar(since));
            }

            if mode == FeedMode::Continuous {
                let format = cli.format.clone();
                cursor.poll(&db.consumer(), |change| {
                    if let Err(e) = print_change(&change, &format) {
                        log::error!("cannot print change {}: {e}", change.id);
                    }
                })?;
            } else {
                let mut results = Vec::new();
                cursor.poll(&db.consumer(), |change| results.push(change))?;
                let output = serde_json::json!({
                    "last_seq": cursor.since(),
                    "results": results,
                });
                print_output(&output, &cli.format)?;
            }
        }

        Command::Design { dir, push } => {
            let design = DesignDirectory::open(dir)?
                .with_max_include_depth(config.max_include_depth);
            if push.is_empty() {
                print_output(&design.document()?, &cli.format)?;
            } else {
                let server = Server::from_config(&config)?;
                let dbs = push
                    .iter()
                    .map(|name| server.database(name))
                    .collect::<Result<Vec<_>, _>>()?;
                let pushed = design.push_to(&dbs)?;
                print_output(
                    &serde_json::json!({ "id": design.docid(), "pushed": pushed }),
                    &cli.format,
                )?;
            }
        }

        Command::Clone { db, docid, dest } => {
            let db = Server::from_config(&config)?.database(db)?;
            let dest = dest.clone().unwrap_or_else(|| {
                PathBuf::from(docid.strip_prefix("_design/").unwrap_or(docid))
            });
            let design = DesignDirectory::clone_from(&db, docid, &dest)?;
            print_output(
                &serde_json::json!({ "id": design.docid(), "dir": dest.display().to_string() }),
                &cli.format,
            )?;
        }
    }

    Ok(())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// One change per line (json) or per YAML document
fn print_change(
    change: &couchkit::Change,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string(change)?),
        OutputFormat::Yaml => print!("---\n{}", serde_yaml::to_string(change)?),
    }
    Ok(())
}

/// Numbers, booleans and JSON literals are parsed; anything else is a string.
fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn params_to_map(params: &[(String, String)]) -> Params {
    params
        .iter()
        .map(|(key, val)| (key.clone(), parse_scalar(val)))
        .collect()
}
