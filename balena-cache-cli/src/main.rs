use balena_cache::config::auth_token;
use balena_cache::{
    BalenaApi, CacheConfig, CollectionKind, FindOptions, FleetClient, Filter, PartitionMeta,
    Projection, Sort, TunnelBuilder,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

/// balena-cache: query a local cache of Balena fleet data
#[derive(Parser)]
#[command(name = "balena-cache", version, about)]
struct Cli {
    /// YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory (default: the per-user cache directory)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Maximum age of cached data in seconds
    #[arg(long, global = true)]
    max_age: Option<u64>,

    /// Output format
    #[arg(long, global = true, default_value = "yaml")]
    format: OutputFormat,

    /// Query the Balena API directly and leave the cache untouched
    #[arg(long, global = true)]
    bypass_cache: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Args)]
struct QueryArgs {
    /// Filter document as JSON (e.g. '{"is_online": true}')
    #[arg(long)]
    query: Option<String>,
    /// Projection as JSON (e.g. '{"uuid": 1}')
    #[arg(long)]
    projection: Option<String>,
    /// Sort specification as JSON (e.g. '{"device_name": 1}')
    #[arg(long)]
    sort: Option<String>,
    #[arg(long)]
    skip: Option<usize>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// List devices
    Devices {
        /// Restrict to one fleet (id, name or slug)
        #[arg(long)]
        fleet: Option<String>,
        #[command(flatten)]
        query: QueryArgs,
    },

    /// List applications (fleets)
    Applications {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// List releases of a fleet
    Releases {
        #[arg(long)]
        fleet: String,
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Refresh collections now (all when none are given)
    Preload {
        #[arg(value_parser = parse_collection)]
        collections: Vec<CollectionKind>,
        /// Fleet to preload releases for
        #[arg(long)]
        fleet: Option<String>,
    },

    /// Show what is cached and how old it is
    Status,

    /// Mark cached data as needing a refresh
    Invalidate {
        #[arg(value_parser = parse_collection)]
        collection: CollectionKind,
        #[arg(long)]
        fleet: Option<String>,
    },

    /// Resolve a release commit, id or version to its release id
    ResolveRelease {
        #[arg(long)]
        fleet: String,
        identifier: String,
    },

    /// Check whether a device runs a given release
    IsRunning {
        /// Device UUID
        uuid: String,
        /// Release commit, id or version
        identifier: String,
    },

    /// Check whether a device's supervisor is in local mode
    LocalMode {
        /// Device UUID
        uuid: String,
    },

    /// Open a tunnel to a device and run a command against it.
    /// `{port}` in the command is replaced by the local port.
    Tunnel {
        /// Device UUID
        uuid: String,
        #[arg(long)]
        remote_port: u16,
        /// Path to the balena CLI
        #[arg(long, default_value = balena_cache::tunnel::DEFAULT_PROGRAM)]
        balena_bin: String,
        /// Seconds to wait for the tunnel to come up
        #[arg(long, default_value_t = 10)]
        ready_timeout: u64,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

impl Command {
    fn needs_remote(&self) -> bool {
        !matches!(self, Command::Status | Command::Tunnel { .. })
    }
}

fn parse_collection(s: &str) -> Result<CollectionKind, String> {
    s.parse().map_err(|e: balena_cache::CacheError| e.to_string())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = build_config(&cli)?;

    let token = match auth_token() {
        Ok(token) => token,
        Err(e) if cli.command.needs_remote() => return Err(e.into()),
        Err(_) => String::new(),
    };
    let client = FleetClient::new(config, BalenaApi::new(token)?)?;
    let bypass = cli.bypass_cache;

    match &cli.command {
        Command::Devices { fleet, query } => {
            let options = find_options(query)?;
            let docs = client.find(CollectionKind::Devices, fleet.as_deref(), &options, bypass)?;
            print_output(&Value::Array(docs), &cli.format)?;
        }

        Command::Applications { query } => {
            let options = find_options(query)?;
            let docs = client.find(CollectionKind::Applications, None, &options, bypass)?;
            print_output(&Value::Array(docs), &cli.format)?;
        }

        Command::Releases { fleet, query } => {
            let options = find_options(query)?;
            let docs = client.find(CollectionKind::Releases, Some(fleet.as_str()), &options, bypass)?;
            print_output(&Value::Array(docs), &cli.format)?;
        }

        Command::Preload { collections, fleet } => {
            let collections = if collections.is_empty() {
                // Releases need a fleet, so only include them when one is given
                CollectionKind::ALL
                    .into_iter()
                    .filter(|kind| !kind.requires_scope() || fleet.is_some())
                    .collect()
            } else {
                collections.clone()
            };
            client.preload(&collections, fleet.as_deref())?;
            let names: Vec<&str> = collections.iter().map(|kind| kind.as_str()).collect();
            print_output(&json!({ "ok": true, "preloaded": names }), &cli.format)?;
        }

        Command::Status => {
            let entries: Vec<Value> = client
                .status()?
                .iter()
                .map(|meta| status_entry(meta, client.cache().config()))
                .collect();
            print_output(
                &json!({ "enabled": client.cache().is_enabled(), "collections": entries }),
                &cli.format,
            )?;
        }

        Command::Invalidate { collection, fleet } => {
            client.invalidate(*collection, fleet.as_deref())?;
            print_output(
                &json!({ "ok": true, "invalidated": collection.as_str(), "fleet": fleet }),
                &cli.format,
            )?;
        }

        Command::ResolveRelease { fleet, identifier } => {
            let id = client.resolve_release_id(fleet, identifier)?;
            print_output(&json!({ "id": id }), &cli.format)?;
        }

        Command::IsRunning { uuid, identifier } => {
            let running = client.is_device_running_release(uuid, identifier)?;
            print_output(&json!({ "uuid": uuid, "running": running }), &cli.format)?;
        }

        Command::LocalMode { uuid } => {
            let local_mode = client.source().is_device_in_local_mode(uuid)?;
            print_output(&json!({ "uuid": uuid, "local_mode": local_mode }), &cli.format)?;
        }

        Command::Tunnel {
            uuid,
            remote_port,
            balena_bin,
            ready_timeout,
            command,
        } => {
            let builder = TunnelBuilder::new()
                .program(balena_bin)
                .ready_timeout(Duration::from_secs(*ready_timeout));
            run_tunnel(&builder, uuid, *remote_port, command)?;
        }
    }

    client.close()?;
    Ok(())
}

fn build_config(cli: &Cli) -> Result<CacheConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_file(path)?,
        None => CacheConfig::default(),
    };
    if let Some(dir) = &cli.cache_dir {
        config = config.with_cache_dir(dir.clone());
    }
    if let Some(secs) = cli.max_age {
        config = config.with_default_max_age(Duration::from_secs(secs));
    }
    Ok(config)
}

fn find_options(args: &QueryArgs) -> Result<FindOptions, Box<dyn std::error::Error>> {
    let filter = match &args.query {
        Some(text) => Filter::parse_str(text)?,
        None => Filter::default(),
    };
    let mut options = FindOptions::new(filter);
    if let Some(text) = &args.projection {
        options = options.projection(Projection::parse_str(text)?);
    }
    if let Some(text) = &args.sort {
        options = options.sort(Sort::parse_str(text)?);
    }
    if let Some(skip) = args.skip {
        options = options.skip(skip);
    }
    if let Some(limit) = args.limit {
        options = options.limit(limit);
    }
    Ok(options)
}

fn status_entry(meta: &PartitionMeta, config: &CacheConfig) -> Value {
    let age = chrono::Utc::now() - meta.last_refreshed;
    let max_age = meta
        .collection
        .parse::<CollectionKind>()
        .map(|kind| config.max_age_for(kind))
        .unwrap_or(config.default_max_age);
    let stale = meta.invalidated || age.num_seconds() > max_age.as_secs() as i64;
    json!({
        "collection": meta.collection,
        "partition": meta.partition,
        "last_refreshed": meta.last_refreshed.to_rfc3339(),
        "age_secs": age.num_seconds(),
        "document_count": meta.document_count,
        "invalidated": meta.invalidated,
        "stale": stale,
    })
}

fn run_tunnel(
    builder: &TunnelBuilder,
    uuid: &str,
    remote_port: u16,
    command: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    let tunnel = builder.open(uuid, remote_port)?;
    let port = tunnel.local_port().to_string();
    let args: Vec<String> = command.iter().map(|arg| arg.replace("{port}", &port)).collect();

    let (program, rest) = args.split_first().ok_or("no command given")?;
    log::info!("Running {program} through tunnel on port {port}");
    let status = process::Command::new(program).args(rest).status();
    tunnel.close()?;

    let status = status.map_err(|e| format!("cannot run {program}: {e}"))?;
    if !status.success() {
        return Err(format!("{program} exited with {status}").into());
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
