use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use serde_json::Value;
use shardkit_core::{Deployment, Filter, GeneratedId, IdGenerator, Record, ShardConfig, ShardTopology};
use shardkit_gateway::PartitionedManager;
use shardkit_persist::SqliteStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shardctl", version, about = "Shardkit operator CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Topology file (YAML)
    #[arg(long = "config", env = "SHARDKIT_CONFIG", global = true, default_value = "shardkit.yaml")]
    config: PathBuf,

    /// Directory holding one SQLite file per shard connection
    #[arg(long = "data-dir", env = "SHARDKIT_DATA_DIR", global = true, default_value = ".shardkit")]
    data_dir: PathBuf,

    /// Log filter directives, e.g. `warn,shardkit_gateway=debug`
    #[arg(long = "log", env = "SHARDKIT_LOG", global = true, default_value = "info")]
    log: String,

    /// Serve Prometheus metrics on this address while the command runs
    #[arg(long = "metrics-addr", env = "SHARDKIT_METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List clusters and their connection aliases
    Clusters,
    /// List declared entities
    Entities,
    /// Show where a set of key values routes to
    Route {
        entity: String,
        /// field=value pairs
        fields: Vec<String>,
    },
    /// Assemble or inspect packed ids
    Id {
        #[command(subcommand)]
        command: IdCommands,
    },
    /// Create every partition table and counter
    Provision,
    /// Insert a row (field=value ...)
    Create { entity: String, fields: Vec<String> },
    /// Fetch exactly one row (field[__op]=value ...)
    Get {
        entity: String,
        lookups: Vec<String>,
        #[arg(long = "replica", action = ArgAction::SetTrue)]
        replica: bool,
    },
    /// Fetch matching rows (field[__op]=value ...)
    Filter {
        entity: String,
        lookups: Vec<String>,
        #[arg(long = "replica", action = ArgAction::SetTrue)]
        replica: bool,
    },
    /// Fetch a row or create it from the lookups and defaults
    GetOrCreate {
        entity: String,
        lookups: Vec<String>,
        /// field=value used only when creating
        #[arg(long = "default", short = 'd')]
        defaults: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum IdCommands {
    /// Pack the current time with a shard number and counter value
    New {
        #[arg(long = "shard")]
        shard: u32,
        #[arg(long = "seq")]
        seq: i64,
    },
    /// Split an id into its components
    Decode { id: i64 },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Clusters => "clusters",
            Commands::Entities => "entities",
            Commands::Route { .. } => "route",
            Commands::Id { .. } => "id",
            Commands::Provision => "provision",
            Commands::Create { .. } => "create",
            Commands::Get { .. } => "get",
            Commands::Filter { .. } => "filter",
            Commands::GetOrCreate { .. } => "get_or_create",
        }
    }
}

/// Logs go to stderr so `-o json` stays machine-readable on stdout.
fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
    if let Some(addr) = cli.metrics_addr {
        match PrometheusBuilder::new().with_http_listener(addr).install() {
            Ok(()) => info!(%addr, "prometheus exporter listening"),
            Err(e) => warn!(%addr, error = %e, "prometheus exporter not installed"),
        }
    }
}

fn load_config(path: &Path) -> Result<ShardConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn epoch_override() -> Result<Option<i64>> {
    match std::env::var("SHARDKIT_EPOCH_MS") {
        Ok(v) => Ok(Some(v.trim().parse().with_context(|| format!("SHARDKIT_EPOCH_MS={:?}", v))?)),
        Err(_) => Ok(None),
    }
}

fn deploy(cfg: &ShardConfig) -> Result<Deployment> {
    let d = match epoch_override()? {
        Some(ms) => cfg.build_with_epoch(ms)?,
        None => cfg.build()?,
    };
    Ok(d)
}

/// `key=value`; the value is JSON when it parses as JSON, a string otherwise.
fn parse_assignment(s: &str) -> Result<(String, Value)> {
    let Some((k, v)) = s.split_once('=') else { bail!("expected field=value, got {:?}", s) };
    if k.is_empty() {
        bail!("empty field name in {:?}", s);
    }
    let value = serde_json::from_str::<Value>(v).unwrap_or_else(|_| Value::String(v.to_string()));
    Ok((k.to_string(), value))
}

fn parse_record(items: &[String]) -> Result<Record> {
    items.iter().map(|s| parse_assignment(s)).collect()
}

fn parse_filter(items: &[String]) -> Result<Filter> {
    let pairs = items.iter().map(|s| parse_assignment(s)).collect::<Result<Vec<_>>>()?;
    Ok(Filter::from_pairs(pairs)?)
}

fn print_json<T: Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn print_rows(output: Output, rows: &[Record]) -> Result<()> {
    match output {
        Output::Human => {
            for r in rows {
                let cols: Vec<String> = r.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                println!("{}", cols.join(" "));
            }
            Ok(())
        }
        Output::Json => print_json(&rows),
    }
}

#[derive(Serialize)]
struct RouteOut<'a> {
    entity: &'a str,
    key: i64,
    partition: u32,
    shard: u32,
    table: &'a str,
    primary: &'a str,
    replica: &'a str,
}

#[derive(Serialize)]
struct IdOut {
    id: i64,
    elapsed_ms: i64,
    shard: u32,
    sequence: i64,
    unix_ms: i64,
    timestamp: Option<String>,
}

impl IdOut {
    fn new(id: GeneratedId, epoch_ms: i64) -> Self {
        Self {
            id: id.value(),
            elapsed_ms: id.elapsed_ms(),
            shard: id.shard(),
            sequence: id.sequence(),
            unix_ms: id.unix_millis(epoch_ms),
            timestamp: id.timestamp(epoch_ms).map(|t| t.to_rfc3339()),
        }
    }
}

fn print_id(output: Output, out: &IdOut) -> Result<()> {
    match output {
        Output::Human => {
            println!("{}", out.id);
            println!("  shard={} seq={} elapsed_ms={}", out.shard, out.sequence, out.elapsed_ms);
            println!("  at {}", out.timestamp.as_deref().unwrap_or("(out of range)"));
            Ok(())
        }
        Output::Json => print_json(out),
    }
}

fn manager(d: &Deployment, store: &Arc<SqliteStore>, entity: &str) -> Result<PartitionedManager<SqliteStore>> {
    Ok(PartitionedManager::for_entity(&d.catalog, entity, Arc::clone(store), Arc::clone(&d.ids))?)
}

fn run_id(config: &Path, output: Output, command: IdCommands) -> Result<()> {
    let epoch_ms = match epoch_override()? {
        Some(ms) => ms,
        None if config.exists() => load_config(config)?.epoch_ms()?,
        None => ShardConfig::default().epoch_ms()?,
    };
    let out = match command {
        IdCommands::New { shard, seq } => IdOut::new(IdGenerator::new(epoch_ms).generate(seq, shard)?, epoch_ms),
        IdCommands::Decode { id } => IdOut::new(GeneratedId::from_raw(id), epoch_ms),
    };
    print_id(output, &out)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli);
    let command = cli.command.name();
    let started = Instant::now();
    let result = run(cli);
    let outcome = if result.is_ok() { "ok" } else { "error" };
    counter!("shardctl_commands_total", 1u64, "command" => command, "outcome" => outcome);
    histogram!("shardctl_command_ms", started.elapsed().as_secs_f64() * 1000.0, "command" => command);
    result
}

fn run(cli: Cli) -> Result<()> {
    let open = || -> Result<Deployment> { deploy(&load_config(&cli.config)?) };

    match cli.command {
        // works without a topology file
        Commands::Id { command } => run_id(&cli.config, cli.output, command)?,
        Commands::Clusters => {
            let d = open()?;
            let clusters = d.catalog.registry().clusters();
            match cli.output {
                Output::Human => {
                    for c in clusters {
                        let aliases: Vec<&str> = c.slots().iter().map(|s| s.primary.as_str()).collect();
                        println!("{} • {} shards • {}", c.name(), c.size(), aliases.join(", "));
                    }
                }
                Output::Json => print_json(&clusters)?,
            }
        }
        Commands::Entities => {
            let d = open()?;
            let entities = d.catalog.entities();
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<20} {:<10} {:>6}  KEY", "ENTITY", "TABLE", "CLUSTER", "SHARDS");
                    for t in &entities {
                        println!(
                            "{:<16} {:<20} {:<10} {:>6}  {}",
                            t.entity(),
                            t.table(),
                            t.cluster(),
                            t.num_shards(),
                            t.key().join("+")
                        );
                    }
                }
                Output::Json => {
                    let specs: Vec<_> = entities.iter().map(|t| t.spec()).collect();
                    print_json(&specs)?
                }
            }
        }
        Commands::Route { entity, fields } => {
            let d = open()?;
            let t: Arc<ShardTopology> = d.catalog.topology(&entity)?;
            let values = parse_filter(&fields)?;
            let key = t.key_from_values(&values)?;
            let p = shardkit_core::router::partition_for(&t, key)?;
            let out = RouteOut {
                entity: t.entity(),
                key,
                partition: p.index,
                shard: p.shard,
                table: &p.table,
                primary: p.primary.as_str(),
                replica: p.replica.as_str(),
            };
            match cli.output {
                Output::Human => println!(
                    "{} key={} → partition {} ({}) on {} / {}",
                    out.entity, out.key, out.partition, out.table, out.primary, out.replica
                ),
                Output::Json => print_json(&out)?,
            }
        }
        Commands::Provision => {
            let d = open()?;
            let store = Arc::new(SqliteStore::for_registry(&cli.data_dir, d.catalog.registry())?);
            for t in d.catalog.entities() {
                PartitionedManager::new(Arc::clone(&t), Arc::clone(&store), Arc::clone(&d.ids)).provision()?;
                if cli.output == Output::Human {
                    println!("{}: {} partitions ready", t.entity(), t.num_shards());
                }
            }
            info!(dir = %cli.data_dir.display(), "provisioning done");
        }
        Commands::Create { entity, fields } => {
            let d = open()?;
            let store = Arc::new(SqliteStore::for_registry(&cli.data_dir, d.catalog.registry())?);
            let row = manager(&d, &store, &entity)?.create(parse_record(&fields)?)?;
            print_rows(cli.output, &[row])?;
        }
        Commands::Get { entity, lookups, replica } => {
            let d = open()?;
            let store = Arc::new(SqliteStore::for_registry(&cli.data_dir, d.catalog.registry())?);
            let row = manager(&d, &store, &entity)?.with_replica_reads(replica).get(&parse_filter(&lookups)?)?;
            print_rows(cli.output, &[row])?;
        }
        Commands::Filter { entity, lookups, replica } => {
            let d = open()?;
            let store = Arc::new(SqliteStore::for_registry(&cli.data_dir, d.catalog.registry())?);
            let rows = manager(&d, &store, &entity)?.with_replica_reads(replica).filter(&parse_filter(&lookups)?)?;
            print_rows(cli.output, &rows)?;
        }
        Commands::GetOrCreate { entity, lookups, defaults } => {
            let d = open()?;
            let store = Arc::new(SqliteStore::for_registry(&cli.data_dir, d.catalog.registry())?);
            let (row, created) =
                manager(&d, &store, &entity)?.get_or_create(&parse_filter(&lookups)?, &parse_record(&defaults)?)?;
            match cli.output {
                Output::Human => {
                    println!("{}", if created { "created" } else { "found" });
                    print_rows(cli.output, &[row])?;
                }
                Output::Json => print_json(&serde_json::json!({"created": created, "row": row}))?,
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_parse_json_then_fall_back_to_text() {
        assert_eq!(parse_assignment("poll_id=3").unwrap(), ("poll_id".into(), Value::from(3)));
        assert_eq!(parse_assignment("choice_text=yes").unwrap(), ("choice_text".into(), Value::from("yes")));
        assert_eq!(parse_assignment("id__in=[1,2]").unwrap().1, serde_json::json!([1, 2]));
        assert_eq!(parse_assignment("note=a=b").unwrap().1, Value::from("a=b"));
        assert!(parse_assignment("novalue").is_err());
        assert!(parse_assignment("=1").is_err());
    }

    #[test]
    fn global_flags_and_command_names() {
        let cli = Cli::try_parse_from([
            "shardctl", "get-or-create", "Choice", "poll_id=1", "-d", "votes=0", "--log", "debug", "--metrics-addr", "127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(cli.command.name(), "get_or_create");
        assert_eq!(cli.log, "debug");
        assert_eq!(cli.metrics_addr, Some("127.0.0.1:9000".parse().unwrap()));
        assert!(Cli::try_parse_from(["shardctl", "clusters", "--metrics-addr", "nope"]).is_err());
    }

    #[test]
    fn yaml_topology_builds() {
        let cfg: ShardConfig = serde_yaml::from_str(
            "connections: [default, sharded.shard0, sharded.shard1, sharded.slave.shard0, sharded.slave.shard1]\n\
             entities:\n\
             \x20 - name: Choice\n\
             \x20   table: polls_choice\n\
             \x20   cluster: sharded\n\
             \x20   num_shards: 2\n\
             \x20   key: poll_id\n",
        )
        .unwrap();
        let d = cfg.build().unwrap();
        assert_eq!(d.catalog.connection_for("Choice", 3, false).unwrap().as_str(), "sharded.shard1");
        let f = parse_filter(&["poll_id=4".to_string(), "votes__gte=1".to_string()]).unwrap();
        assert_eq!(d.catalog.topology("Choice").unwrap().key_from_values(&f).unwrap(), 4);
    }
}
