use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tether_apply::{parse_desired, reconcile_batch, BatchItem, DesiredResource, Plan, Reconciler, ReconcilerConfig};
use tether_core::{CanonicalState, ChangeKind, ReconciliationResult};
use tether_persist::{SqliteStore, Store};
use tether_remote::{sandbox::default_sandbox_path, ControlPlane, Sandbox};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Reconcile declared cloud resources against a control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite file holding canonical state (default: ~/.tether/tether.db)
    #[arg(long = "db", env = "TETHER_DB_PATH", global = true)]
    db: Option<String>,

    /// Sandbox control-plane state file (default: ~/.tether/sandbox.json)
    #[arg(long = "sandbox", env = "TETHER_SANDBOX_PATH", global = true)]
    sandbox: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show what apply would do, without calling the remote
    Plan {
        /// YAML list of {address, kind, attributes}
        file: PathBuf,
    },
    /// Reconcile every resource in the file
    Apply {
        file: PathBuf,
        /// Cycles in flight at once (default: TETHER_BATCH_CONCURRENCY or 4)
        #[arg(long = "concurrency")]
        concurrency: Option<usize>,
    },
    /// Adopt an existing remote instance under a local address
    Import {
        kind: String,
        /// Identity token, e.g. "<service_id>:<environment_id>"
        token: String,
        #[arg(long = "address")]
        address: String,
    },
    /// Read a project, service or environment by id without managing it
    Lookup {
        kind: String,
        id: String,
    },
    /// Delete a managed resource per its kind's deletion strategy
    Destroy { address: String },
    /// List managed resources, or the stored history of one
    State { address: Option<String> },
    /// Manage the sandbox control plane
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SandboxCommands {
    /// Make a service exist in an environment
    AddService { service_id: String, environment_id: String },
    /// Remove a service (and its instance configuration) from an environment
    RemoveService { service_id: String, environment_id: String },
    /// List actions the sandbox executed (e.g. redeploys)
    Actions,
    /// Put a project, service or environment in place, e.g. '{"id": "...", "name": "demo"}'
    Seed { kind: String, attributes: String },
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}

struct Ctx {
    store: SqliteStore,
    sandbox: Arc<Sandbox>,
    sandbox_path: PathBuf,
    config: ReconcilerConfig,
}

impl Ctx {
    fn open(cli: &Cli) -> Result<Self> {
        let store = match &cli.db {
            Some(p) => SqliteStore::open(p)?,
            None => SqliteStore::open_default()?,
        };
        let sandbox_path = cli.sandbox.clone().unwrap_or_else(default_sandbox_path);
        let catalog = tether_schema::catalog::railway().context("building catalog")?;
        let sandbox = Arc::new(Sandbox::open(catalog, &sandbox_path)?);
        Ok(Self { store, sandbox, sandbox_path, config: ReconcilerConfig::from_env() })
    }

    fn reconciler(&self, kind: &str) -> Result<Reconciler> {
        let schema = self.sandbox.catalog().get(kind)?;
        let remote: Arc<dyn ControlPlane> = self.sandbox.clone();
        Ok(Reconciler::new(schema, remote, self.config.clone()))
    }

    fn save_sandbox(&self) -> Result<()> { self.sandbox.save(&self.sandbox_path) }

    /// Persist a cycle's outcome under `address`: canonical state, or nothing once removed.
    fn record(&self, address: &str, r: &ReconciliationResult) -> Result<()> {
        match r.canonical() {
            Some(state) => self.store.put_state(address, &r.kind, &state),
            None => self.store.forget(address).map(|_| ()),
        }
    }
}

/// Stored state of `address`, refusing a kind other than the one now declared for it.
fn prior_state(store: &impl Store, address: &str, kind: &str) -> Result<Option<CanonicalState>> {
    match store.latest(address)? {
        Some(s) if s.kind != kind => Err(anyhow!(
            "address {} is managed as {}, not {}; destroy it before re-declaring it",
            address, s.kind, kind
        )),
        other => Ok(other.map(|s| s.state)),
    }
}

fn read_desired(file: &PathBuf) -> Result<Vec<DesiredResource>> {
    let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    parse_desired(&yaml).with_context(|| format!("loading {}", file.display()))
}

#[derive(Serialize)]
struct Row<'a> {
    address: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a ReconciliationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<&'a Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

fn print_result(address: &str, r: &ReconciliationResult) {
    println!("{:<24} {:<9} {:<26} {}", address, r.change_kind, r.kind, r.identity);
    if !r.drift.is_empty() {
        println!("{:<24} drift: {}", "", r.drift.join(", "));
    }
    for w in &r.warnings {
        println!("{:<24} warning: {}", "", w);
    }
}

fn render_age(ts_ms: i64) -> String {
    let Some(then) = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ts_ms) else { return "-".to_string() };
    let mut secs = (chrono::Utc::now() - then).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ctx = Ctx::open(&cli)?;

    match &cli.command {
        Commands::Plan { file } => {
            let desired = read_desired(file)?;
            let mut failed = 0usize;
            let mut rows = Vec::new();
            for d in &desired {
                let planned = prior_state(&ctx.store, &d.address, &d.kind).and_then(|prior| {
                    let r = ctx.reconciler(&d.kind)?;
                    Ok(r.plan(&d.attributes, prior.as_ref())?)
                });
                match planned {
                    Ok(p) => rows.push((d.address.as_str(), Ok(p))),
                    Err(e) => {
                        failed += 1;
                        rows.push((d.address.as_str(), Err(e)));
                    }
                }
            }
            match cli.output {
                Output::Human => {
                    for (addr, p) in &rows {
                        match p {
                            Ok(p) => println!("{:<24} {:<26} {}", addr, p.kind, p.action),
                            Err(e) => println!("{:<24} error: {:#}", addr, e),
                        }
                    }
                }
                Output::Json => {
                    let out: Vec<Row> = rows
                        .iter()
                        .map(|(addr, p)| Row {
                            address: addr,
                            result: None,
                            plan: p.as_ref().ok(),
                            error: p.as_ref().err().map(|e| format!("{:#}", e)),
                            retryable: false,
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} resource(s) failed to plan", failed));
            }
        }
        Commands::Apply { file, concurrency } => {
            let desired = read_desired(file)?;
            // (message, retryable) for addresses that failed before or during their cycle.
            let mut outcomes: Vec<Result<ReconciliationResult, (String, bool)>> =
                desired.iter().map(|_| Err(("not reconciled".to_string(), false))).collect();
            let mut items = Vec::with_capacity(desired.len());
            let mut slots = Vec::with_capacity(desired.len());
            for (i, d) in desired.iter().enumerate() {
                let item = prior_state(&ctx.store, &d.address, &d.kind)
                    .and_then(|prior| Ok(BatchItem { reconciler: ctx.reconciler(&d.kind)?, desired: d.attributes.clone(), prior }));
                match item {
                    Ok(item) => {
                        items.push(item);
                        slots.push(i);
                    }
                    Err(e) => outcomes[i] = Err((format!("{:#}", e), false)),
                }
            }
            let n = concurrency.unwrap_or(ctx.config.batch_concurrency);
            info!(resources = items.len(), skipped = desired.len() - items.len(), concurrency = n, "apply invoked");
            let results = reconcile_batch(items, n).await;
            for (i, r) in slots.into_iter().zip(results) {
                outcomes[i] = r.map_err(|e| (e.to_string(), e.is_retryable()));
            }

            let mut failed = 0usize;
            for (d, r) in desired.iter().zip(&outcomes) {
                match r {
                    Ok(r) => {
                        if let Err(e) = ctx.record(&d.address, r) {
                            error!(address = %d.address, error = %e, "persisting state failed");
                            failed += 1;
                        }
                    }
                    Err((e, retryable)) => {
                        warn!(address = %d.address, error = %e, retryable, "reconcile failed");
                        failed += 1;
                    }
                }
            }
            ctx.save_sandbox()?;

            match cli.output {
                Output::Human => {
                    for (d, r) in desired.iter().zip(&outcomes) {
                        match r {
                            Ok(r) => print_result(&d.address, r),
                            Err((e, retryable)) => println!("{:<24} error: {}{}", d.address, e, if *retryable { " (retryable)" } else { "" }),
                        }
                    }
                }
                Output::Json => {
                    let out: Vec<Row> = desired
                        .iter()
                        .zip(&outcomes)
                        .map(|(d, r)| Row {
                            address: &d.address,
                            result: r.as_ref().ok(),
                            plan: None,
                            error: r.as_ref().err().map(|(e, _)| e.clone()),
                            retryable: r.as_ref().err().map(|(_, retry)| *retry).unwrap_or(false),
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
            if failed > 0 {
                return Err(anyhow!("{} resource(s) failed", failed));
            }
        }
        Commands::Import { kind, token, address } => {
            if ctx.store.latest(address)?.is_some() {
                return Err(anyhow!("address {} is already managed", address));
            }
            let r = ctx.reconciler(kind)?.import_by_identity(token).await?;
            if r.change_kind == ChangeKind::Removed {
                return Err(anyhow!("{} {} does not exist", kind, token));
            }
            ctx.record(address, &r)?;
            match cli.output {
                Output::Human => print_result(address, &r),
                Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
            }
        }
        Commands::Lookup { kind, id } => {
            let r = ctx.reconciler(kind)?.lookup(id).await?;
            let Some(state) = r.canonical_state.as_ref().filter(|_| r.change_kind != ChangeKind::Removed) else {
                return Err(anyhow!("{} {} does not exist", kind, id));
            };
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(state)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
            }
        }
        Commands::Destroy { address } => {
            let stored = ctx.store.latest(address)?.ok_or_else(|| anyhow!("address {} is not managed", address))?;
            let r = ctx.reconciler(&stored.kind)?.destroy(&stored.state).await?;
            ctx.record(address, &r)?;
            ctx.save_sandbox()?;
            match cli.output {
                Output::Human => print_result(address, &r),
                Output::Json => println!("{}", serde_json::to_string_pretty(&r)?),
            }
        }
        Commands::State { address: None } => {
            let addrs = ctx.store.addresses()?;
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:<26} {:<40} AGE", "ADDRESS", "KIND", "IDENTITY");
                    for (addr, _) in &addrs {
                        if let Some(s) = ctx.store.latest(addr)? {
                            println!("{:<24} {:<26} {:<40} {}", addr, s.kind, s.state.identity, render_age(s.ts));
                        }
                    }
                }
                Output::Json => {
                    let mut out = Vec::with_capacity(addrs.len());
                    for (addr, _) in &addrs {
                        if let Some(s) = ctx.store.latest(addr)? {
                            out.push(s);
                        }
                    }
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
        Commands::State { address: Some(address) } => {
            let rows = ctx.store.get_state(address, None)?;
            if rows.is_empty() {
                return Err(anyhow!("address {} is not managed", address));
            }
            match cli.output {
                Output::Human => {
                    for (i, s) in rows.iter().enumerate() {
                        let label = if i == 0 { "current" } else { "previous" };
                        println!("# {} ({}, {} ago) {}", label, s.kind, render_age(s.ts), s.state.identity);
                        println!("{}", serde_yaml::to_string(&s.state.attributes)?);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Sandbox { command } => {
            match command {
                SandboxCommands::AddService { service_id, environment_id } => {
                    ctx.sandbox.register_service_instance(service_id, environment_id);
                    info!(service_id = %service_id, environment_id = %environment_id, "sandbox: service added");
                }
                SandboxCommands::RemoveService { service_id, environment_id } => {
                    ctx.sandbox.unregister_service_instance(service_id, environment_id);
                    info!(service_id = %service_id, environment_id = %environment_id, "sandbox: service removed");
                }
                SandboxCommands::Seed { kind, attributes } => {
                    let attrs: tether_core::WirePayload =
                        serde_json::from_str(attributes).with_context(|| format!("parsing attributes for {}", kind))?;
                    ctx.sandbox.seed(kind, attrs)?;
                }
                SandboxCommands::Actions => {
                    let actions = ctx.sandbox.actions();
                    match cli.output {
                        Output::Human => {
                            for a in &actions {
                                println!("{:<26} {:<40} {}", a.kind, a.identity, a.action);
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&actions)?),
                    }
                }
            }
            ctx.save_sandbox()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_import_with_address() {
        let cli = Cli::try_parse_from(["tetherctl", "-o", "json", "import", "service_instance", "s:e", "--address", "svc.api"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        match cli.command {
            Commands::Import { kind, token, address } => {
                assert_eq!(kind, "service_instance");
                assert_eq!(token, "s:e");
                assert_eq!(address, "svc.api");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cli_parses_sandbox_subcommands() {
        let cli = Cli::try_parse_from(["tetherctl", "sandbox", "add-service", "s1", "e1"]).unwrap();
        assert!(matches!(cli.command, Commands::Sandbox { command: SandboxCommands::AddService { .. } }));
        let cli = Cli::try_parse_from(["tetherctl", "sandbox", "seed", "project", r#"{"id":"p1"}"#]).unwrap();
        assert!(matches!(cli.command, Commands::Sandbox { command: SandboxCommands::Seed { .. } }));
    }

    #[test]
    fn cli_parses_lookup() {
        let cli = Cli::try_parse_from(["tetherctl", "lookup", "environment", "22222222-2222-4222-8222-222222222222"]).unwrap();
        match cli.command {
            Commands::Lookup { kind, id } => {
                assert_eq!(kind, "environment");
                assert_eq!(id, "22222222-2222-4222-8222-222222222222");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn address_redeclared_under_another_kind_is_refused() {
        let path = std::env::temp_dir().join(format!(
            "tetherctl-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        ));
        let store = SqliteStore::open_with_history(&path.to_string_lossy(), 3).unwrap();
        let state = CanonicalState {
            identity: tether_core::IdentityCodec::new(&["id"]).encode_parts(&["net-1"]).unwrap(),
            attributes: tether_core::ResourceSpec::new().with("name", serde_json::json!("internal")),
        };
        store.put_state("net", "private_network", &state).unwrap();

        assert_eq!(prior_state(&store, "net", "private_network").unwrap(), Some(state));
        assert_eq!(prior_state(&store, "other", "private_network_endpoint").unwrap(), None);
        let err = prior_state(&store, "net", "private_network_endpoint").unwrap_err().to_string();
        assert!(err.contains("managed as private_network, not private_network_endpoint"), "{}", err);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn render_age_buckets() {
        let now = chrono::Utc::now().timestamp_millis();
        assert_eq!(render_age(now - 90 * 60 * 1000), "1h30m");
        assert_eq!(render_age(now - 3 * 86_400 * 1000), "3d0h");
    }
}
