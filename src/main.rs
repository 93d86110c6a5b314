use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use upspin_dir::config;
use upspin_dir::counters;
use upspin_dir::dirserver::{DirServer, ServerOptions};
use upspin_dir::ui;

#[derive(Debug, Parser)]
#[command(about = "Local driver for a directory-server core, one verb at a time")]
struct Args {
    /// Identity to issue requests as.
    #[arg(long, global = true)]
    caller: String,

    /// Override the configured log directory.
    #[arg(long, global = true)]
    log_dir: Option<Utf8PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Lookup(ui::lookup::Args),
    Put(ui::put::Args),
    Delete(ui::delete::Args),
    Glob(ui::glob::Args),
    GlobMany(ui::glob_many::Args),
    WhichAccess(ui::which_access::Args),
    Watch(ui::watch::Args),
    Warm(ui::warm::Args),
    LookupCached(ui::lookup_cached::Args),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let conf = config::load()?;
    let log_dir = args.log_dir.unwrap_or(conf.log_dir);

    let server = Arc::new(DirServer::new(ServerOptions {
        server_identity: conf.server_identity,
        log_dir,
        per_user_log_budget_bytes: conf.per_user_log_budget.as_u64(),
        remote_group_ttl: Duration::from_secs(conf.remote_group_ttl_secs),
    }));

    let result = match args.command {
        Command::Lookup(a) => ui::lookup::run(&server, &args.caller, a),
        Command::Put(a) => ui::put::run(&server, &args.caller, a),
        Command::Delete(a) => ui::delete::run(&server, &args.caller, a),
        Command::Glob(a) => ui::glob::run(&server, &args.caller, a),
        Command::GlobMany(a) => ui::glob_many::run(server.clone(), args.caller.clone(), a).await,
        Command::WhichAccess(a) => ui::which_access::run(&server, &args.caller, a),
        Command::Watch(a) => ui::watch::run(&server, &args.caller, a),
        Command::Warm(a) => ui::warm::run(server.clone(), a).await,
        Command::LookupCached(a) => ui::lookup_cached::run(server.clone(), &args.caller, a),
    };

    server.flush_all()?;
    counters::log_counts();
    result
}

/// Send `tracing` output to stderr, filterable via `RUST_LOG`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "upspin_dir=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
