use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::clog::DirCache;
use crate::dirserver::DirServer;
use crate::error::Outcome;

/// Look up a path through a client-side `DirCache` in front of the
/// server, to exercise the cache hit/miss path from the command line.
#[derive(Debug, Parser)]
pub struct Args {
    path: String,
    #[arg(long)]
    cache_dir: Utf8PathBuf,
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    cache_budget_bytes: u64,
}

pub fn run(server: Arc<DirServer>, caller: &str, args: Args) -> Result<()> {
    let cache = DirCache::open(server, caller, &args.cache_dir, args.cache_budget_bytes)?;
    match cache.lookup(&args.path) {
        Outcome::Ok(entry) => println!("{entry:#?}"),
        Outcome::FollowLink(link) => println!("follow link -> {}", link.link.as_deref().unwrap_or("")),
        Outcome::Err(e) => return Err(e.into()),
    }
    Ok(())
}
