use anyhow::Result;
use clap::Parser;

use crate::dirserver::DirServer;

/// Delete one path.
#[derive(Debug, Parser)]
pub struct Args {
    path: String,
}

pub fn run(server: &DirServer, caller: &str, args: Args) -> Result<()> {
    let removed = server.delete(caller, &args.path)?;
    println!("deleted {}", removed.name);
    Ok(())
}
