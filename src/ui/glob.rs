use anyhow::Result;
use clap::Parser;

use crate::dirserver::DirServer;

/// List everything matching a shell-glob pattern.
#[derive(Debug, Parser)]
pub struct Args {
    pattern: String,
}

pub fn run(server: &DirServer, caller: &str, args: Args) -> Result<()> {
    let mut entries = server.glob(caller, &args.pattern)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for e in entries {
        let kind = if e.is_dir() { "/" } else { "" };
        println!("{}{kind}", e.name);
    }
    Ok(())
}
