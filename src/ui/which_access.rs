use anyhow::Result;
use clap::Parser;

use crate::dirserver::DirServer;

/// Print the `Access` file that governs a path, if any.
#[derive(Debug, Parser)]
pub struct Args {
    path: String,
}

pub fn run(server: &DirServer, caller: &str, args: Args) -> Result<()> {
    match server.which_access(caller, &args.path)? {
        Some(entry) => println!("{}", entry.name),
        None => println!("(implicit: owner-only)"),
    }
    Ok(())
}
