use anyhow::Result;
use clap::Parser;

use crate::dirserver::DirServer;
use crate::error::Outcome;

/// Look up one path and print its metadata.
#[derive(Debug, Parser)]
pub struct Args {
    path: String,
}

pub fn run(server: &DirServer, caller: &str, args: Args) -> Result<()> {
    match server.lookup(caller, &args.path) {
        Outcome::Ok(entry) => {
            println!("{entry:#?}");
            Ok(())
        }
        Outcome::FollowLink(link) => {
            println!("follow link -> {}", link.link.as_deref().unwrap_or(""));
            Ok(())
        }
        Outcome::Err(e) => Err(e.into()),
    }
}
