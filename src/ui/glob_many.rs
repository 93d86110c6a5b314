use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::task::JoinSet;

use crate::dirserver::DirServer;
use crate::entry::DirEntry;

/// Glob several patterns concurrently and print the combined, sorted
/// results — handy for listing more than one subtree in one pass.
#[derive(Debug, Parser)]
pub struct Args {
    patterns: Vec<String>,
}

/// Fan out one `DirServer::glob` per pattern and collect every result
/// set before printing, so the combined listing sorts as if it came from
/// a single Glob.
pub async fn run(server: Arc<DirServer>, caller: String, args: Args) -> Result<()> {
    let mut tasks = JoinSet::new();
    for pattern in args.patterns {
        let server = server.clone();
        let caller = caller.clone();
        tasks.spawn(async move {
            let result = tokio::task::spawn_blocking(move || server.glob(&caller, &pattern))
                .await
                .map_err(anyhow::Error::from)?;
            result.map_err(anyhow::Error::from)
        });
    }

    let mut all: Vec<DirEntry> = Vec::new();
    while let Some(res) = tasks.join_next().await {
        all.extend(res.unwrap()?);
    }
    all.sort_by(|a, b| a.name.cmp(&b.name));
    for e in all {
        let kind = if e.is_dir() { "/" } else { "" };
        println!("{}{kind}", e.name);
    }
    Ok(())
}
