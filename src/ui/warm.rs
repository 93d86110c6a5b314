use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::task::JoinSet;
use tracing::info;

use crate::dirserver::DirServer;

/// Touch several users' trees concurrently so their first real request
/// doesn't pay the Absent -> Loading cost one at a time.
#[derive(Debug, Parser)]
pub struct Args {
    users: Vec<String>,
}

/// Fan out one `get_or_load_tree`-triggering lookup per user onto the
/// runtime, propagating the first failure rather than waiting out the
/// rest (a warm-up that can't reach every user is worth failing loudly
/// on, the same way `ui::glob_many` doesn't paper over a bad pattern).
pub async fn run(server: Arc<DirServer>, args: Args) -> Result<()> {
    let mut tasks = JoinSet::new();
    for user in args.users {
        let server = server.clone();
        tasks.spawn(async move {
            let user2 = user.clone();
            tokio::task::spawn_blocking(move || server.lookup(&user2, &format!("{user2}/")))
                .await
                .map_err(anyhow::Error::from)?;
            info!("warmed {user}");
            Ok::<(), anyhow::Error>(())
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap()?;
    }
    Ok(())
}
