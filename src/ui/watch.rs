use anyhow::Result;
use clap::Parser;
use console::style;

use crate::dirserver::DirServer;

/// Subscribe to a subtree and print events as they arrive.
#[derive(Debug, Parser)]
pub struct Args {
    subtree: String,
    #[arg(long, default_value_t = -1)]
    since: i64,
    /// Stop after this many events instead of watching forever.
    #[arg(long)]
    count: Option<usize>,
}

pub fn run(server: &DirServer, caller: &str, args: Args) -> Result<()> {
    let subscription = server.watch(caller, &args.subtree, args.since)?;
    let mut seen = 0usize;
    for event in subscription.receiver.iter() {
        match &event.entry {
            Some(entry) => println!("{} {} (seq {})", style("put").green(), entry.name, event.sequence),
            None => println!("{} {} (seq {})", style("delete").red(), event.name, event.sequence),
        }
        seen += 1;
        if args.count.is_some_and(|c| seen >= c) {
            break;
        }
    }
    Ok(())
}
