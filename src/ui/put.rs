use anyhow::Result;
use clap::Parser;

use crate::entry::{seq, Attr, DirEntry};
use crate::path::Parsed;

/// Create a directory, or write small text content (e.g. an `Access` or
/// `Group` file) directly into an entry's `packdata`.
///
/// There is no `StoreServer` in this crate (`spec.md` §1's Non-goals), so
/// non-directory content never goes through a `Block` — it's carried
/// inline the same way an `Access`/`Group` file's text is, which keeps
/// the local driver usable without standing up a separate store.
#[derive(Debug, Parser)]
pub struct Args {
    path: String,
    #[arg(long)]
    directory: bool,
    #[arg(long)]
    text: Option<String>,
    #[arg(long, default_value_t = seq::IGNORE)]
    sequence: i64,
}

pub fn run(server: &crate::dirserver::DirServer, caller: &str, args: Args) -> Result<()> {
    let p = Parsed::new(&args.path)?;
    let mut entry = if args.directory {
        DirEntry::new_directory(&p, caller)
    } else {
        let mut e = DirEntry::new_directory(&p, caller);
        e.attr = Attr::None;
        e.packdata = args.text.unwrap_or_default().into_bytes();
        e
    };
    entry.sequence = args.sequence;
    let put = server.put(caller, entry)?;
    println!("put {} at sequence {}", put.name, put.sequence);
    Ok(())
}
