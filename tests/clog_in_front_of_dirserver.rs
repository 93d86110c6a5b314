// `DirCache` sitting in front of a real `DirServer` (not a fake
// upstream): a lookup is served from cache once populated, and it keeps
// serving the same answer even after the underlying tree changes, since
// nothing here drives the watcher thread that would normally invalidate
// it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;
use tempfile::tempdir;
use upspin_dir::clog::DirCache;
use upspin_dir::dirserver::{DirServer, ServerOptions};
use upspin_dir::entry::DirEntry;
use upspin_dir::error::Outcome;
use upspin_dir::path::Parsed;

fn options(dir: &Utf8Path) -> ServerOptions {
    ServerOptions {
        server_identity: "dir.example.com".into(),
        log_dir: dir.to_owned(),
        per_user_log_budget_bytes: 1 << 20,
        remote_group_ttl: Duration::from_secs(60),
    }
}

#[test]
fn cached_lookup_matches_the_live_server() -> Result<()> {
    let server_dir = tempdir()?;
    let server_base = Utf8Path::from_path(server_dir.path()).unwrap();
    let server = Arc::new(DirServer::new(options(server_base)));

    let root = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    server.put("ann@example.com", root)?;
    let mut docs = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    docs.name = "ann@example.com/docs".into();
    docs.signed_name = docs.name.clone();
    server.put("ann@example.com", docs)?;

    let cache_dir = tempdir()?;
    let cache_base = Utf8Path::from_path(cache_dir.path()).unwrap().join("clog");
    let cache = DirCache::open(server.clone(), "ann@example.com", &cache_base, 1 << 20)?;

    match cache.lookup("ann@example.com/docs") {
        Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
        other => panic!("expected Ok, got {other:?}"),
    }

    // Second lookup is served from the LRU without needing the server
    // to still have the entry reachable some other way; delete it
    // upstream and confirm the cache doesn't notice on its own (no
    // watcher thread is running in this test).
    server.delete("ann@example.com", "ann@example.com/docs")?;
    match cache.lookup("ann@example.com/docs") {
        Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
        other => panic!("expected the stale cached Ok, got {other:?}"),
    }

    Ok(())
}

#[test]
fn negative_lookups_are_cached_too() -> Result<()> {
    let server_dir = tempdir()?;
    let server_base = Utf8Path::from_path(server_dir.path()).unwrap();
    let server = Arc::new(DirServer::new(options(server_base)));

    let root = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    server.put("ann@example.com", root)?;

    let cache_dir = tempdir()?;
    let cache_base = Utf8Path::from_path(cache_dir.path()).unwrap().join("clog");
    let cache = DirCache::open(server.clone(), "ann@example.com", &cache_base, 1 << 20)?;

    match cache.lookup("ann@example.com/nope") {
        Outcome::Err(e) => assert_eq!(e.kind, upspin_dir::error::Kind::NotExist),
        other => panic!("expected NotExist, got {other:?}"),
    }
    Ok(())
}
