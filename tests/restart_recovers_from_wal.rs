// Puts survive a `DirServer` restart by replaying each user's
// write-ahead log, the same way `backpak`'s own integration tests check
// that a backup survives a rebuilt index.

use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;
use tempfile::tempdir;
use upspin_dir::dirserver::{DirServer, ServerOptions};
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
fn tree_survives_a_fresh_server_instance() -> Result<()> {
    let tmp = tempdir()?;
    let base = Utf8Path::from_path(tmp.path()).unwrap();

    {
        let server = DirServer::new(options(base));
        let root = upspin_dir::entry::DirEntry::new_directory(
            &Parsed::new("ann@example.com/")?,
            "ann@example.com",
        );
        server.put("ann@example.com", root)?;

        let mut docs = upspin_dir::entry::DirEntry::new_directory(
            &Parsed::new("ann@example.com/")?,
            "ann@example.com",
        );
        docs.name = "ann@example.com/docs".into();
        docs.signed_name = docs.name.clone();
        server.put("ann@example.com", docs)?;

        server.flush_all()?;
        // `server` drops here: nothing is kept resident in memory.
    }

    let server = DirServer::new(options(base));
    match server.lookup("ann@example.com", "ann@example.com/docs") {
        Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
        other => panic!("expected the replayed entry, got {other:?}"),
    }
    Ok(())
}

#[test]
fn evicting_a_user_and_relooking_up_replays_cleanly() -> Result<()> {
    let tmp = tempdir()?;
    let base = Utf8Path::from_path(tmp.path()).unwrap();
    let server = DirServer::new(options(base));

    let root = upspin_dir::entry::DirEntry::new_directory(
        &Parsed::new("bob@example.com/")?,
        "bob@example.com",
    );
    server.put("bob@example.com", root)?;
    server.evict("bob@example.com")?;

    match server.lookup("bob@example.com", "bob@example.com/") {
        Outcome::Ok(e) => assert_eq!(e.name, "bob@example.com/"),
        other => panic!("expected Ok after eviction + replay, got {other:?}"),
    }
    Ok(())
}
