// A `Watch` subscription set up through the full `DirServer` (not just
// the bare `WatchHub`) sees subsequent `Put`s land as events, in the
// order they were made.

use std::time::Duration;

use anyhow::Result;
use camino::Utf8Path;
use tempfile::tempdir;
use upspin_dir::dirserver::{DirServer, ServerOptions};
use upspin_dir::entry::{seq, DirEntry};
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
fn subscriber_sees_puts_made_after_it_subscribes() -> Result<()> {
    let tmp = tempdir()?;
    let base = Utf8Path::from_path(tmp.path()).unwrap();
    let server = DirServer::new(options(base));

    let root = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    server.put("ann@example.com", root)?;

    let sub = server.watch("ann@example.com", "ann@example.com/", seq::IGNORE)?;

    let mut docs = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    docs.name = "ann@example.com/docs".into();
    docs.signed_name = docs.name.clone();
    server.put("ann@example.com", docs)?;

    let event = sub.receiver.recv_timeout(Duration::from_secs(1))?;
    assert_eq!(event.name, "ann@example.com/docs");

    let deleted = server.delete("ann@example.com", "ann@example.com/docs")?;
    assert_eq!(deleted.name, "ann@example.com/docs");

    let event = sub.receiver.recv_timeout(Duration::from_secs(1))?;
    assert_eq!(event.name, "ann@example.com/docs");
    assert!(event.entry.is_none());

    Ok(())
}

// A subscriber with List but not Read on the watched subtree still sees
// every event, but each one's entry arrives stripped of Blocks/Packdata
// (`Attr::Incomplete`) instead of carrying the real content pointer.
#[test]
fn subscriber_without_read_gets_incomplete_entries() -> Result<()> {
    let tmp = tempdir()?;
    let base = Utf8Path::from_path(tmp.path()).unwrap();
    let server = DirServer::new(options(base));

    let root = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    server.put("ann@example.com", root)?;

    let mut access = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    access.attr = upspin_dir::entry::Attr::None;
    access.name = "ann@example.com/Access".into();
    access.signed_name = access.name.clone();
    access.packdata = b"list: other@example.com\n".to_vec();
    server.put("ann@example.com", access)?;

    let sub = server.watch("other@example.com", "ann@example.com/", seq::IGNORE)?;

    let mut doc = DirEntry::new_directory(&Parsed::new("ann@example.com/")?, "ann@example.com");
    doc.attr = upspin_dir::entry::Attr::None;
    doc.name = "ann@example.com/doc.txt".into();
    doc.signed_name = doc.name.clone();
    doc.packdata = b"secret contents".to_vec();
    server.put("ann@example.com", doc)?;

    let event = sub.receiver.recv_timeout(Duration::from_secs(1))?;
    assert_eq!(event.name, "ann@example.com/doc.txt");
    let entry = event.entry.expect("put events carry an entry");
    assert_eq!(entry.attr, upspin_dir::entry::Attr::Incomplete);
    assert!(entry.packdata.is_empty());

    Ok(())
}
