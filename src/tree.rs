//! One user's in-memory namespace (`spec.md` §4.2): a lazily-materialized
//! graph of [`DirEntry`] nodes, backed by a [`Wal`] for durability.
//!
//! The block-splitting in [`Tree::flush`] is grounded on
//! `backpak::pack::PackfileWriter`'s size-accounting loop: accumulate
//! marshalled children into the current block until the next one would
//! push it past the cap, then close the block and start a new one.

use std::collections::HashMap;

use jiff::Timestamp;

use crate::entry::{seq, Block, DirEntry, Location};
use crate::error::{DirError, Kind, Outcome};
use crate::path::Parsed;
use crate::wal::{IndexFile, LogOffset, MarshalledError, Record, Request, Wal};
use crate::watch::{Event, Subscription, WatchHub};

/// Directory entries are packed into blocks no larger than this before a
/// new block is started (`spec.md` §4.2).
pub const MAX_BLOCK_SIZE: u64 = 1 << 20;

struct Node {
    entry: DirEntry,
    kids: HashMap<String, Node>,
    dirty: bool,
}

impl Node {
    fn new(entry: DirEntry) -> Self {
        Self {
            entry,
            kids: HashMap::new(),
            dirty: false,
        }
    }
}

/// The canonical namespace for one user. Every public method takes `&mut
/// self`: callers serialize access themselves via the per-user lock
/// described in `spec.md` §5, so this type needs no internal locking.
pub struct Tree {
    user: String,
    root: Option<Node>,
    wal: Wal,
    applied: LogOffset,
    hub: WatchHub,
}

impl Tree {
    /// Open (or create) the tree for `user`, replaying its log from the
    /// last persisted offset (`spec.md` §4.3.4: "Logs present -> replay
    /// all records into an empty Tree").
    pub fn open(user: &str, wal: Wal) -> Result<Self, DirError> {
        let index = wal.read_index()?;
        let mut tree = Self {
            user: user.to_string(),
            root: index.as_ref().and_then(|i| i.root.clone()).map(Node::new),
            wal,
            applied: LogOffset::ZERO,
            hub: WatchHub::new(),
        };

        let from = index.map(|i| i.offset).unwrap_or(LogOffset::ZERO);
        let mut pending: Vec<Record> = Vec::new();
        tree.applied = tree.wal.replay(from, |record| pending.push(record.clone()))?;
        for record in pending {
            tree.apply_replayed(record);
        }
        Ok(tree)
    }

    fn apply_replayed(&mut self, record: Record) {
        match record.request {
            Request::Put => {
                if let Some(entry) = record.entry {
                    if let Ok(p) = Parsed::new(&entry.name) {
                        let _ = self.put_node(&p, entry, true);
                    }
                }
            }
            Request::Delete => {
                if let Some(name) = record.name {
                    if let Ok(p) = Parsed::new(&name) {
                        let _ = self.delete_node(&p);
                    }
                }
            }
            _ => {}
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Walk cached nodes. Returns `FollowLink` if a link is encountered
    /// strictly before the final path element.
    pub fn lookup(&self, p: &Parsed) -> Outcome<DirEntry> {
        match self.find(p) {
            Ok(Some(node)) => Outcome::Ok(node.entry.clone()),
            Ok(None) => Outcome::err(Kind::NotExist, p.path(), "no such path"),
            Err(link) => Outcome::FollowLink(link),
        }
    }

    pub fn list(&self, p: &Parsed) -> Result<Vec<DirEntry>, DirError> {
        match self.find(p) {
            Ok(Some(node)) => {
                if !node.entry.is_dir() {
                    return Err(DirError::new(Kind::NotDir, p.path(), "not a directory"));
                }
                let mut entries: Vec<DirEntry> = node.kids.values().map(|k| k.entry.clone()).collect();
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            }
            Ok(None) => Err(DirError::new(Kind::NotExist, p.path(), "no such path")),
            Err(link) => Err(DirError::new(
                Kind::Internal,
                link.name.as_str(),
                "List encountered a link; caller should Lookup first",
            )),
        }
    }

    fn find(&self, p: &Parsed) -> Result<Option<&Node>, DirEntry> {
        let Some(root) = &self.root else { return Ok(None) };
        if p.is_root() {
            return Ok(Some(root));
        }
        let mut cur = root;
        for i in 0..p.n_elem() {
            if cur.entry.is_link() {
                return Err(cur.entry.clone());
            }
            match cur.kids.get(p.elem(i)) {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    fn find_mut(&mut self, p: &Parsed) -> Result<Option<&mut Node>, DirEntry> {
        let Some(root) = &mut self.root else { return Ok(None) };
        if p.is_root() {
            return Ok(Some(root));
        }
        let mut cur = root;
        for i in 0..p.n_elem() {
            if cur.entry.is_link() {
                return Err(cur.entry.clone());
            }
            match cur.kids.get_mut(p.elem(i)) {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    /// Add or replace a leaf, enforcing the sequence-matching and
    /// kind-compatibility rules from `spec.md` §4.2.
    pub fn put(&mut self, p: &Parsed, entry: DirEntry) -> Result<DirEntry, DirError> {
        let assigned = self.put_node(p, entry, false)?;
        let off = self.wal.append(
            Request::Put,
            None,
            None,
            Some(assigned.clone()),
            assigned.sequence,
        )?;
        self.applied = off;
        self.hub.publish(Event {
            name: assigned.name.clone(),
            entry: Some(assigned.clone()),
            sequence: assigned.sequence,
            error: None,
        });
        Ok(assigned)
    }

    fn put_node(&mut self, p: &Parsed, mut entry: DirEntry, replaying: bool) -> Result<DirEntry, DirError> {
        entry.validate()?;

        if p.is_root() {
            let assigned_seq = match &self.root {
                None => seq::BASE,
                Some(existing) => bump_sequence(p, entry.sequence, existing.entry.sequence, replaying)?,
            };
            entry.sequence = assigned_seq;
            let mut node = Node::new(entry);
            if let Some(old) = self.root.take() {
                node.kids = old.kids;
            }
            node.dirty = true;
            self.root = Some(node);
            return Ok(self.root.as_ref().unwrap().entry.clone());
        }

        let Some(parent_path) = p.parent() else {
            return Err(DirError::new(Kind::Internal, p.path(), "non-root path has no parent"));
        };

        let leaf_name = p.last_elem().to_string();
        let assigned_seq = {
            let parent = match self.find_mut(&parent_path) {
                Ok(Some(n)) => n,
                Ok(None) => {
                    return Err(DirError::new(Kind::NotExist, parent_path.path(), "parent does not exist"))
                }
                Err(link) => {
                    return Err(DirError::new(Kind::Internal, link.name.as_str(), "parent path crosses a link"))
                }
            };
            if !parent.entry.is_dir() {
                return Err(DirError::new(Kind::NotDir, parent_path.path(), "parent is not a directory"));
            }
            match parent.kids.get(&leaf_name) {
                None => {
                    if entry.sequence == seq::NOT_EXIST || entry.sequence == seq::IGNORE {
                        seq::BASE
                    } else {
                        return Err(DirError::new(Kind::Exist, p.path(), "path does not exist yet"));
                    }
                }
                Some(existing) => {
                    if existing.entry.is_dir() != entry.is_dir() {
                        let kind = if existing.entry.is_dir() { Kind::IsDir } else { Kind::NotDir };
                        return Err(DirError::new(kind, p.path(), "overwrite changes directory-ness"));
                    }
                    bump_sequence(p, entry.sequence, existing.entry.sequence, replaying)?
                }
            }
        };
        entry.sequence = assigned_seq;

        let parent = self.find_mut(&parent_path).ok().flatten().expect("validated above");
        let mut node = Node::new(entry);
        if let Some(old) = parent.kids.remove(&leaf_name) {
            node.kids = old.kids;
        }
        node.dirty = true;
        let assigned = node.entry.clone();
        parent.kids.insert(leaf_name, node);
        parent.dirty = true;
        self.mark_path_dirty(&parent_path);

        Ok(assigned)
    }

    fn mark_path_dirty(&mut self, p: &Parsed) {
        let mut cur = p.clone();
        loop {
            if let Ok(Some(node)) = self.find_mut(&cur) {
                node.dirty = true;
            }
            match cur.parent() {
                Some(parent) => cur = parent,
                None => break,
            }
        }
    }

    /// Remove a leaf, refusing non-empty directories.
    pub fn delete(&mut self, p: &Parsed) -> Result<DirEntry, DirError> {
        let removed = self.delete_node(p)?;
        let off = self
            .wal
            .append(Request::Delete, Some(p.path()), None, None, removed.sequence)?;
        self.applied = off;
        self.hub.publish(Event {
            name: p.path(),
            entry: None,
            sequence: removed.sequence,
            error: Some(MarshalledError {
                kind: Kind::NotExist,
                message: "deleted".into(),
            }),
        });
        Ok(removed)
    }

    fn delete_node(&mut self, p: &Parsed) -> Result<DirEntry, DirError> {
        if p.is_root() {
            let Some(node) = self.root.take() else {
                return Err(DirError::new(Kind::NotExist, p.path(), "no such path"));
            };
            if !node.kids.is_empty() {
                self.root = Some(node);
                return Err(DirError::new(Kind::NotEmpty, p.path(), "root directory is not empty"));
            }
            return Ok(node.entry);
        }

        let Some(parent_path) = p.parent() else {
            return Err(DirError::new(Kind::Internal, p.path(), "non-root path has no parent"));
        };
        let leaf_name = p.last_elem().to_string();

        let parent = match self.find_mut(&parent_path) {
            Ok(Some(n)) => n,
            Ok(None) => return Err(DirError::new(Kind::NotExist, p.path(), "no such path")),
            Err(link) => return Err(DirError::new(Kind::Internal, link.name.as_str(), "parent path crosses a link")),
        };

        let Some(existing) = parent.kids.get(&leaf_name) else {
            return Err(DirError::new(Kind::NotExist, p.path(), "no such path"));
        };
        if existing.entry.is_dir() && !existing.kids.is_empty() {
            return Err(DirError::new(Kind::NotEmpty, p.path(), "directory is not empty"));
        }

        let removed = parent.kids.remove(&leaf_name).expect("checked above").entry;
        parent.dirty = true;
        self.mark_path_dirty(&parent_path);
        Ok(removed)
    }

    /// Pack dirty subtrees to the (simulated) `StoreServer` bottom-up,
    /// splitting each directory's children into ≤1 MiB blocks, then
    /// persist the new root and the log offset atomically.
    pub fn flush(&mut self) -> Result<(), DirError> {
        if let Some(root) = &mut self.root {
            flush_node(root);
        }
        let index = IndexFile {
            root: self.root.as_ref().map(|n| n.entry.clone()),
            offset: self.applied,
        };
        self.wal.write_index(&index)
    }

    /// Subscribe to events at or below `subtree` starting strictly after
    /// `since_sequence`. `since_sequence = -1` replays current state
    /// first, matching `spec.md` §4.2.
    pub fn watch(&self, subtree: &Parsed, since_sequence: i64) -> Subscription {
        let replay = if since_sequence == seq::IGNORE {
            self.collect_subtree(subtree)
        } else {
            Vec::new()
        };
        self.hub.subscribe(subtree.clone(), since_sequence, replay)
    }

    fn collect_subtree(&self, subtree: &Parsed) -> Vec<Event> {
        let mut events = Vec::new();
        if let Ok(Some(node)) = self.find(subtree) {
            collect(subtree, node, &mut events);
            events.sort_by_key(|e| e.sequence);
        }
        events
    }

    pub fn last_applied(&self) -> LogOffset {
        self.applied
    }
}

fn collect(path: &Parsed, node: &Node, out: &mut Vec<Event>) {
    out.push(Event {
        name: path.path(),
        entry: Some(node.entry.clone()),
        sequence: node.entry.sequence,
        error: None,
    });
    for (name, kid) in &node.kids {
        let child_path =
            Parsed::new(&format!("{}/{name}", path.path().trim_end_matches('/'))).unwrap_or_else(|_| path.clone());
        collect(&child_path, kid, out);
    }
}

fn bump_sequence(p: &Parsed, requested: i64, existing: i64, replaying: bool) -> Result<i64, DirError> {
    if replaying {
        return Ok(if requested < 0 { existing.max(seq::BASE) } else { requested });
    }
    match requested {
        seq::NOT_EXIST => Err(DirError::new(Kind::Exist, p.path(), "path already exists")),
        seq::IGNORE => Ok(existing + 1),
        s if s == existing => Ok(existing + 1),
        _ => Err(DirError::new(Kind::Invalid, p.path(), "sequence does not match current value")),
    }
}

/// Recursively flush dirty directories bottom-up, splitting their
/// marshalled children into size-bounded blocks the way
/// `PackfileWriter` accumulates blobs until the next one would overflow.
fn flush_node(node: &mut Node) {
    for kid in node.kids.values_mut() {
        flush_node(kid);
    }
    if !node.dirty || !node.entry.is_dir() {
        return;
    }

    let mut children: Vec<&DirEntry> = node.kids.values().map(|k| &k.entry).collect();
    children.sort_by(|a, b| a.name.cmp(&b.name));

    let mut blocks = Vec::new();
    let mut current = Vec::new();
    let mut current_size: u64 = 0;
    let mut offset: u64 = 0;

    for child in &children {
        let mut marshalled = Vec::new();
        if ciborium::into_writer(child, &mut marshalled).is_err() {
            continue;
        }
        let size = marshalled.len() as u64;
        if current_size > 0 && current_size + size > MAX_BLOCK_SIZE {
            blocks.push(close_block(&current, offset));
            offset += current_size;
            current.clear();
            current_size = 0;
        }
        current.extend_from_slice(&marshalled);
        current_size += size;
    }
    if current_size > 0 {
        blocks.push(close_block(&current, offset));
    }

    node.entry.blocks = blocks;
    node.entry.time = Timestamp::now();
    node.dirty = false;
}

fn close_block(data: &[u8], offset: u64) -> Block {
    Block {
        location: Location {
            endpoint: "local".into(),
            reference: format!("inline:{}", data.len()),
        },
        offset,
        size: data.len() as u64,
        packdata: data.to_vec(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::DirEntry;
    use camino::Utf8Path;
    use tempfile::tempdir;

    fn open_tree(user: &str, dir: &camino::Utf8Path) -> Tree {
        let wal = Wal::open(&dir.join(user), 1 << 20).unwrap();
        Tree::open(user, wal).unwrap()
    }

    #[test]
    fn put_root_then_child_then_lookup() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let mut tree = open_tree("ann@example.com", base);

        let root = DirEntry::new_directory(&Parsed::new("ann@example.com/").unwrap(), "ann@example.com");
        tree.put(&Parsed::new("ann@example.com/").unwrap(), root).unwrap();

        let child = DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com");
        let put_back = tree.put(&Parsed::new("ann@example.com/docs").unwrap(), child).unwrap();
        assert_eq!(put_back.sequence, seq::BASE);

        match tree.lookup(&Parsed::new("ann@example.com/docs").unwrap()) {
            Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
            _ => panic!("expected Ok"),
        }
    }

    #[test]
    fn put_requires_parent_to_exist() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let mut tree = open_tree("ann@example.com", base);
        let child = DirEntry::new_directory(&Parsed::new("ann@example.com/docs/x").unwrap(), "ann@example.com");
        let err = tree
            .put(&Parsed::new("ann@example.com/docs/x").unwrap(), child)
            .unwrap_err();
        assert_eq!(err.kind, Kind::NotExist);
    }

    #[test]
    fn delete_non_empty_directory_fails() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let mut tree = open_tree("ann@example.com", base);
        tree.put(
            &Parsed::new("ann@example.com/").unwrap(),
            DirEntry::new_directory(&Parsed::new("ann@example.com/").unwrap(), "ann@example.com"),
        )
        .unwrap();
        tree.put(
            &Parsed::new("ann@example.com/docs").unwrap(),
            DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com"),
        )
        .unwrap();
        tree.put(
            &Parsed::new("ann@example.com/docs/a").unwrap(),
            DirEntry::new_directory(&Parsed::new("ann@example.com/docs/a").unwrap(), "ann@example.com"),
        )
        .unwrap();

        let err = tree.delete(&Parsed::new("ann@example.com/docs").unwrap()).unwrap_err();
        assert_eq!(err.kind, Kind::NotEmpty);
    }

    #[test]
    fn sequence_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let mut tree = open_tree("ann@example.com", base);
        tree.put(
            &Parsed::new("ann@example.com/").unwrap(),
            DirEntry::new_directory(&Parsed::new("ann@example.com/").unwrap(), "ann@example.com"),
        )
        .unwrap();
        let mut bad = DirEntry::new_directory(&Parsed::new("ann@example.com/").unwrap(), "ann@example.com");
        bad.sequence = 999;
        let err = tree
            .put(&Parsed::new("ann@example.com/").unwrap(), bad)
            .unwrap_err();
        assert_eq!(err.kind, Kind::Invalid);
    }

    #[test]
    fn tree_survives_reopen_via_replay() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        {
            let mut tree = open_tree("ann@example.com", base);
            tree.put(
                &Parsed::new("ann@example.com/").unwrap(),
                DirEntry::new_directory(&Parsed::new("ann@example.com/").unwrap(), "ann@example.com"),
            )
            .unwrap();
            tree.put(
                &Parsed::new("ann@example.com/docs").unwrap(),
                DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com"),
            )
            .unwrap();
        }
        let tree = open_tree("ann@example.com", base);
        match tree.lookup(&Parsed::new("ann@example.com/docs").unwrap()) {
            Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
            other => panic!("expected replayed entry, got {other:?}"),
        }
    }
}
