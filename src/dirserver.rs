//! The authoritative directory service (`spec.md` §4.3): turns the six
//! RPC-shaped verbs into `Tree` operations after validating the path and
//! evaluating `Access`/`Group` policy.
//!
//! The per-user tree cache is grounded on `backpak::backend::CachedBackend`:
//! a bounded LRU behind a coarse mutex, populated lazily on first touch.
//! The fixed-size, hash-keyed lock pool guarding that population is
//! grounded on the same "index of small mutexes keyed by a hash" shape
//! `backpak`'s semaphored backend uses to bound concurrent fetches.
//!
//! `DirServer`'s state lives behind `Arc<Inner>` so the handle is cheaply
//! `Clone`, `'static`, and safe to hand to a background thread — needed by
//! `watch`'s per-event filtering stage, which re-checks access on its own
//! thread for the lifetime of a subscription.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};
use regex::Regex;
use rustc_hash::FxHasher;

use crate::access::{self, Access, Right};
use crate::entry::{seq, DirEntry};
use crate::error::{DirError, Kind, Outcome};
use crate::group;
use crate::path::{self, Parsed};
use crate::snapshot::SnapshotScheduler;
use crate::wal::Wal;
use crate::watch::Subscription;

const USER_LOCK_POOL_SIZE: usize = 97;
const DEFAULT_TREE_CAPACITY: usize = 256;
const DEFAULT_ACCESS_CAPACITY: usize = 512;
const DEFAULT_REMOTE_GROUP_CAPACITY: usize = 256;

/// A fixed pool of mutexes keyed by hash of the user name, used to
/// serialize the Absent→Loading transition for one user without a single
/// process-wide lock (`spec.md` §4.3/§5).
pub(crate) struct LockPool {
    locks: Vec<Mutex<()>>,
}

impl LockPool {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            locks: (0..n).map(|_| Mutex::new(())).collect(),
        }
    }

    pub(crate) fn lock_for(&self, user: &str) -> MutexGuard<'_, ()> {
        let mut hasher = FxHasher::default();
        user.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.locks.len();
        self.locks[idx].lock()
    }
}

/// Configuration a `DirServer` is constructed with (`spec.md` §6's
/// "Server options").
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub server_identity: String,
    pub log_dir: Utf8PathBuf,
    pub per_user_log_budget_bytes: u64,
    pub remote_group_ttl: Duration,
}

struct Inner {
    identity: String,
    log_dir: Utf8PathBuf,
    budget_bytes: u64,
    user_trees: Mutex<LruCache<String, Arc<Mutex<crate::tree::Tree>>>>,
    access_cache: Mutex<LruCache<(String, i64), Arc<Access>>>,
    default_access_cache: Mutex<LruCache<String, Arc<Access>>>,
    remote_groups: group::RemoteGroupCache,
    user_locks: LockPool,
}

#[derive(Clone)]
pub struct DirServer {
    inner: Arc<Inner>,
}

impl DirServer {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                identity: opts.server_identity,
                log_dir: opts.log_dir,
                budget_bytes: opts.per_user_log_budget_bytes,
                user_trees: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_TREE_CAPACITY).unwrap())),
                access_cache: Mutex::new(LruCache::new(NonZeroUsize::new(DEFAULT_ACCESS_CAPACITY).unwrap())),
                default_access_cache: Mutex::new(LruCache::new(NonZeroUsize::new(64).unwrap())),
                remote_groups: group::RemoteGroupCache::new(opts.remote_group_ttl, DEFAULT_REMOTE_GROUP_CAPACITY),
                user_locks: LockPool::new(USER_LOCK_POOL_SIZE),
            }),
        }
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    // --- per-user tree lifecycle (spec.md §4.3.4) --------------------------

    /// Absent -> Loading -> Active: find or create the tree for `user`,
    /// replaying its log if logs exist, otherwise starting empty only if
    /// `caller` is the owner (or an authorized snapshot owner).
    fn get_or_load_tree(&self, user: &str, caller: &str) -> Result<Arc<Mutex<crate::tree::Tree>>, DirError> {
        if let Some(tree) = self.inner.user_trees.lock().get(user) {
            crate::counters::bump(crate::counters::Op::TreeCacheHit);
            return Ok(tree.clone());
        }

        let _guard = self.inner.user_locks.lock_for(user);
        // Re-check: another caller may have populated it while we waited.
        if let Some(tree) = self.inner.user_trees.lock().get(user) {
            crate::counters::bump(crate::counters::Op::TreeCacheHit);
            return Ok(tree.clone());
        }
        crate::counters::bump(crate::counters::Op::TreeCacheMiss);

        let has_log = Wal::has_log(user, &self.inner.log_dir);
        let owner = if path::is_snapshot_user(user) {
            path::snapshot_owner(user)
        } else {
            user.to_string()
        };
        if !has_log && caller != owner && caller != user {
            return Err(DirError::new(Kind::NotExist, user, "user tree does not exist"));
        }

        let wal = Wal::open(&self.inner.log_dir.join(user), self.inner.budget_bytes)?;
        let tree = crate::tree::Tree::open(user, wal)?;
        let tree = Arc::new(Mutex::new(tree));
        // `push`, not `put`: capacity eviction here must flush the victim
        // exactly like an explicit `evict()` does (`spec.md` §4.3.4's
        // "LRU eviction -> Flush + close log -> Evicted"), or a
        // capacity-driven drop silently loses unflushed WAL state.
        let evicted = self.inner.user_trees.lock().push(user.to_string(), tree.clone());
        if let Some((evicted_user, evicted_tree)) = evicted {
            if evicted_user != user {
                crate::counters::bump(crate::counters::Op::TreeCacheEviction);
                evicted_tree.lock().flush()?;
            }
        }
        Ok(tree)
    }

    /// Flush and evict one user's tree (explicit Close, or LRU eviction).
    pub fn evict(&self, user: &str) -> Result<(), DirError> {
        let tree = self.inner.user_trees.lock().pop(user);
        if let Some(tree) = tree {
            crate::counters::bump(crate::counters::Op::TreeCacheEviction);
            tree.lock().flush()?;
        }
        Ok(())
    }

    /// Flush every resident tree; used at graceful shutdown (`spec.md` §5).
    pub fn flush_all(&self) -> Result<(), DirError> {
        let users: Vec<String> = self.inner.user_trees.lock().iter().map(|(u, _)| u.clone()).collect();
        for user in users {
            self.evict(&user)?;
        }
        Ok(())
    }

    // --- access evaluation (spec.md §4.3.1) --------------------------------

    /// The governing `Access` for `target`, found by walking up to the
    /// root; the implicit owner-only policy if none exists.
    fn access_for(&self, tree: &Mutex<crate::tree::Tree>, target: &Parsed) -> Result<Arc<Access>, DirError> {
        for candidate in access::access_search_order(target) {
            let found = {
                let guard = tree.lock();
                guard.lookup(&candidate)
            };
            match found {
                Outcome::Ok(entry) => {
                    let key = (entry.name.clone(), entry.sequence);
                    if let Some(cached) = self.inner.access_cache.lock().get(&key) {
                        crate::counters::bump(crate::counters::Op::AccessCacheHit);
                        return Ok(cached.clone());
                    }
                    crate::counters::bump(crate::counters::Op::AccessCacheMiss);
                    let text = String::from_utf8_lossy(&entry.packdata).into_owned();
                    let owner = path::snapshot_owner(candidate.user());
                    let parsed = Access::parse(&owner, &entry.name, &text)?;
                    let parsed = Arc::new(parsed);
                    self.inner.access_cache.lock().put(key, parsed.clone());
                    return Ok(parsed);
                }
                Outcome::Err(e) if e.kind == Kind::NotExist => continue,
                Outcome::Err(e) => return Err(e),
                Outcome::FollowLink(_) => continue,
            }
        }
        let owner = path::snapshot_owner(target.user());
        let path = target.path();
        if let Some(cached) = self.inner.default_access_cache.lock().get(&owner) {
            return Ok(cached.clone());
        }
        let implicit = Arc::new(Access::implicit(&owner, &path));
        self.inner.default_access_cache.lock().put(owner, implicit.clone());
        Ok(implicit)
    }

    /// Load a Group file's members, re-entering the tree it lives in
    /// (`spec.md` §4.3.1 step 2). Remote groups (a different user than
    /// `caller_tree_user`) go through the TTL cache.
    fn load_group(&self, caller_tree_user: &str, name: &str) -> Result<BTreeSet<String>, DirError> {
        let group_path = Parsed::new(name)?;
        if group_path.user() == caller_tree_user {
            let tree = self.get_or_load_tree(group_path.user(), group_path.user())?;
            return Ok(crate::group::parse_members(&self.read_group_text(&tree, &group_path)?));
        }

        let name = name.to_string();
        self.inner.remote_groups.get_or_fetch(&name, || {
            crate::counters::bump(crate::counters::Op::RemoteGroupFetch);
            let tree = self.get_or_load_tree(group_path.user(), group_path.user())?;
            self.read_group_text(&tree, &group_path)
        })
    }

    fn read_group_text(&self, tree: &Mutex<crate::tree::Tree>, p: &Parsed) -> Result<String, DirError> {
        let entry = tree.lock().lookup(p).into_result()?;
        Ok(String::from_utf8_lossy(&entry.packdata).into_owned())
    }

    fn can(&self, tree: &Mutex<crate::tree::Tree>, target: &Parsed, caller: &str, right: Right) -> Result<bool, DirError> {
        let owner = target.user().to_string();
        let access = self.access_for(tree, target)?;
        access.can(caller, right, &mut |group_name| self.load_group(&owner, group_name))
    }

    /// Enforce `right`, mapping "no right at all" to `Private` and "some
    /// right but not this one" to `Permission` (`spec.md` §4.3.1 step 3).
    fn require(&self, tree: &Mutex<crate::tree::Tree>, target: &Parsed, caller: &str, right: Right) -> Result<(), DirError> {
        if self.can(tree, target, caller, right)? {
            return Ok(());
        }
        if self.can(tree, target, caller, Right::AnyRight)? {
            Err(DirError::new(Kind::Permission, target.path(), "caller lacks the required right"))
        } else {
            Err(DirError::new(Kind::Private, target.path(), "caller has no right on this path"))
        }
    }

    // --- public verbs (spec.md §4.3, §6) -----------------------------------

    pub fn lookup(&self, caller: &str, name: &str) -> Outcome<DirEntry> {
        let p = match Parsed::new(name) {
            Ok(p) => p,
            Err(e) => return Outcome::Err(e),
        };
        let tree = match self.get_or_load_tree(p.user(), caller) {
            Ok(t) => t,
            Err(e) => return Outcome::Err(e),
        };

        match self.can(&tree, &p, caller, Right::Read) {
            Ok(true) => tree.lock().lookup(&p),
            Ok(false) => match self.can(&tree, &p, caller, Right::AnyRight) {
                Ok(true) => match tree.lock().lookup(&p) {
                    Outcome::Ok(e) => Outcome::Ok(e.to_incomplete()),
                    other => other,
                },
                Ok(false) => Outcome::err(Kind::Private, name, "caller has no right on this path"),
                Err(e) => Outcome::Err(e),
            },
            Err(e) => Outcome::Err(e),
        }
    }

    pub fn put(&self, caller: &str, entry: DirEntry) -> Result<DirEntry, DirError> {
        let p = Parsed::new(&entry.name)?;
        let tree = self.get_or_load_tree(p.user(), caller)?;

        let exists = matches!(tree.lock().lookup(&p), Outcome::Ok(_));
        let required = if exists { Right::Write } else { Right::Create };
        self.require(&tree, &p, caller, required)?;

        if path::is_snapshot_user(p.user()) && !crate::snapshot::is_control_entry(&p) {
            return Err(DirError::new(Kind::Permission, p.path(), "snapshot trees are read-only"));
        }

        let put = tree.lock().put(&p, entry)?;
        self.inner.access_cache.lock().clear();

        // The owner Put-ing the `@take` control entry is the trigger
        // itself (`spec.md` §4.3.5): mirror the live tree into a fresh
        // dated subdirectory now that the control entry has landed.
        if path::is_snapshot_user(p.user()) && p.n_elem() == 1 && p.elem(0) == crate::snapshot::TRIGGER_NAME {
            let owner = path::snapshot_owner(p.user());
            self.take_snapshot(&owner)?;
        }

        Ok(put.to_incomplete())
    }

    pub fn delete(&self, caller: &str, name: &str) -> Result<DirEntry, DirError> {
        let p = Parsed::new(name)?;
        let tree = self.get_or_load_tree(p.user(), caller)?;
        self.require(&tree, &p, caller, Right::Delete)?;
        if path::is_snapshot_user(p.user()) {
            return Err(DirError::new(Kind::Permission, p.path(), "snapshot trees are read-only"));
        }
        let result = tree.lock().delete(&p);
        result
    }

    pub fn which_access(&self, caller: &str, name: &str) -> Result<Option<DirEntry>, DirError> {
        let p = Parsed::new(name)?;
        let tree = self.get_or_load_tree(p.user(), caller)?;
        self.require(&tree, &p, caller, Right::AnyRight)?;

        for candidate in access::access_search_order(&p) {
            if let Outcome::Ok(entry) = tree.lock().lookup(&candidate) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// BFS shell-glob matching over the tree (`spec.md` §4.3.2).
    pub fn glob(&self, caller: &str, pattern: &str) -> Result<Vec<DirEntry>, DirError> {
        let p = Parsed::new(pattern)?;
        let tree = self.get_or_load_tree(p.user(), caller)?;

        let (prefix_len, pattern_elems) = split_at_first_metachar(&p);
        let mut frontier = vec![p.first(prefix_len)];

        for elem_pattern in pattern_elems {
            let re = glob_to_regex(elem_pattern)
                .map_err(|e| DirError::new(Kind::Invalid, elem_pattern, e))?;
            let mut next = Vec::new();
            for dir in &frontier {
                if self.can(&tree, dir, caller, Right::List).unwrap_or(false) {
                    let children = match tree.lock().list(dir) {
                        Ok(c) => c,
                        Err(_) => continue,
                    };
                    for child in children {
                        let base = child.name.rsplit('/').next().unwrap_or(&child.name);
                        if re.is_match(base) {
                            if let Ok(child_path) = Parsed::new(&child.name) {
                                next.push(child_path);
                            }
                        }
                    }
                }
            }
            frontier = next;
        }

        let mut results = Vec::new();
        for path in frontier {
            let entry = match tree.lock().lookup(&path) {
                Outcome::Ok(e) => e,
                Outcome::FollowLink(e) => e,
                Outcome::Err(_) => continue,
            };
            let has_read = self.can(&tree, &path, caller, Right::Read).unwrap_or(false);
            let is_control = entry.name.ends_with("/Access") || entry.name.contains("/Group/");
            results.push(if has_read || is_control { entry } else { entry.to_incomplete() });
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }

    /// `Watch(name, sinceSequence, done)`: rejected outright for snapshot
    /// pseudo-users (`spec.md` §4.3.5, §9 open question). Otherwise, the
    /// `Tree`'s raw event stream is wrapped in a per-event access check
    /// (`spec.md` §4.3.3): a background thread drops events whose subject
    /// path the caller no longer has `AnyRight` for, and strips
    /// `Blocks`/`Packdata` on ones it only has some lesser right to.
    pub fn watch(&self, caller: &str, name: &str, since_sequence: i64) -> Result<Subscription, DirError> {
        let p = Parsed::new(name)?;
        if path::is_snapshot_user(p.user()) {
            return Err(DirError::new(Kind::NotSupported, p.path(), "Watch is not supported on snapshot trees"));
        }
        let tree = self.get_or_load_tree(p.user(), caller)?;
        self.require(&tree, &p, caller, Right::AnyRight)?;
        let raw = tree.lock().watch(&p, since_sequence);
        Ok(self.filtered_subscription(raw, caller.to_string()))
    }

    /// Spawn the forwarding thread described above and return the
    /// caller-visible end of its output channel. `raw` (and the
    /// registration it holds in the `Tree`'s `WatchHub`) is dropped once
    /// this thread's `for` loop ends, which happens either when the
    /// caller drops the returned `Subscription` (closing `tx`, so `raw`'s
    /// sender-side sends start failing... actually the other direction:
    /// `tx.send` here fails once the caller drops their receiver) or when
    /// `raw.receiver.iter()` itself ends (hub-side disconnection).
    fn filtered_subscription(&self, raw: Subscription, caller: String) -> Subscription {
        let (tx, rx) = sync_channel(crate::watch::SUBSCRIBER_CAPACITY);
        let server = self.clone();
        thread::spawn(move || {
            for mut event in raw.receiver.iter() {
                let Ok(path) = Parsed::new(&event.name) else { continue };
                let tree = match server.get_or_load_tree(path.user(), &caller) {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                match server.can(&tree, &path, &caller, Right::AnyRight) {
                    Ok(true) => {}
                    _ => continue,
                }
                if !server.can(&tree, &path, &caller, Right::Read).unwrap_or(false) {
                    event.entry = event.entry.map(|e| e.to_incomplete());
                }
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        Subscription::detached(rx)
    }
}

impl SnapshotScheduler for DirServer {
    /// Mirror `owner`'s live tree into a fresh dated subdirectory under
    /// `owner`'s snapshot pseudo-user tree (`spec.md` §4.3.5).
    fn take_snapshot(&self, owner: &str) -> Result<String, DirError> {
        let snapshot_user = path::snapshot_user_for(owner)
            .ok_or_else(|| DirError::new(Kind::Invalid, owner, "not a valid user name"))?;
        let live_tree = self.get_or_load_tree(owner, owner)?;
        let snap_tree = self.get_or_load_tree(&snapshot_user, owner)?;

        let subdir = crate::snapshot::dated_subdir(jiff::Timestamp::now());
        let dest_root = Parsed::new(&format!("{snapshot_user}/{subdir}/"))?;
        self.ensure_dir(&snap_tree, &dest_root, owner)?;

        let live_root = Parsed::root(owner)?;
        self.mirror_subtree(&live_tree, &live_root, &snap_tree, &dest_root, owner)?;
        Ok(dest_root.path())
    }
}

impl DirServer {
    /// Create `p` (and, recursively, its ancestors) as an empty directory
    /// in `tree` if it doesn't already exist. `Tree::put_node` requires a
    /// parent to exist before a child can land in it, so intermediate
    /// directories have to be created top-down.
    fn ensure_dir(&self, tree: &Mutex<crate::tree::Tree>, p: &Parsed, writer: &str) -> Result<(), DirError> {
        if matches!(tree.lock().lookup(p), Outcome::Ok(_)) {
            return Ok(());
        }
        if let Some(parent) = p.parent() {
            self.ensure_dir(tree, &parent, writer)?;
        }
        let mut entry = DirEntry::new_directory(p, writer);
        // `IGNORE`, not the default `BASE`: a concurrent snapshot taken a
        // moment earlier may already have created this same dated
        // ancestor, and re-creating it must not be treated as a sequence
        // conflict (matches the convention `ui::put` uses for the same
        // reason).
        entry.sequence = seq::IGNORE;
        tree.lock().put(p, entry)?;
        Ok(())
    }

    /// Recursively copy the entry (and, if a directory, every descendant)
    /// at `src_path` in `src_tree` into the equivalent path under
    /// `dest_path` in `dest_tree`.
    fn mirror_subtree(
        &self,
        src_tree: &Mutex<crate::tree::Tree>,
        src_path: &Parsed,
        dest_tree: &Mutex<crate::tree::Tree>,
        dest_path: &Parsed,
        writer: &str,
    ) -> Result<(), DirError> {
        let entry = src_tree.lock().lookup(src_path).into_result()?;
        let mut copy = entry.clone();
        copy.name = dest_path.path();
        copy.signed_name = copy.name.clone();
        copy.sequence = seq::IGNORE;
        dest_tree.lock().put(dest_path, copy)?;

        if !entry.is_dir() {
            return Ok(());
        }
        for child in src_tree.lock().list(src_path)? {
            let Ok(child_path) = Parsed::new(&child.name) else { continue };
            let dest_child = Parsed::new(&format!(
                "{}/{}",
                dest_path.path().trim_end_matches('/'),
                child_path.last_elem()
            ))?;
            self.mirror_subtree(src_tree, &child_path, dest_tree, &dest_child, writer)?;
        }
        Ok(())
    }
}

/// The six verbs as a transport-neutral capability surface
/// (`spec.md` §6, §9's "dynamic dispatch over Packer/StoreServer/DirServer"
/// design note): [`DirCache`](crate::clog::DirCache) depends only on this
/// trait, never on `DirServer` directly, the way `backpak::ui::backup::run`
/// depends on the `Backend` trait rather than a concrete `fs::Backend`.
pub trait DirService: Send + Sync {
    fn lookup(&self, caller: &str, name: &str) -> Outcome<DirEntry>;
    fn put(&self, caller: &str, entry: DirEntry) -> Result<DirEntry, DirError>;
    fn delete(&self, caller: &str, name: &str) -> Result<DirEntry, DirError>;
    fn glob(&self, caller: &str, pattern: &str) -> Result<Vec<DirEntry>, DirError>;
    fn which_access(&self, caller: &str, name: &str) -> Result<Option<DirEntry>, DirError>;
    fn watch(&self, caller: &str, name: &str, since_sequence: i64) -> Result<Subscription, DirError>;
}

impl DirService for DirServer {
    fn lookup(&self, caller: &str, name: &str) -> Outcome<DirEntry> {
        DirServer::lookup(self, caller, name)
    }
    fn put(&self, caller: &str, entry: DirEntry) -> Result<DirEntry, DirError> {
        DirServer::put(self, caller, entry)
    }
    fn delete(&self, caller: &str, name: &str) -> Result<DirEntry, DirError> {
        DirServer::delete(self, caller, name)
    }
    fn glob(&self, caller: &str, pattern: &str) -> Result<Vec<DirEntry>, DirError> {
        DirServer::glob(self, caller, pattern)
    }
    fn which_access(&self, caller: &str, name: &str) -> Result<Option<DirEntry>, DirError> {
        DirServer::which_access(self, caller, name)
    }
    fn watch(&self, caller: &str, name: &str, since_sequence: i64) -> Result<Subscription, DirError> {
        DirServer::watch(self, caller, name, since_sequence)
    }
}

/// Split a glob pattern at the first element containing a metacharacter;
/// returns the clean-prefix element count and the remaining pattern
/// elements to match BFS-style (`spec.md` §4.3.2 step 1).
fn split_at_first_metachar(p: &Parsed) -> (usize, Vec<&str>) {
    for i in 0..p.n_elem() {
        if has_metachar(p.elem(i)) {
            return (i, (i..p.n_elem()).map(|j| p.elem(j)).collect());
        }
    }
    (p.n_elem(), Vec::new())
}

fn has_metachar(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Translate one Upspin glob element (`*`, `?`, `[set]`, no escaping,
/// `spec.md` §6) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '[' => {
                out.push('[');
                while let Some(&next) = chars.peek() {
                    chars.next();
                    out.push(next);
                    if next == ']' {
                        break;
                    }
                }
            }
            _ => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|e| e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::{seq, Attr};
    use camino::Utf8Path;
    use std::time::Duration as StdDuration;
    use tempfile::tempdir;

    fn options(dir: &camino::Utf8Path) -> ServerOptions {
        ServerOptions {
            server_identity: "dir.example.com".into(),
            log_dir: dir.to_owned(),
            per_user_log_budget_bytes: 1 << 20,
            remote_group_ttl: Duration::from_secs(60),
        }
    }

    fn make_root(user: &str) -> DirEntry {
        DirEntry::new_directory(&Parsed::new(&format!("{user}/")).unwrap(), user)
    }

    #[test]
    fn owner_can_put_and_lookup_own_tree() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));

        server.put("ann@example.com", make_root("ann@example.com")).unwrap();
        let mut child = make_root("ann@example.com");
        child.name = "ann@example.com/docs".into();
        child.signed_name = child.name.clone();
        server.put("ann@example.com", child).unwrap();

        match server.lookup("ann@example.com", "ann@example.com/docs") {
            Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn stranger_without_any_right_gets_private() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));
        server.put("ann@example.com", make_root("ann@example.com")).unwrap();

        match server.lookup("mallory@example.com", "ann@example.com/") {
            Outcome::Err(e) => assert_eq!(e.kind, Kind::Private),
            other => panic!("expected Private, got {other:?}"),
        }
    }

    #[test]
    fn access_file_grants_list_to_others() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));
        server.put("ann@example.com", make_root("ann@example.com")).unwrap();

        let mut access_entry = make_root("ann@example.com");
        access_entry.attr = Attr::None;
        access_entry.name = "ann@example.com/Access".into();
        access_entry.signed_name = access_entry.name.clone();
        access_entry.packdata = b"list: other@example.com\n".to_vec();
        server.put("ann@example.com", access_entry).unwrap();

        let mut doc = make_root("ann@example.com");
        doc.attr = Attr::None;
        doc.name = "ann@example.com/doc.txt".into();
        doc.signed_name = doc.name.clone();
        server.put("ann@example.com", doc).unwrap();

        let entries = server.glob("other@example.com", "ann@example.com/*").unwrap();
        assert!(entries.iter().any(|e| e.name == "ann@example.com/doc.txt"));
        assert!(entries.iter().all(|e| e.attr == Attr::Incomplete || e.name.ends_with("Access")));
    }

    #[test]
    fn glob_metachar_matches_and_sorts() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));
        server.put("ann@example.com", make_root("ann@example.com")).unwrap();
        let mut dir_entry = make_root("ann@example.com");
        dir_entry.name = "ann@example.com/dir".into();
        dir_entry.signed_name = dir_entry.name.clone();
        server.put("ann@example.com", dir_entry).unwrap();

        for leaf in ["subdir", "subway", "foo", "bar"] {
            let mut e = make_root("ann@example.com");
            e.name = format!("ann@example.com/dir/{leaf}");
            e.signed_name = e.name.clone();
            server.put("ann@example.com", e).unwrap();
        }

        let results = server.glob("ann@example.com", "ann@example.com/?ir/sub*").unwrap();
        let names: Vec<&str> = results.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ann@example.com/dir/subdir", "ann@example.com/dir/subway"]);
    }

    #[test]
    fn watch_rejected_for_snapshot_user() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));
        server
            .put("ann@example.com", make_root("ann+snapshot@example.com"))
            .unwrap();
        let err = server
            .watch("ann@example.com", "ann+snapshot@example.com/", seq::IGNORE)
            .unwrap_err();
        assert_eq!(err.kind, Kind::NotSupported);
    }

    #[test]
    fn watch_hides_events_the_caller_loses_any_right_to() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));
        server.put("ann@example.com", make_root("ann@example.com")).unwrap();

        let mut access_entry = make_root("ann@example.com");
        access_entry.attr = Attr::None;
        access_entry.name = "ann@example.com/Access".into();
        access_entry.signed_name = access_entry.name.clone();
        access_entry.packdata = b"list,read: other@example.com\n".to_vec();
        server.put("ann@example.com", access_entry.clone()).unwrap();

        let sub = server.watch("other@example.com", "ann@example.com/", seq::IGNORE).unwrap();

        let mut visible = make_root("ann@example.com");
        visible.name = "ann@example.com/shared.txt".into();
        visible.signed_name = visible.name.clone();
        server.put("ann@example.com", visible).unwrap();

        let event = sub.receiver.recv_timeout(StdDuration::from_secs(1)).unwrap();
        assert_eq!(event.name, "ann@example.com/shared.txt");

        // Tighten the Access file so `other@example.com` no longer has
        // any right at all, then mutate the tree again: the event for
        // that second Put must never reach the existing subscriber.
        let mut tightened = access_entry;
        tightened.sequence = seq::IGNORE;
        tightened.packdata = b"read: ann@example.com\n".to_vec();
        server.put("ann@example.com", tightened).unwrap();

        let mut hidden = make_root("ann@example.com");
        hidden.name = "ann@example.com/private.txt".into();
        hidden.signed_name = hidden.name.clone();
        server.put("ann@example.com", hidden).unwrap();

        // The Access-file change itself was visible (List, still held);
        // the subsequent Put of `private.txt` must not be.
        let next = sub.receiver.recv_timeout(StdDuration::from_secs(1)).unwrap();
        assert_eq!(next.name, "ann@example.com/Access");
        assert!(sub.receiver.recv_timeout(StdDuration::from_millis(200)).is_err());
    }

    #[test]
    fn snapshot_trigger_mirrors_the_live_tree() {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap();
        let server = DirServer::new(options(base));

        server.put("ann@example.com", make_root("ann@example.com")).unwrap();
        let mut doc = make_root("ann@example.com");
        doc.attr = Attr::None;
        doc.name = "ann@example.com/doc.txt".into();
        doc.signed_name = doc.name.clone();
        server.put("ann@example.com", doc).unwrap();

        server
            .put("ann@example.com", make_root("ann+snapshot@example.com"))
            .unwrap();

        let mut trigger = make_root("ann+snapshot@example.com");
        trigger.attr = Attr::None;
        trigger.name = "ann+snapshot@example.com/@take".into();
        trigger.signed_name = trigger.name.clone();
        server.put("ann@example.com", trigger).unwrap();

        let dated = server
            .glob("ann@example.com", "ann+snapshot@example.com/*/*")
            .unwrap()
            .into_iter()
            .find(|e| e.is_dir())
            .expect("expected a dated HHMMSS snapshot directory");

        let mirrored = server
            .lookup("ann@example.com", &format!("{}/doc.txt", dated.name))
            .into_result()
            .unwrap();
        assert_eq!(mirrored.name, format!("{}/doc.txt", dated.name));
    }
}
