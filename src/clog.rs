//! Client-side directory cache (`spec.md` §4.4): a bounded LRU of recent
//! `Lookup`/`Glob` results plus a watcher that keeps them fresh, backed
//! by its own on-disk log using the same record format as the
//! server-side WAL.
//!
//! The hash-keyed lock arenas guarding LRU mutation reuse
//! [`dirserver::LockPool`](crate::dirserver::LockPool) — the same
//! "fixed pool of mutexes keyed by a hash" shape `backpak`'s semaphored
//! backend uses to bound concurrent fetches without a single global lock.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use lru::LruCache;
use parking_lot::Mutex;

use crate::dirserver::{DirService, LockPool};
use crate::entry::{seq, DirEntry};
use crate::error::{DirError, Kind, Outcome};
use crate::path::Parsed;
use crate::wal::{MarshalledError, Record, Request, Wal};

const LRU_CAPACITY: usize = 4096;
const LOCK_ARENA_SIZE: usize = 255;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct ClogEntry {
    entry: Option<DirEntry>,
    not_exist: bool,
    children: BTreeSet<String>,
    complete: bool,
    /// Set by `wipeLog`: the entry is known stale but kept in place to
    /// record that this cache was interested in the path, so a resync
    /// can prioritize it instead of waiting for a cold miss to rediscover
    /// it (`spec.md` §4.4.1).
    obsolete: bool,
}

impl ClogEntry {
    fn hit(entry: DirEntry) -> Self {
        Self {
            entry: Some(entry),
            not_exist: false,
            children: BTreeSet::new(),
            complete: false,
            obsolete: false,
        }
    }

    fn missing() -> Self {
        Self {
            entry: None,
            not_exist: true,
            children: BTreeSet::new(),
            complete: false,
            obsolete: false,
        }
    }
}

/// `(name, isGlob)`, per `spec.md` §4.4's `lruKey`.
type LruKey = (String, bool);

/// Client-side proxy in front of a [`DirService`]. One `DirCache` serves
/// one local identity (`caller`); multiple identities need one cache each.
pub struct DirCache {
    upstream: Arc<dyn DirService>,
    caller: String,
    lru: Mutex<LruCache<LruKey, ClogEntry>>,
    sequence_lru: Mutex<LruCache<String, i64>>,
    path_locks: LockPool,
    glob_locks: LockPool,
    log: Mutex<Wal>,
    /// Users whose upstream returned `Kind::NotSupported` from `Watch`
    /// (`spec.md` §9 open question 3): the cache can never learn when
    /// their entries go stale, so it bypasses its LRU for them entirely
    /// rather than risk serving something that's since changed.
    watch_unsupported: Mutex<BTreeSet<String>>,
}

impl DirCache {
    /// Open (replaying) the on-disk clog at `log_dir`, per `spec.md`
    /// §4.4: "replay the log into the LRU, ignoring any file whose first
    /// record is not a matching Version."
    pub fn open(upstream: Arc<dyn DirService>, caller: &str, log_dir: &Utf8PathBuf, budget_bytes: u64) -> Result<Self, DirError> {
        let mut wal = Wal::open(log_dir, budget_bytes)?;

        let mut pending = Vec::new();
        wal.replay(crate::wal::LogOffset::ZERO, |r| pending.push(r.clone()))?;

        let cache = Self {
            upstream,
            caller: caller.to_string(),
            lru: Mutex::new(LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap())),
            sequence_lru: Mutex::new(LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap())),
            path_locks: LockPool::new(LOCK_ARENA_SIZE),
            glob_locks: LockPool::new(LOCK_ARENA_SIZE),
            log: Mutex::new(wal),
            watch_unsupported: Mutex::new(BTreeSet::new()),
        };
        for record in pending {
            cache.apply_replayed(record);
        }
        Ok(cache)
    }

    fn apply_replayed(&self, record: Record) {
        match record.request {
            Request::Put | Request::Lookup => {
                if let Some(entry) = record.entry {
                    self.sequence_lru.lock().put(entry.name.clone(), entry.sequence);
                    self.adopt_into_parent_glob(&entry.name, true);
                    self.lru.lock().put((entry.name.clone(), false), ClogEntry::hit(entry));
                } else if let Some(name) = record.name {
                    self.lru.lock().put((name, false), ClogEntry::missing());
                }
            }
            Request::Delete => {
                if let Some(name) = record.name {
                    self.sequence_lru.lock().put(name.clone(), record.sequence);
                    self.adopt_into_parent_glob(&name, false);
                    self.lru.lock().put((name, false), ClogEntry::missing());
                }
            }
            Request::Glob => {
                if let (Some(name), Some(children)) = (record.name, record.children) {
                    let key = (name, true);
                    let mut guard = self.lru.lock();
                    let mut entry = guard.pop(&key).unwrap_or(ClogEntry {
                        entry: None,
                        not_exist: false,
                        children: BTreeSet::new(),
                        complete: false,
                        obsolete: false,
                    });
                    entry.children = children.into_iter().collect();
                    entry.complete = true;
                    guard.put(key, entry);
                }
            }
            Request::Obsolete => {
                if let Some(user) = record.name {
                    self.mark_obsolete_in_place(&user);
                }
            }
            _ => {}
        }
    }

    fn adopt_into_parent_glob(&self, name: &str, present: bool) {
        let Ok(p) = Parsed::new(name) else { return };
        let Some(parent) = p.parent() else { return };
        let basename = p.last_elem().to_string();
        let mut guard = self.lru.lock();
        if let Some(glob) = guard.get_mut(&(parent.path(), true)) {
            if present {
                glob.children.insert(basename);
            } else {
                glob.children.remove(&basename);
            }
        }
    }

    // --- operations (spec.md §4.4) -----------------------------------------

    fn user_of(name: &str) -> Option<String> {
        Parsed::new(name).ok().map(|p| p.user().to_string())
    }

    fn is_watch_unsupported(&self, name: &str) -> bool {
        Self::user_of(name).is_some_and(|user| self.watch_unsupported.lock().contains(&user))
    }

    /// Record that `user`'s upstream can't be watched, per §9 open
    /// question 3. Called once, from the dying watcher thread.
    pub(crate) fn mark_watch_unsupported(&self, user: &str) {
        self.watch_unsupported.lock().insert(user.to_string());
    }

    pub fn lookup(&self, name: &str) -> Outcome<DirEntry> {
        if self.is_watch_unsupported(name) {
            return self.upstream.lookup(&self.caller, name);
        }
        let _guard = self.path_locks.lock_for(name);

        if let Some(cached) = self.lru.lock().get(&(name.to_string(), false)) {
            if !cached.obsolete {
                crate::counters::bump(crate::counters::Op::ClogLookupHit);
                if cached.not_exist {
                    return Outcome::err(Kind::NotExist, name, "cached negative result");
                }
                if let Some(entry) = &cached.entry {
                    return Outcome::Ok(entry.clone());
                }
            }
        }

        if let Ok(p) = Parsed::new(name) {
            if let Some(parent) = p.parent() {
                let basename = p.last_elem().to_string();
                if let Some(glob) = self.lru.lock().get(&(parent.path(), true)) {
                    if glob.complete && !glob.obsolete && !glob.children.contains(&basename) {
                        crate::counters::bump(crate::counters::Op::ClogLookupHit);
                        return Outcome::err(Kind::NotExist, name, "absent from a complete cached glob");
                    }
                }
            }
        }

        crate::counters::bump(crate::counters::Op::ClogLookupMiss);
        let result = self.upstream.lookup(&self.caller, name);
        self.record_lookup(name, &result);
        result
    }

    fn record_lookup(&self, name: &str, result: &Outcome<DirEntry>) {
        match result {
            Outcome::Ok(entry) => {
                self.sequence_lru.lock().put(entry.name.clone(), entry.sequence);
                let _ = self.log.lock().append(Request::Lookup, None, None, Some(entry.clone()), entry.sequence);
                self.lru.lock().put((name.to_string(), false), ClogEntry::hit(entry.clone()));
            }
            Outcome::Err(e) if e.kind == Kind::NotExist => {
                let marshalled = MarshalledError::from(e);
                let _ = self
                    .log
                    .lock()
                    .append(Request::Lookup, Some(name.to_string()), Some(marshalled), None, seq::IGNORE);
                self.lru.lock().put((name.to_string(), false), ClogEntry::missing());
            }
            _ => {}
        }
    }

    /// Only patterns of the exact form `<clean>/*` are cacheable; anything
    /// else bypasses the cache entirely (`spec.md` §4.4).
    pub fn lookup_glob(&self, pattern: &str) -> Result<Vec<DirEntry>, DirError> {
        let Some(dir) = pattern.strip_suffix("/*") else {
            return self.upstream.glob(&self.caller, pattern);
        };
        if self.is_watch_unsupported(dir) {
            return self.upstream.glob(&self.caller, pattern);
        }
        let _guard = self.glob_locks.lock_for(dir);

        let cached_glob = self.lru.lock().get(&(dir.to_string(), true)).cloned();
        if let Some(glob) = cached_glob {
            if glob.complete && !glob.obsolete {
                let mut entries = Vec::new();
                let mut complete = true;
                for child in &glob.children {
                    let child_name = format!("{}/{child}", dir.trim_end_matches('/'));
                    match self.lru.lock().peek(&(child_name, false)).and_then(|c| c.entry.clone()) {
                        Some(e) => entries.push(e),
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if complete {
                    entries.sort_by(|a, b| a.name.cmp(&b.name));
                    crate::counters::bump(crate::counters::Op::ClogGlobHit);
                    return Ok(entries);
                }
            }
        }

        crate::counters::bump(crate::counters::Op::ClogGlobMiss);
        let entries = self.upstream.glob(&self.caller, pattern)?;
        let children: BTreeSet<String> = entries
            .iter()
            .map(|e| e.name.rsplit('/').next().unwrap_or(&e.name).to_string())
            .collect();
        let _ = self
            .log
            .lock()
            .append_glob_complete(dir.to_string(), children.iter().cloned().collect(), seq::IGNORE);

        let mut guard = self.lru.lock();
        guard.put(
            (dir.to_string(), true),
            ClogEntry {
                entry: None,
                not_exist: false,
                children,
                complete: true,
                obsolete: false,
            },
        );
        drop(guard);
        for entry in &entries {
            self.sequence_lru.lock().put(entry.name.clone(), entry.sequence);
            self.lru.lock().put((entry.name.clone(), false), ClogEntry::hit(entry.clone()));
        }
        Ok(entries)
    }

    pub fn put(&self, entry: DirEntry) -> Result<DirEntry, DirError> {
        let _guard = self.path_locks.lock_for(&entry.name);
        let put = self.upstream.put(&self.caller, entry)?;
        self.sequence_lru.lock().put(put.name.clone(), put.sequence);
        let _ = self.log.lock().append(Request::Put, None, None, Some(put.clone()), put.sequence);
        self.adopt_into_parent_glob(&put.name, true);
        self.lru.lock().put((put.name.clone(), false), ClogEntry::hit(put.clone()));
        Ok(put)
    }

    pub fn delete(&self, name: &str) -> Result<DirEntry, DirError> {
        let _guard = self.path_locks.lock_for(name);
        let removed = self.upstream.delete(&self.caller, name)?;
        self.sequence_lru.lock().put(name.to_string(), removed.sequence);
        let _ = self
            .log
            .lock()
            .append(Request::Delete, Some(name.to_string()), None, None, removed.sequence);
        self.adopt_into_parent_glob(name, false);
        self.lru.lock().put((name.to_string(), false), ClogEntry::missing());
        Ok(removed)
    }

    pub fn which_access(&self, name: &str) -> Result<Option<DirEntry>, DirError> {
        self.upstream.which_access(&self.caller, name)
    }

    /// Mark every LRU entry for `user` Obsolete in place ahead of a full
    /// resync (`spec.md` §4.4.1 Retrying: "wipeLog marks every LRU entry
    /// for that user as Obsolete"): entries stay present, so the cache
    /// still records that it was interested in those paths, but Obsolete
    /// entries are never served as a hit until the watcher's resync
    /// refreshes them. Durable across a restart via a `Request::Obsolete`
    /// record, so a crash right after a wipe doesn't silently resurrect
    /// stale entries as trustworthy.
    pub fn wipe(&self, user: &str) {
        self.mark_obsolete_in_place(user);
        let _ = self
            .log
            .lock()
            .append(Request::Obsolete, Some(user.to_string()), None, None, seq::IGNORE);
    }

    fn mark_obsolete_in_place(&self, user: &str) {
        let prefix = format!("{user}/");
        let mut guard = self.lru.lock();
        let keys: Vec<LruKey> = guard.iter().map(|(k, _)| k.clone()).collect();
        for key in keys {
            if key.0.starts_with(&prefix) || key.0 == *user {
                if let Some(entry) = guard.get_mut(&key) {
                    entry.obsolete = true;
                }
            }
        }
    }
}

/// `spec.md` §4.4.1: `Dialing -> Watching -> Retrying -> Dying`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WatcherState {
    Dialing,
    Watching,
    Retrying,
    Dying,
}

/// Per-user watcher: keeps one `DirCache`'s view of `user`'s tree fresh
/// by consuming the upstream's `Watch` event stream. Runs on its own
/// thread (`spec.md` §4.4's "dedicated watcher goroutine").
pub struct ProxiedDir {
    user: String,
    last_sequence: AtomicI64,
    die: Mutex<bool>,
}

impl ProxiedDir {
    pub fn new(user: &str) -> Arc<Self> {
        Arc::new(Self {
            user: user.to_string(),
            last_sequence: AtomicI64::new(seq::IGNORE),
            die: Mutex::new(false),
        })
    }

    pub fn die(&self) {
        *self.die.lock() = true;
    }

    fn is_dying(&self) -> bool {
        *self.die.lock()
    }

    /// Drive the state machine until told to die. Spawn this on its own
    /// thread; it blocks on the upstream's event channel.
    pub fn run(self: Arc<Self>, cache: Arc<DirCache>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if self.is_dying() {
                return;
            }

            let since = self.last_sequence.load(Ordering::SeqCst);
            let subscription = match cache.upstream.watch(&cache.caller, &format!("{}/", self.user), since) {
                Ok(s) => s,
                Err(e) if e.kind == Kind::NotSupported => {
                    // This upstream will never support Watch for this
                    // user: stop trying and make the cache bypass it.
                    cache.mark_watch_unsupported(&self.user);
                    return;
                }
                Err(e) => {
                    if e.kind == Kind::Invalid {
                        // Bad sequence: force a full resync.
                        self.last_sequence.store(seq::IGNORE, Ordering::SeqCst);
                        cache.wipe(&self.user);
                    }
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            backoff = INITIAL_BACKOFF;
            // Watching: apply events until the subscription ends or we're told to die.
            for event in subscription.receiver.iter() {
                if self.is_dying() {
                    return;
                }
                let already_seen = cache
                    .sequence_lru
                    .lock()
                    .get(&event.name)
                    .copied()
                    .unwrap_or(seq::IGNORE);
                if event.sequence <= already_seen {
                    continue;
                }
                cache.sequence_lru.lock().put(event.name.clone(), event.sequence);
                match event.entry {
                    Some(entry) => {
                        let _ = cache.log.lock().append(Request::Put, None, None, Some(entry.clone()), event.sequence);
                        cache.adopt_into_parent_glob(&entry.name, true);
                        cache.lru.lock().put((entry.name.clone(), false), ClogEntry::hit(entry));
                    }
                    None => {
                        let _ = cache.log.lock().append(
                            Request::Delete,
                            Some(event.name.clone()),
                            None,
                            None,
                            event.sequence,
                        );
                        cache.adopt_into_parent_glob(&event.name, false);
                        cache.lru.lock().put((event.name.clone(), false), ClogEntry::missing());
                    }
                }
                self.last_sequence.store(event.sequence, Ordering::SeqCst);
            }

            if self.is_dying() {
                return;
            }
            // Subscription ended without us dying: Retrying.
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::entry::DirEntry;
    use camino::Utf8Path;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeUpstream {
        entries: StdMutex<std::collections::HashMap<String, DirEntry>>,
    }

    impl DirService for FakeUpstream {
        fn lookup(&self, _caller: &str, name: &str) -> Outcome<DirEntry> {
            match self.entries.lock().unwrap().get(name) {
                Some(e) => Outcome::Ok(e.clone()),
                None => Outcome::err(Kind::NotExist, name, "no such path"),
            }
        }
        fn put(&self, _caller: &str, entry: DirEntry) -> Result<DirEntry, DirError> {
            self.entries.lock().unwrap().insert(entry.name.clone(), entry.clone());
            Ok(entry)
        }
        fn delete(&self, _caller: &str, name: &str) -> Result<DirEntry, DirError> {
            self.entries
                .lock()
                .unwrap()
                .remove(name)
                .ok_or_else(|| DirError::new(Kind::NotExist, name, "no such path"))
        }
        fn glob(&self, _caller: &str, _pattern: &str) -> Result<Vec<DirEntry>, DirError> {
            Ok(self.entries.lock().unwrap().values().cloned().collect())
        }
        fn which_access(&self, _caller: &str, _name: &str) -> Result<Option<DirEntry>, DirError> {
            Ok(None)
        }
        fn watch(&self, _caller: &str, name: &str, _since: i64) -> Result<crate::watch::Subscription, DirError> {
            Err(DirError::new(Kind::NotSupported, name, "fake upstream has no watch"))
        }
    }

    fn make_cache() -> (tempfile::TempDir, DirCache) {
        let dir = tempdir().unwrap();
        let base = Utf8Path::from_path(dir.path()).unwrap().join("cache");
        let upstream = Arc::new(FakeUpstream {
            entries: StdMutex::new(std::collections::HashMap::new()),
        });
        let cache = DirCache::open(upstream, "ann@example.com", &base, 1 << 20).unwrap();
        (dir, cache)
    }

    #[test]
    fn lookup_miss_then_hit_is_cached() {
        let (_tmp, cache) = make_cache();
        let entry = DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com");
        cache.put(entry.clone()).unwrap();

        match cache.lookup("ann@example.com/docs") {
            Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn watch_unsupported_user_bypasses_the_lru() {
        let (_tmp, cache) = make_cache();
        let entry = DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com");
        cache.put(entry.clone()).unwrap();
        assert!(matches!(cache.lookup("ann@example.com/docs"), Outcome::Ok(_)));

        cache.mark_watch_unsupported("ann@example.com");
        cache.upstream.delete(&cache.caller, "ann@example.com/docs").unwrap();

        // A live LRU entry still exists, but a bypassed user must never
        // consult it.
        match cache.lookup("ann@example.com/docs") {
            Outcome::Err(e) => assert_eq!(e.kind, Kind::NotExist),
            other => panic!("expected a fresh NotExist from upstream, got {other:?}"),
        }
    }

    #[test]
    fn negative_lookup_is_cached_without_hitting_upstream_again() {
        let (_tmp, cache) = make_cache();
        let first = cache.lookup("ann@example.com/nope");
        assert!(matches!(first, Outcome::Err(e) if e.kind == Kind::NotExist));
        let cached = cache.lru.lock().get(&("ann@example.com/nope".to_string(), false)).cloned();
        assert!(cached.unwrap().not_exist);
    }

    #[test]
    fn complete_glob_suppresses_lookup_of_absent_child() {
        let (_tmp, cache) = make_cache();
        let entry = DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com");
        cache.put(entry).unwrap();
        cache.lookup_glob("ann@example.com/*").unwrap();

        match cache.lookup("ann@example.com/missing") {
            Outcome::Err(e) => assert_eq!(e.kind, Kind::NotExist),
            other => panic!("expected NotExist, got {other:?}"),
        }
    }

    #[test]
    fn wipe_marks_entries_obsolete_without_dropping_them() {
        let (_tmp, cache) = make_cache();
        let entry = DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com");
        cache.put(entry).unwrap();
        assert!(matches!(cache.lookup("ann@example.com/docs"), Outcome::Ok(_)));

        cache.wipe("ann@example.com");

        // The entry is still present (interest retained)...
        let still_there = cache.lru.lock().get(&("ann@example.com/docs".to_string(), false)).cloned();
        assert!(still_there.unwrap().obsolete);
        // ...but is never served as a cache hit; a real miss goes upstream.
        match cache.lookup("ann@example.com/docs") {
            Outcome::Ok(e) => assert_eq!(e.name, "ann@example.com/docs"),
            other => panic!("expected a fresh lookup through upstream, got {other:?}"),
        }
    }

    #[test]
    fn delete_removes_from_parent_glob() {
        let (_tmp, cache) = make_cache();
        let entry = DirEntry::new_directory(&Parsed::new("ann@example.com/docs").unwrap(), "ann@example.com");
        cache.put(entry).unwrap();
        cache.lookup_glob("ann@example.com/*").unwrap();
        cache.delete("ann@example.com/docs").unwrap();

        let glob = cache.lru.lock().get(&("ann@example.com".to_string(), true)).cloned();
        if let Some(glob) = glob {
            assert!(!glob.children.contains("docs"));
        }
    }
}
