//! `Group` files (`spec.md` §3): a flat list of member user names, plus a
//! bounded-TTL cache for *remote* groups (owned by a user other than the
//! one being evaluated), per `spec.md` §4.3.1 step 2.
//!
//! The TTL cache pairs a `parking_lot::Mutex` with an `lru::LruCache`,
//! same as the tree and access caches in `dirserver` — simpler than a
//! publish-side RCU since entries expire individually rather than all at
//! once.

use std::collections::BTreeSet;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{DirError, Kind};

/// Parse a Group file's text contents into the set of plain user names it
/// lists directly. Nested group references are left as-is (the string is
/// passed straight through); the caller re-resolves them with another
/// `load` call exactly like `Access::can` does, so cycles are bounded by
/// whatever recursion limit the caller enforces.
pub fn parse_members(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(|l| match l.find('#') {
            Some(i) => &l[..i],
            None => l,
        })
        .flat_map(|l| l.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

struct Entry {
    members: BTreeSet<String>,
    fetched_at: std::time::Instant,
}

/// Caches the *resolved membership* of remote Group files, each entry
/// expiring after `ttl` regardless of how often it's hit — a cache hit
/// does not reset the clock, because `spec.md` §4.3.1/§8 scenario 6 needs
/// membership changes (including revocations) to actually take effect.
pub struct RemoteGroupCache {
    ttl: Duration,
    entries: Mutex<LruCache<String, Entry>>,
}

impl RemoteGroupCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            entries: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Look up `name`, calling `fetch` (a re-entrant Lookup+read of the
    /// Group file) only on a miss or an expired entry.
    pub fn get_or_fetch(
        &self,
        name: &str,
        fetch: impl FnOnce() -> Result<String, DirError>,
    ) -> Result<BTreeSet<String>, DirError> {
        {
            let mut guard = self.entries.lock();
            if let Some(entry) = guard.get(name) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.members.clone());
                }
                // Expired: fall through and refetch below, but drop the
                // stale entry now so a fetch failure doesn't serve it.
                guard.pop(name);
            }
        }

        let text = fetch()?;
        let members = parse_members(&text);
        self.entries.lock().put(
            name.to_string(),
            Entry {
                members: members.clone(),
                fetched_at: std::time::Instant::now(),
            },
        );
        Ok(members)
    }

    pub fn invalidate(&self, name: &str) {
        self.entries.lock().pop(name);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    #[test]
    fn parses_comma_and_newline_separated_members() {
        let text = "ann@x.com, bob@x.com\n# a comment\ncarl@x.com\n";
        let members = parse_members(text);
        assert_eq!(members.len(), 3);
        assert!(members.contains("bob@x.com"));
    }

    #[test]
    fn caches_until_ttl_then_refetches() {
        let fetches = AtomicUsize::new(0);
        let cache = RemoteGroupCache::new(Duration::from_millis(50), 8);

        let do_fetch = || -> Result<String, DirError> {
            fetches.fetch_add(1, Ordering::SeqCst);
            Ok("ann@x.com".to_string())
        };

        let m1 = cache.get_or_fetch("friend@x.com/Group/family", do_fetch).unwrap();
        assert!(m1.contains("ann@x.com"));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        // Still warm: no refetch.
        cache.get_or_fetch("friend@x.com/Group/family", do_fetch).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(80));

        cache.get_or_fetch("friend@x.com/Group/family", do_fetch).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn invalidate_forces_refetch() {
        let cache = RemoteGroupCache::new(Duration::from_secs(60), 8);
        cache
            .get_or_fetch("g", || Ok("a@x.com".to_string()))
            .unwrap();
        assert_eq!(cache.len(), 1);
        cache.invalidate("g");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn expired_fetch_failure_does_not_resurrect_stale_entry() {
        let cache = RemoteGroupCache::new(Duration::from_millis(10), 8);
        cache.get_or_fetch("g", || Ok("a@x.com".to_string())).unwrap();
        sleep(Duration::from_millis(30));
        let err = cache.get_or_fetch("g", || {
            Err(DirError::new(Kind::Io, "g", "unreachable"))
        });
        assert!(err.is_err());
        assert_eq!(cache.len(), 0);
    }
}
