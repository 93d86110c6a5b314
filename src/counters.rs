//! Performance counters: count how many times we do various important
//! operations, dumped at shutdown the way `backpak::counters` dumps its
//! own `debug!` summary.

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use enum_map::{Enum, EnumMap};
use lazy_static::lazy_static;
use tracing::debug;

#[derive(Debug, Copy, Clone, Enum)]
pub enum Op {
    TreeCacheHit,
    TreeCacheMiss,
    TreeCacheEviction,
    AccessCacheHit,
    AccessCacheMiss,
    RemoteGroupFetch,
    ClogLookupHit,
    ClogLookupMiss,
    ClogGlobHit,
    ClogGlobMiss,
    WalRotation,
    WalTrim,
    WatchEventDropped,
}

lazy_static! {
    static ref COUNTER_MAP: EnumMap<Op, AtomicUsize> = EnumMap::default();
}

#[inline]
pub fn bump(which: Op) {
    add(which, 1);
}

pub fn add(to: Op, amount: usize) {
    COUNTER_MAP[to].fetch_add(amount, Ordering::Relaxed);
}

pub fn get(which: Op) -> usize {
    COUNTER_MAP[which].load(Ordering::Relaxed)
}

pub fn log_counts() {
    // We're probably calling this once at process exit.
    fence(Ordering::SeqCst);

    let counts = COUNTER_MAP
        .iter()
        .map(|(k, v)| (k, v.load(Ordering::Relaxed)))
        .filter(|(_k, v)| *v > 0)
        .collect::<Vec<_>>();

    if counts.is_empty() {
        return;
    }

    let opname = |op| match op {
        Op::TreeCacheHit => "tree cache hits",
        Op::TreeCacheMiss => "tree cache misses",
        Op::TreeCacheEviction => "tree cache evictions",
        Op::AccessCacheHit => "access cache hits",
        Op::AccessCacheMiss => "access cache misses",
        Op::RemoteGroupFetch => "remote group fetches",
        Op::ClogLookupHit => "client cache lookup hits",
        Op::ClogLookupMiss => "client cache lookup misses",
        Op::ClogGlobHit => "client cache glob hits",
        Op::ClogGlobMiss => "client cache glob misses",
        Op::WalRotation => "WAL rotations",
        Op::WalTrim => "WAL trims",
        Op::WatchEventDropped => "watch events dropped to a stalled subscriber",
    };

    debug!("Counters:");
    for (op, count) in &counts {
        debug!("{:6} {}", count, opname(*op));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bump_and_get_round_trip() {
        let before = get(Op::WalRotation);
        bump(Op::WalRotation);
        assert_eq!(get(Op::WalRotation), before + 1);
    }
}
