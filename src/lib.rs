//! A global, user-rooted directory namespace: per-user write-ahead logs,
//! an in-memory `Tree` mirroring each user's namespace, a `DirServer`
//! that turns six RPC-shaped verbs into `Tree` operations under
//! `Access`/`Group` policy, and a client-side `DirCache` that keeps a
//! bounded, watch-refreshed view of the server's state.
//!
//! See [`dirserver`] for the server entry point and [`clog`] for the
//! client-side cache that proxies it.

pub mod access;
pub mod clog;
pub mod config;
pub mod counters;
pub mod dirserver;
pub mod entry;
pub mod error;
pub mod file_util;
pub mod group;
pub mod path;
pub mod snapshot;
pub mod tree;
pub mod wal;
pub mod watch;

// CLI stuff:
pub mod ui;
