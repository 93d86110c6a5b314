//! Snapshot pseudo-users (`spec.md` §4.3.5): `u+snapshot@d` mirrors
//! `u@d`, read-only except for a distinguished control entry the real
//! owner can Put to trigger a fresh snapshot.
//!
//! `spec.md` §9 leaves "should snapshot trees support Watch?" an open
//! question, resolved as `NotSupported` for now
//! ([`DirServer::watch`](crate::dirserver::DirServer::watch)); the
//! [`SnapshotScheduler`] trait below is the inert hook a future periodic
//! scheduler would implement, grounded on `backpak::snapshot`'s
//! start/list/prune shape without a concrete timer driving it yet.

use crate::path::Parsed;

/// The basename of the control entry: `Put`-ing this path (with any
/// content) under a snapshot root tells the server to take a fresh
/// snapshot of the owner's live tree right now.
pub const TRIGGER_NAME: &str = "@take";

/// True if `p` is something the owner is allowed to mutate inside an
/// otherwise read-only snapshot tree: the root itself (so the tree can be
/// created in the first place) or the trigger control entry.
pub fn is_control_entry(p: &Parsed) -> bool {
    p.is_root() || (p.n_elem() == 1 && p.elem(0) == TRIGGER_NAME)
}

/// Render the dated subdirectory name a snapshot taken "now" would live
/// under, e.g. `2026-08-01/120000`. Kept separate from `jiff::Timestamp`
/// formatting calls elsewhere so the layout has one definition.
pub fn dated_subdir(now: jiff::Timestamp) -> String {
    let zoned = now.to_zoned(jiff::tz::TimeZone::UTC);
    format!(
        "{:04}-{:02}-{:02}/{:02}{:02}{:02}",
        zoned.year(),
        zoned.month(),
        zoned.day(),
        zoned.hour(),
        zoned.minute(),
        zoned.second()
    )
}

/// Hook for a future periodic snapshot scheduler (`spec.md` §9). Nothing
/// in this crate drives one today — snapshots are taken only by an
/// explicit Put of the trigger entry — but the trait documents the shape
/// a cron-like driver would need to implement against `DirServer`.
pub trait SnapshotScheduler {
    /// Take a snapshot of `owner`'s tree into today's dated subdirectory.
    /// Returns the path the snapshot was written under.
    fn take_snapshot(&self, owner: &str) -> Result<String, crate::error::DirError>;
}
