//! [`DirEntry`], the unit of metadata the whole core passes around.
//!
//! Framed the way `backpak::tree::Node`/`NodeContents` is: a plain `struct`
//! with `serde_derive` and CBOR on the wire (`ciborium`), not a hand-rolled
//! binary format.

use jiff::Timestamp;
use serde_derive::{Deserialize, Serialize};

use crate::error::{DirError, Kind};
use crate::path::Parsed;

/// A negative `Sequence` has a reserved meaning instead of naming a real
/// version.
pub mod seq {
    /// Ignore whatever sequence the path currently has; always succeeds
    /// sequence-wise.
    pub const IGNORE: i64 = -1;
    /// The path must not already exist.
    pub const NOT_EXIST: i64 = -2;
    /// The sequence assigned to a freshly created entry.
    pub const BASE: i64 = 0;
    /// Reject writes that would push a sequence at or above this value
    /// (open question in `spec.md` §9: wraparound is never observed in
    /// practice, so we simply refuse to approach it).
    pub const MAX: i64 = 1 << 62;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Attr {
    None,
    Directory,
    Link,
    /// Never valid on input; only ever produced by a server stripping
    /// Blocks/Packdata for a caller without Read.
    Incomplete,
}

/// External location of a stored block: which store, and what reference
/// within it. The store itself is out of this crate's scope.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub endpoint: String,
    pub reference: String,
}

/// One contiguous span of a file's content, stored as an opaque blob in
/// some `StoreServer`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub location: Location,
    pub offset: u64,
    pub size: u64,
    pub packdata: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub signed_name: String,
    pub attr: Attr,
    pub packing: u8,
    pub writer: String,
    pub sequence: i64,
    pub time: Timestamp,
    /// Only meaningful when `attr == Attr::Link`.
    pub link: Option<String>,
    pub blocks: Vec<Block>,
    pub packdata: Vec<u8>,
}

impl DirEntry {
    /// A fresh directory entry for `p`, owned by `writer`, not yet assigned
    /// to the tree (sequence is `seq::BASE`; callers doing a `Put` with an
    /// existing path should bump it themselves).
    pub fn new_directory(p: &Parsed, writer: &str) -> Self {
        let name = p.path();
        Self {
            signed_name: name.clone(),
            name,
            attr: Attr::Directory,
            packing: 0,
            writer: writer.to_string(),
            sequence: seq::BASE,
            time: Timestamp::now(),
            link: None,
            blocks: Vec::new(),
            packdata: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.attr == Attr::Directory
    }

    pub fn is_link(&self) -> bool {
        self.attr == Attr::Link
    }

    /// Total size covered by `blocks`.
    pub fn size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Strip `Blocks`/`Packdata` and mark `Incomplete`, for a caller who has
    /// some right on the entry but not `Read` (`spec.md` §4.3.1/§4.3.2).
    pub fn to_incomplete(&self) -> Self {
        let mut e = self.clone();
        if e.attr != Attr::Directory {
            e.attr = Attr::Incomplete;
        }
        e.blocks.clear();
        e.packdata.clear();
        e
    }

    /// Validate the fixed invariants from `spec.md` §3 that every accepted
    /// `Put` must satisfy. Cross-tree invariants (sequence matching,
    /// overwrite kind checks) are the Tree's job, not this entry's.
    pub fn validate(&self) -> Result<(), DirError> {
        if self.name != self.signed_name {
            return Err(DirError::new(
                Kind::Invalid,
                &self.name,
                "Name and SignedName must match on write",
            ));
        }
        if self.attr == Attr::Incomplete {
            return Err(DirError::new(
                Kind::Invalid,
                &self.name,
                "Incomplete entries are never accepted on input",
            ));
        }
        if matches!(self.attr, Attr::Directory | Attr::Link) && !self.blocks.is_empty() {
            return Err(DirError::new(
                Kind::Invalid,
                &self.name,
                "directories and links carry no Blocks",
            ));
        }
        if self.attr == Attr::Link {
            let target = self.link.as_deref().unwrap_or("");
            if Parsed::new(target).is_err() {
                return Err(DirError::new(
                    Kind::Invalid,
                    &self.name,
                    "link target is not a clean path",
                ));
            }
        } else if self.link.is_some() {
            return Err(DirError::new(
                Kind::Invalid,
                &self.name,
                "only links carry a Link target",
            ));
        }
        validate_block_coverage(&self.name, &self.blocks)?;
        if self.attr != Attr::Directory && self.writer.is_empty() {
            return Err(DirError::new(
                Kind::Invalid,
                &self.name,
                "non-directory entries must carry a Writer",
            ));
        }
        if self.sequence >= seq::MAX {
            return Err(DirError::new(
                Kind::Internal,
                &self.name,
                "sequence would overflow the reserved range",
            ));
        }
        Ok(())
    }
}

/// Blocks must form a contiguous, non-overlapping cover of `[0, size)`,
/// in order, per `spec.md` §3 and the §8 testable property.
fn validate_block_coverage(name: &str, blocks: &[Block]) -> Result<(), DirError> {
    let mut expected = 0u64;
    for b in blocks {
        if b.size == 0 {
            return Err(DirError::new(Kind::Invalid, name, "block has zero size"));
        }
        if b.offset != expected {
            return Err(DirError::new(
                Kind::Invalid,
                name,
                format!("block offset {} leaves a hole or overlap (expected {expected})", b.offset),
            ));
        }
        expected = expected
            .checked_add(b.size)
            .ok_or_else(|| DirError::new(Kind::Invalid, name, "block coverage overflows"))?;
    }
    Ok(())
}
