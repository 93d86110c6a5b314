//! Canonical Upspin path names: `user@domain/elem1/.../elemN`.
//!
//! Parsing lives here rather than as methods on a bigger type because
//! nearly every verb in [`dirserver`](crate::dirserver) needs to walk a
//! path's elements without re-deriving them from the raw string each time.

use crate::error::{DirError, Kind};

/// A path that has been split into its user and elements, with no empty
/// elements, no `.`/`..`, and no trailing slash except a bare root.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Parsed {
    user: String,
    elems: Vec<String>,
}

impl Parsed {
    /// Parse and validate a path name, per `spec.md` §3's cleanliness rules.
    pub fn new(name: &str) -> Result<Self, DirError> {
        let (user, rest) = name.split_once('/').ok_or_else(|| {
            DirError::new(Kind::Invalid, name, "missing '/' after user name")
        })?;

        validate_user(user, name)?;

        let mut elems = Vec::new();
        for elem in rest.split('/') {
            match elem {
                "" => continue, // collapse repeated/trailing slashes, but...
                "." | ".." => {
                    return Err(DirError::new(
                        Kind::Invalid,
                        name,
                        format!("path element {elem:?} is not allowed"),
                    ));
                }
                e => elems.push(e.to_string()),
            }
        }

        Ok(Self {
            user: user.to_string(),
            elems,
        })
    }

    /// Build a root `Parsed` for `user`.
    pub fn root(user: &str) -> Result<Self, DirError> {
        validate_user(user, user)?;
        Ok(Self {
            user: user.to_string(),
            elems: Vec::new(),
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn n_elem(&self) -> usize {
        self.elems.len()
    }

    pub fn elem(&self, i: usize) -> &str {
        &self.elems[i]
    }

    pub fn is_root(&self) -> bool {
        self.elems.is_empty()
    }

    /// The first `n` elements, as a new (shorter) path.
    pub fn first(&self, n: usize) -> Self {
        Self {
            user: self.user.clone(),
            elems: self.elems[..n.min(self.elems.len())].to_vec(),
        }
    }

    /// Drop the first `n` elements, keeping the same user.
    pub fn drop(&self, n: usize) -> Self {
        let n = n.min(self.elems.len());
        Self {
            user: self.user.clone(),
            elems: self.elems[n..].to_vec(),
        }
    }

    /// The last element's name, or the bare user root string if this is root.
    pub fn last_elem(&self) -> &str {
        self.elems.last().map(String::as_str).unwrap_or("")
    }

    /// The parent path, or `None` if this is already the root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            None
        } else {
            Some(self.first(self.elems.len() - 1))
        }
    }

    /// Render back into the canonical `user@domain/a/b/c` string.
    pub fn path(&self) -> String {
        if self.elems.is_empty() {
            format!("{}/", self.user)
        } else {
            format!("{}/{}", self.user, self.elems.join("/"))
        }
    }

    /// Is `self` within (or equal to) the subtree rooted at `other`?
    pub fn has_prefix(&self, other: &Parsed) -> bool {
        self.user == other.user
            && self.elems.len() >= other.elems.len()
            && self.elems[..other.elems.len()] == other.elems[..]
    }
}

impl std::fmt::Display for Parsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

fn validate_user(user: &str, whole: &str) -> Result<(), DirError> {
    if user.is_empty() || !user.contains('@') {
        return Err(DirError::new(
            Kind::Invalid,
            whole,
            format!("{user:?} is not a valid user name"),
        ));
    }
    Ok(())
}

/// True if `user` names a `+snapshot` pseudo-user (`spec.md` §4.3.5), e.g.
/// `ann+snapshot@example.com`.
pub fn is_snapshot_user(user: &str) -> bool {
    user.split_once('@')
        .map(|(local, _)| local.contains("+snapshot"))
        .unwrap_or(false)
}

/// The owning (non-snapshot) user for a snapshot pseudo-user, or `user`
/// itself if it isn't one.
pub fn snapshot_owner(user: &str) -> String {
    match user.split_once('@') {
        Some((local, domain)) if local.contains("+snapshot") => {
            format!("{}@{}", local.replace("+snapshot", ""), domain)
        }
        _ => user.to_string(),
    }
}

/// The inverse of [`snapshot_owner`]: the `+snapshot` pseudo-user for a
/// regular `owner`, or `None` if `owner` isn't a valid `user@domain` name.
pub fn snapshot_user_for(owner: &str) -> Option<String> {
    owner.split_once('@').map(|(local, domain)| format!("{local}+snapshot@{domain}"))
}
