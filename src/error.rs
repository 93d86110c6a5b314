//! The closed set of error [`Kind`]s a [`DirService`](crate::dirserver) verb can return.
//!
//! Internal plumbing (WAL I/O, CBOR decoding, config loading) still uses
//! `anyhow::Result` with `.context()` the way the rest of this crate does;
//! `DirError` only shows up at the boundary where a caller over the wire
//! needs to match on *why* a verb failed, not just read a message.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// The closed set of failure kinds a verb may report.
///
/// This mirrors `spec.md` §7 exactly. `FollowLink` is deliberately absent:
/// it's control flow, not a failure, and is carried by [`Outcome`] instead.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Kind {
    /// Malformed name or bad argument.
    Invalid,
    /// No such path, for a caller allowed to know that.
    NotExist,
    /// Path already exists when creation was required.
    Exist,
    /// Expected a directory, found something else.
    IsDir,
    /// Expected a non-directory, found a directory.
    NotDir,
    /// Directory still has children.
    NotEmpty,
    /// Caller has some right on the path, but not this one.
    Permission,
    /// Caller has no right on the path at all; existence is hidden.
    Private,
    /// Underlying transport or disk failure.
    Io,
    /// Contract violation inside the core. A bug, not a user mistake.
    Internal,
    /// Operation is disabled for this class of path (e.g. Watch on a snapshot).
    NotSupported,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Invalid => "invalid",
            Kind::NotExist => "not exist",
            Kind::Exist => "exist",
            Kind::IsDir => "is a directory",
            Kind::NotDir => "not a directory",
            Kind::NotEmpty => "not empty",
            Kind::Permission => "permission denied",
            Kind::Private => "private",
            Kind::Io => "I/O error",
            Kind::Internal => "internal error",
            Kind::NotSupported => "not supported",
        };
        f.write_str(s)
    }
}

/// A typed, wire-marshallable error: a [`Kind`] plus the path it happened to
/// and a human-readable message.
#[derive(Debug, Error)]
#[error("{path}: {kind}: {message}")]
pub struct DirError {
    pub kind: Kind,
    pub path: PathBuf,
    pub message: String,
}

impl DirError {
    pub fn new(kind: Kind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type DirResult<T> = Result<T, DirError>;

/// A verb's result when link traversal can interrupt normal control flow.
///
/// `FollowLink` is not an error: a caller that sees it should resolve the
/// link and retry from the new path, per `spec.md` §9.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    FollowLink(crate::entry::DirEntry),
    Err(DirError),
}

impl<T> Outcome<T> {
    pub fn ok(v: T) -> Self {
        Outcome::Ok(v)
    }

    pub fn err(kind: Kind, path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Outcome::Err(DirError::new(kind, path, message))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    /// Convert into a plain `DirResult`, turning `FollowLink` into an error.
    /// Useful for callers that have already resolved links and just want
    /// a terminal answer.
    pub fn into_result(self) -> DirResult<T> {
        match self {
            Outcome::Ok(v) => Ok(v),
            Outcome::FollowLink(entry) => Err(DirError::new(
                Kind::Internal,
                entry.name.as_str(),
                "unresolved link reached a caller that can't follow it",
            )),
            Outcome::Err(e) => Err(e),
        }
    }
}

/// Map an anyhow I/O failure from the WAL or a remote store into the wire
/// `Kind::Io` bucket, per `spec.md` §7 propagation policy.
pub fn io_err(path: impl Into<PathBuf>, e: impl std::fmt::Display) -> DirError {
    DirError::new(Kind::Io, path, e.to_string())
}
