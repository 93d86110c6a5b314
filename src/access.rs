//! Parsing and evaluation of `Access` files (`spec.md` §3, §4.3.1).
//!
//! The parser is a small line-oriented format, not unlike the
//! `key: value, value` shape `backpak::config`'s TOML would produce if it
//! allowed repeated keys — but Access files are hand-edited by users, so we
//! parse them by hand rather than pulling in a config-file crate for a
//! format with exactly one level of nesting.

use std::collections::BTreeSet;

use crate::error::{DirError, Kind};
use crate::path::Parsed;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Right {
    Read,
    Write,
    Create,
    Delete,
    List,
    /// The union of every other right; used only to decide whether a path's
    /// existence may be disclosed (`spec.md` §4.3.1).
    AnyRight,
}

pub const ALL_RIGHTS: [Right; 5] = [
    Right::Read,
    Right::Write,
    Right::Create,
    Right::Delete,
    Right::List,
];

/// Either a plain user name or a reference to a Group file
/// (`user@domain/Group/name`).
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Grantee {
    User(String),
    Group(String),
}

/// A parsed `Access` file: for each right, the set of users/groups granted
/// it. A right with an empty set means nobody but the owner has it.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Access {
    pub owner: String,
    pub path: String,
    rights: [BTreeSet<Grantee>; 5],
}

fn right_index(r: Right) -> usize {
    match r {
        Right::Read => 0,
        Right::Write => 1,
        Right::Create => 2,
        Right::Delete => 3,
        Right::List => 4,
        Right::AnyRight => unreachable!("AnyRight has no dedicated bucket"),
    }
}

impl Access {
    /// The implicit Access used when no `Access` file governs a path:
    /// every right belongs to the owner alone (`spec.md` §4.3.1 step 1).
    pub fn implicit(owner: &str, path: &str) -> Self {
        Self {
            owner: owner.to_string(),
            path: path.to_string(),
            rights: Default::default(),
        }
    }

    /// Parse the text contents of an `Access` file found at `path`, owned
    /// by `owner` (the user whose tree it lives in).
    pub fn parse(owner: &str, path: &str, text: &str) -> Result<Self, DirError> {
        let mut access = Self::implicit(owner, path);

        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let (key, rest) = line.split_once(':').ok_or_else(|| {
                DirError::new(Kind::Invalid, path, format!("malformed Access line: {raw_line:?}"))
            })?;

            let right = parse_right(key.trim(), path)?;
            let grantees = rest
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(parse_grantee);

            if right == Right::AnyRight {
                for g in grantees {
                    for idx in 0..access.rights.len() {
                        access.rights[idx].insert(g.clone());
                    }
                }
            } else {
                access.rights[right_index(right)].extend(grantees);
            }
        }

        Ok(access)
    }

    /// Every grantee referenced anywhere in this file, including ones that
    /// name remote Group files a server must fetch to evaluate `can()`.
    pub fn referenced_groups(&self) -> impl Iterator<Item = &str> {
        self.rights
            .iter()
            .flatten()
            .filter_map(|g| match g {
                Grantee::Group(name) => Some(name.as_str()),
                Grantee::User(_) => None,
            })
    }

    /// Does `user` have `right` on the path this Access file governs?
    ///
    /// `load` re-enters the directory tree (without holding any lock the
    /// caller may be holding, per `spec.md` §4.3.1 step 2) to fetch and
    /// parse a referenced Group file's members.
    pub fn can(
        &self,
        user: &str,
        right: Right,
        load_group: &mut dyn FnMut(&str) -> Result<BTreeSet<String>, DirError>,
    ) -> Result<bool, DirError> {
        if user == self.owner {
            return Ok(true);
        }

        let rights_to_check: &[Right] = if right == Right::AnyRight {
            &ALL_RIGHTS
        } else {
            std::slice::from_ref(&right)
        };

        for r in rights_to_check {
            for grantee in &self.rights[right_index(*r)] {
                let matched = match grantee {
                    Grantee::User(u) => u == user || u == "*",
                    Grantee::Group(name) => load_group(name)?.contains(user),
                };
                if matched {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn parse_right(key: &str, path: &str) -> Result<Right, DirError> {
    match key.to_ascii_lowercase().as_str() {
        "read" => Ok(Right::Read),
        "write" => Ok(Right::Write),
        "create" => Ok(Right::Create),
        "delete" => Ok(Right::Delete),
        "list" => Ok(Right::List),
        "any" | "*" => Ok(Right::AnyRight),
        other => Err(DirError::new(
            Kind::Invalid,
            path,
            format!("unknown right {other:?} in Access file"),
        )),
    }
}

fn parse_grantee(s: &str) -> Grantee {
    // A group reference looks like a path: `owner@domain/Group/name`.
    // A plain user name never contains a second `/`.
    if let Some(idx) = s.find('/') {
        if s[idx..].contains("/Group/") || s.ends_with("/Group") {
            return Grantee::Group(s.to_string());
        }
    }
    Grantee::User(s.to_string())
}

/// The applicable Access file path for `target`: the nearest one found
/// walking from `target` up to the user root (`spec.md` §4.3.1 step 1).
/// Returns the sequence of candidate paths in search order; the caller
/// (`DirServer`) does the actual Lookup since this module doesn't touch
/// the Tree.
pub fn access_search_order(target: &Parsed) -> Vec<Parsed> {
    let mut candidates = Vec::new();
    let mut cur = target.clone();
    loop {
        let mut access_path = cur.clone();
        // Access files never govern themselves-as-a-directory; they're a
        // file named "Access" inside the directory being searched.
        access_path = access_path.first(access_path.n_elem());
        candidates.push(join(&access_path, "Access"));
        match cur.parent() {
            Some(p) => cur = p,
            None => break,
        }
    }
    candidates
}

fn join(dir: &Parsed, name: &str) -> Parsed {
    Parsed::new(&format!("{}/{name}", dir.path().trim_end_matches('/'))).expect("valid join")
}
