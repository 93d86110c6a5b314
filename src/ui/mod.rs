//! Subcommands for the local-driver CLI: each one exercises a single
//! `DirService` verb (or a `DirCache`-wrapped one) against an in-process
//! `DirServer`, the way `backpak::ui::*` wires one subcommand per backend
//! operation.

pub mod delete;
pub mod glob;
pub mod glob_many;
pub mod lookup;
pub mod lookup_cached;
pub mod put;
pub mod warm;
pub mod watch;
pub mod which_access;
