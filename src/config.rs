//! Process configuration: `~/.config/upspin-dir.toml`, loaded the way
//! `backpak::config` loads its own TOML file via the `home` crate, with
//! every field defaulted so a missing file is never an error.

use std::{fs, io};

use anyhow::{anyhow, Context, Result};
use byte_unit::Byte;
use camino::Utf8PathBuf;
use serde_derive::Deserialize;

fn default_log_dir() -> Utf8PathBuf {
    home::home_dir()
        .and_then(|p| Utf8PathBuf::try_from(p).ok())
        .map(|mut p| {
            p.extend([".local", "share", "upspin-dir", "logs"]);
            p
        })
        .unwrap_or_else(|| Utf8PathBuf::from("./upspin-dir-logs"))
}

fn default_log_budget() -> Byte {
    Byte::from_u64(64 * 1024 * 1024)
}

fn default_remote_group_ttl_secs() -> u64 {
    300
}

fn default_server_identity() -> String {
    "local@upspin-dir".to_string()
}

/// Server/cache-wide settings (`spec.md` §6's "Server options").
#[derive(Debug, Deserialize)]
pub struct Configuration {
    #[serde(default = "default_server_identity")]
    pub server_identity: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: Utf8PathBuf,
    /// Rotation/trim budget per user, `spec.md` §4.1.
    #[serde(default = "default_log_budget")]
    pub per_user_log_budget: Byte,
    /// TTL for the remote-group cache, `spec.md` §4.3.1 step 2.
    #[serde(default = "default_remote_group_ttl_secs")]
    pub remote_group_ttl_secs: u64,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            server_identity: default_server_identity(),
            log_dir: default_log_dir(),
            per_user_log_budget: default_log_budget(),
            remote_group_ttl_secs: default_remote_group_ttl_secs(),
        }
    }
}

pub fn load() -> Result<Configuration> {
    let mut confpath: Utf8PathBuf = home::home_dir()
        .ok_or_else(|| anyhow!("Can't find home directory"))?
        .try_into()
        .context("Home directory isn't UTF-8")?;
    confpath.extend([".config", "upspin-dir.toml"]);
    let s = match fs::read_to_string(&confpath) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {confpath}"))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {confpath}"))?;
    Ok(conf)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let c = Configuration::default();
        assert!(c.per_user_log_budget.as_u64() > 0);
        assert!(c.remote_group_ttl_secs > 0);
    }
}
