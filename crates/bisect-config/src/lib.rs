//! # bisect-config
//!
//! `.npm-bisect.toml` project config loading, merged with CLI flags. A
//! project can pin its registry, package manager, and habitual
//! `--ignore`/`--only` filters once instead of retyping them on every
//! invocation.
//!
//! Every CLI flag still works with no config file present — this crate
//! only supplies defaults that `bisect-cli` overrides with anything the
//! user passed explicitly.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bisect_types::PackageManager;
use serde::{Deserialize, Serialize};

/// Default configuration file name, read from the current directory.
pub const CONFIG_FILE: &str = ".npm-bisect.toml";

/// Project-level defaults for `npm-bisect`. Every field is optional: an
/// absent field means "let the CLI flag's own default decide."
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: Option<String>,

    #[serde(default)]
    pub package_manager: Option<PackageManager>,

    #[serde(default)]
    pub ignore: Vec<String>,

    #[serde(default)]
    pub only: Vec<String>,

    #[serde(default)]
    pub run: Option<String>,

    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Config {
    /// Overlays `cli` on top of `self`: any field the CLI side set wins;
    /// `ignore`/`only` are concatenated rather than replaced, since both
    /// the config file and the command line can legitimately contribute
    /// filter entries to the same run.
    pub fn merge_cli(&self, cli: &Config) -> Config {
        let mut ignore = self.ignore.clone();
        ignore.extend(cli.ignore.iter().cloned());

        let mut only = self.only.clone();
        only.extend(cli.only.iter().cloned());

        Config {
            registry: cli.registry.clone().or_else(|| self.registry.clone()),
            package_manager: cli.package_manager.or(self.package_manager),
            ignore,
            only,
            run: cli.run.clone().or_else(|| self.run.clone()),
            cache_dir: cli.cache_dir.clone().or_else(|| self.cache_dir.clone()),
        }
    }
}

/// The config file path for a directory, whether or not it exists.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

/// Loads `.npm-bisect.toml` from `dir` if present; an absent file yields
/// `Config::default()` rather than an error, since a config file is
/// strictly optional.
pub fn load_config(dir: &Path) -> Result<Config> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))
}

/// Walks up from `start_dir` looking for `.npm-bisect.toml`, stopping at
/// the first directory it finds one in.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut current = start_dir;
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        current = current.parent()?;
    }
}
