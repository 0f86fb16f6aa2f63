//! # bisect-process
//!
//! Per-probe resource lifecycle: a fresh cache directory, a wiped
//! dependency tree, and the package-manager child process itself. This is
//! the non-network half of one probe — the proxy collaborator
//! (`bisect-proxy`) is engaged and disengaged around the [`run_install`]
//! call by the driver in `bisect-core`, which owns the overall probe
//! sequence.
//!
//! Every resource here is scoped: a [`ProbeCacheDir`] removes itself on
//! drop (including on the error and panic paths — it is a thin
//! `tempfile::TempDir` wrapper), so a probe can never leak a cache
//! directory regardless of how it exits.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bisect_types::{Cutoff, PackageManager};

/// Environment variable the proxy reads its cutoff from.
pub const CUTOFF_ENV: &str = "NPM_BISECT_IGNORE_NEWER_THAN";

/// Environment variable signaling first-probe (timeline-collection) mode.
/// When set to a directory path, the proxy writes timeline fragments as
/// JSON files under that path.
pub const TIMELINE_ENV: &str = "NPM_BISECT_COMPUTE_TIMELINE";

/// A freshly created, exclusively owned cache directory for one probe.
/// The directory name embeds the cutoff so a leftover directory found
/// later (e.g. after a crash) is self-describing.
pub struct ProbeCacheDir {
    dir: tempfile::TempDir,
}

impl ProbeCacheDir {
    /// Creates a new per-probe cache directory under `root` (typically the
    /// system temp area, or `--cache-dir` if the user overrode it).
    pub fn create(root: &Path, cutoff: Cutoff) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create cache root {}", root.display()))?;

        let prefix = format!(
            "npm-bisect-{}-",
            cutoff.to_rfc3339().replace([':', '.'], "-")
        );

        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(root)
            .with_context(|| format!("failed to create probe cache dir under {}", root.display()))?;

        tracing::debug!(path = %dir.path().display(), "created probe cache dir");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Removes everything inside `dependency_tree_dir` (e.g. `node_modules`)
/// while preserving the directory itself. Missing directories are not an
/// error — there is nothing to wipe on a first run.
pub fn clear_dependency_tree(dependency_tree_dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dependency_tree_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| {
                format!("failed to read dependency tree dir {}", dependency_tree_dir.display())
            });
        }
    };

    for entry in entries {
        let entry = entry.with_context(|| {
            format!(
                "failed to read an entry of {}",
                dependency_tree_dir.display()
            )
        })?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;

        if file_type.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))?;
        }
    }

    Ok(())
}

/// The npm-config-style environment variable each package manager uses to
/// redirect its on-disk content cache.
fn cache_env_var(pm: PackageManager) -> &'static str {
    match pm {
        PackageManager::Npm => "npm_config_cache",
        PackageManager::Yarn => "YARN_CACHE_FOLDER",
        PackageManager::Pnpm => "npm_config_store_dir",
    }
}

/// The environment variable each package manager uses to override its
/// upstream registry base URL — this is how the package manager is pointed
/// at the proxy without ever touching its real configuration file.
fn registry_env_var(pm: PackageManager) -> &'static str {
    match pm {
        PackageManager::Npm | PackageManager::Pnpm => "npm_config_registry",
        PackageManager::Yarn => "YARN_REGISTRY",
    }
}

fn install_argv(pm: PackageManager) -> (&'static str, &'static [&'static str]) {
    match pm {
        PackageManager::Npm => ("npm", &["install", "--no-audit", "--no-fund"]),
        PackageManager::Yarn => ("yarn", &["install"]),
        PackageManager::Pnpm => ("pnpm", &["install"]),
    }
}

/// Everything a single install invocation needs beyond the argv itself.
pub struct InstallRequest<'a> {
    pub package_manager: PackageManager,
    pub workspace_root: &'a Path,
    pub cache_dir: &'a ProbeCacheDir,
    pub cutoff: Cutoff,
    /// Local URL the proxy is bound to, e.g. `http://127.0.0.1:54213`.
    pub proxy_url: &'a str,
    /// Whether this is a first probe. The timeline itself is accumulated
    /// in-process by the `bisect-proxy` instance this install runs under
    /// (not written out by the child and read back), since the proxy is a
    /// local-server collaborator in the same process rather than a hook
    /// injected into the package manager — but the truthy marker is still
    /// exported so any child-side tooling inspecting its own environment
    /// can tell a first probe apart from an ordinary one.
    pub compute_timeline: bool,
}

/// Outcome of running the package manager to completion.
pub struct InstallOutcome {
    pub status: ExitStatus,
    pub duration: Duration,
}

impl InstallOutcome {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Launches the package-manager install command with the cache directory
/// redirected, the cutoff exported for the proxy, and (for first probes)
/// the timeline truthy marker set. Standard input/output/error are
/// inherited so the user sees the install's own progress. This function
/// owns only the spawn-and-wait; cache directory and proxy lifecycle are
/// the caller's responsibility (see `bisect-core`).
pub fn run_install(req: &InstallRequest<'_>) -> Result<InstallOutcome> {
    let (program, args) = install_argv(req.package_manager);

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(req.workspace_root)
        .env(cache_env_var(req.package_manager), req.cache_dir.path())
        .env(registry_env_var(req.package_manager), req.proxy_url)
        .env(CUTOFF_ENV, req.cutoff.to_rfc3339())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    if req.compute_timeline {
        command.env(TIMELINE_ENV, "1");
    }

    let start = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to launch {program} {args:?}"))?;
    let status = child
        .wait()
        .with_context(|| format!("failed to wait on {program} {args:?}"))?;

    Ok(InstallOutcome {
        status,
        duration: start.elapsed(),
    })
}

/// Resolves the root directory new per-probe cache directories should be
/// created under: `--cache-dir` if given, else the system temp area.
pub fn default_cache_root(override_dir: Option<&Path>) -> PathBuf {
    override_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn clear_dependency_tree_removes_contents_but_keeps_the_directory() {
        let td = tempfile::tempdir().unwrap();
        let node_modules = td.path().join("node_modules");
        fs::create_dir_all(node_modules.join("left-pad")).unwrap();
        fs::write(node_modules.join("left-pad/index.js"), "module.exports = {}").unwrap();
        fs::write(node_modules.join(".package-lock.json"), "{}").unwrap();

        clear_dependency_tree(&node_modules).unwrap();

        assert!(node_modules.exists());
        assert_eq!(fs::read_dir(&node_modules).unwrap().count(), 0);
    }

    #[test]
    fn clear_dependency_tree_tolerates_a_missing_directory() {
        let td = tempfile::tempdir().unwrap();
        let missing = td.path().join("node_modules");
        assert!(clear_dependency_tree(&missing).is_ok());
    }

    #[test]
    fn probe_cache_dir_embeds_cutoff_and_cleans_up_on_drop() {
        let td = tempfile::tempdir().unwrap();
        let cutoff = Cutoff::new(chrono::DateTime::parse_from_rfc3339("2020-01-02T03:04:05Z").unwrap().with_timezone(&chrono::Utc));
        let path = {
            let cache = ProbeCacheDir::create(td.path(), cutoff).unwrap();
            let name = cache.path().file_name().unwrap().to_string_lossy().to_string();
            assert!(name.contains("2020-01-02"));
            cache.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn default_cache_root_prefers_the_override() {
        let td = tempfile::tempdir().unwrap();
        assert_eq!(default_cache_root(Some(td.path())), td.path());
        assert_eq!(default_cache_root(None), std::env::temp_dir());
    }
}
