//! One full reinstall cycle: wipe the dependency tree, stand up a fresh
//! per-probe cache directory and intercept proxy, launch the package
//! manager, and guarantee both are torn down on every exit path —
//! including when the install itself fails.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bisect_process::{run_install, InstallRequest, ProbeCacheDir};
use bisect_proxy::Proxy;
use bisect_types::{sort_and_dedup_timeline, Cutoff, PackageManager, TimelineEvent};
use thiserror::Error;

/// A probe whose package manager exited non-zero. An install failure at a
/// given cutoff is a "cannot make a decision" signal, not a "does not
/// work" oracle answer — it is always fatal to the run.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{package_manager} install failed (exit: {status}) at cutoff {cutoff}")]
    InstallFailed {
        package_manager: PackageManager,
        status: std::process::ExitStatus,
        cutoff: Cutoff,
    },
}

/// Everything a probe needs that doesn't change between probes within one
/// bisection run.
pub struct ProbeContext {
    pub workspace_root: PathBuf,
    pub dependency_tree_dir: PathBuf,
    pub cache_root: PathBuf,
    pub registry_base: String,
    pub package_manager: PackageManager,
}

impl ProbeContext {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        dependency_tree_dir_name: &str,
        cache_root: impl Into<PathBuf>,
        registry_base: impl Into<String>,
        package_manager: PackageManager,
    ) -> Self {
        let workspace_root = workspace_root.into();
        let dependency_tree_dir = workspace_root.join(dependency_tree_dir_name);
        Self {
            workspace_root,
            dependency_tree_dir,
            cache_root: cache_root.into(),
            registry_base: registry_base.into(),
            package_manager,
        }
    }
}

/// Outcome of a probe that succeeded. `timeline` is populated only for
/// first-probe (timeline-collection) runs.
pub struct ProbeOutcome {
    pub timeline: Option<Vec<TimelineEvent>>,
}

/// Runs one reinstall cycle at `cutoff`. `compute_timeline` selects
/// first-probe mode, where the proxy's recorded timeline is returned
/// instead of discarded.
///
/// Every resource this function acquires — the cache directory, the proxy,
/// the child process — is released before it returns, on every path,
/// including when the package manager exits non-zero.
pub fn run_probe(ctx: &ProbeContext, cutoff: Cutoff, compute_timeline: bool) -> Result<ProbeOutcome> {
    bisect_process::clear_dependency_tree(&ctx.dependency_tree_dir).with_context(|| {
        format!(
            "failed to clear dependency tree at {}",
            ctx.dependency_tree_dir.display()
        )
    })?;

    let cache = ProbeCacheDir::create(&ctx.cache_root, cutoff)
        .context("failed to allocate a per-probe cache directory")?;

    let proxy = Proxy::start(ctx.registry_base.clone(), cutoff)
        .context("failed to start the intercept proxy")?;

    let proxy_url = proxy.local_url();
    let request = InstallRequest {
        package_manager: ctx.package_manager,
        workspace_root: &ctx.workspace_root,
        cache_dir: &cache,
        cutoff,
        proxy_url: &proxy_url,
        compute_timeline,
    };

    tracing::debug!(%cutoff, compute_timeline, "running probe");
    let install_result = run_install(&request);

    // The proxy and cache directory must come down whether the install
    // succeeded, failed, or errored launching at all; `cache` is dropped
    // at the end of this function regardless, and `proxy.stop()` runs
    // here on every branch.
    let outcome = match install_result {
        Ok(install) if install.success() => {
            let events = proxy.stop();
            Ok(events)
        }
        Ok(install) => {
            proxy.stop();
            return Err(ProbeError::InstallFailed {
                package_manager: ctx.package_manager,
                status: install.status,
                cutoff,
            }
            .into());
        }
        Err(e) => {
            proxy.stop();
            return Err(e.context("failed to run the package manager install"));
        }
    };

    let events = outcome?;
    let timeline = compute_timeline.then(|| sort_and_dedup_timeline(events));
    Ok(ProbeOutcome { timeline })
}

/// Resolves the cache root new per-probe directories are created under.
pub fn cache_root(override_dir: Option<&Path>) -> PathBuf {
    bisect_process::default_cache_root(override_dir)
}
