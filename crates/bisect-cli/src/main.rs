use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use bisect_config::Config as FileConfig;
use bisect_core::probe::{run_probe, ProbeContext};
use bisect_core::{
    distinct_package_names, filter_candidates, render_interval_table, run_search, CommandOracle,
    CulpritReport, Oracle, RealProbeRunner, NO_CANDIDATES_MESSAGE,
};
use bisect_types::{parse_instant, Cutoff, FilterSpec, PackageManager};
use chrono::{DateTime, Utc};
use clap::Parser;

mod oracle;

use oracle::PromptOracle;

const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org";

/// Binary-searches registry publications between a known-good and a
/// known-bad instant for the one that introduced a regression.
#[derive(Parser, Debug)]
#[command(name = "npm-bisect", version, about)]
struct Cli {
    /// Instant when the project last worked, e.g. `2020-01-01` or an RFC
    /// 3339 timestamp. Prompted if omitted.
    #[arg(long)]
    good: Option<String>,

    /// Instant when the project was first observed broken. Prompted if
    /// omitted.
    #[arg(long)]
    bad: Option<String>,

    /// Shell command whose exit code answers "does it work now?". Prompts
    /// interactively if omitted.
    #[arg(long)]
    run: Option<String>,

    /// Exclude publications matching `name` or `name@range` (repeatable).
    #[arg(long = "ignore")]
    ignore: Vec<String>,

    /// Restrict the search to publications matching `name` or
    /// `name@range` (repeatable); implicitly excludes everything else.
    #[arg(long = "only")]
    only: Vec<String>,

    /// Shorthand for `--package-manager yarn`.
    #[arg(long)]
    yarn: bool,

    /// Which package manager drives the install. Defaults to npm.
    #[arg(long = "package-manager")]
    package_manager: Option<PackageManager>,

    /// Upstream registry base URL.
    #[arg(long)]
    registry: Option<String>,

    /// Root directory new per-probe cache directories are created under.
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,

    /// Print the candidate list after the first probe and filtering, then
    /// exit without bisecting.
    #[arg(long)]
    candidates: bool,

    /// Print the interval table before each probe.
    #[arg(long)]
    debug: bool,

    /// Emit the final report (or candidate list) as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("info"),
        ))
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("[warn] failed to initialize logging: {e}");
    }

    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.yarn && cli.package_manager.is_some() {
        bail!("--yarn and --package-manager may not be given together");
    }

    let workspace_root = std::env::current_dir().context("failed to read current directory")?;

    let file_config = match bisect_config::find_config(&workspace_root) {
        Some(path) => bisect_config::load_config(path.parent().unwrap_or(&workspace_root))?,
        None => FileConfig::default(),
    };

    let cli_config = FileConfig {
        registry: cli.registry.clone(),
        package_manager: if cli.yarn {
            Some(PackageManager::Yarn)
        } else {
            cli.package_manager
        },
        ignore: cli.ignore.clone(),
        only: cli.only.clone(),
        run: cli.run.clone(),
        cache_dir: cli.cache_dir.clone(),
    };

    let config = file_config.merge_cli(&cli_config);

    let registry_base = config.registry.clone().unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
    let package_manager = config.package_manager.unwrap_or_default();

    let good = resolve_instant(
        cli.good.as_deref(),
        "good (last known working instant)",
        git_head_commit_time(&workspace_root),
    )?;
    let bad = resolve_instant(cli.bad.as_deref(), "bad (first known broken instant)", Some(Utc::now()))?;

    if good >= bad {
        bail!("--good ({good}) must be strictly before --bad ({bad})");
    }

    let only = parse_filters(&config.only).context("invalid --only filter")?;
    let ignore = parse_filters(&config.ignore).context("invalid --ignore filter")?;

    let cache_root = bisect_core::probe::cache_root(config.cache_dir.as_deref());
    let ctx = ProbeContext::new(
        &workspace_root,
        dependency_tree_dir_name(package_manager),
        cache_root,
        registry_base.clone(),
        package_manager,
    );

    tracing::info!(%good, %bad, %package_manager, registry = %registry_base, "probing at --good to collect the dependency timeline");
    let first_probe = run_probe(&ctx, Cutoff::new(good), true).context("first probe (collecting the timeline) failed")?;
    let timeline = first_probe.timeline.unwrap_or_default();

    let mut candidates = filter_candidates(timeline, good, bad, &only, &ignore);

    if only.is_empty() && ignore.is_empty() {
        let names = distinct_package_names(&candidates);
        if names.len() > 1 {
            let excluded = prompt_for_exclusions(&names)?;
            if !excluded.is_empty() {
                let extra_ignore: Vec<FilterSpec> = excluded
                    .iter()
                    .map(|name| FilterSpec::from_str(name))
                    .collect::<Result<_, _>>()
                    .context("failed to build filters from interactive exclusions")?;
                candidates.retain(|e| !extra_ignore.iter().any(|f| f.matches(&e.package_name, &e.version)));
            }
        }
    }

    if candidates.is_empty() {
        if cli.json {
            println!("{}", serde_json::json!({ "candidates": [] }));
        } else {
            println!("{NO_CANDIDATES_MESSAGE}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    if cli.candidates {
        print_candidates(&candidates, cli.json);
        return Ok(ExitCode::SUCCESS);
    }

    let mut oracle: Box<dyn Oracle> = match &config.run {
        Some(command) => Box::new(CommandOracle::new(command.clone())),
        None => Box::new(PromptOracle::new()),
    };

    let mut runner = RealProbeRunner { ctx: &ctx };
    let debug = cli.debug;
    let outcome = run_search(&mut runner, candidates.clone(), oracle.as_mut(), |step| {
        if debug {
            eprintln!(
                "{}",
                render_interval_table(&candidates, step.good_before_index, step.bad_after_index, Some(step.try_index))
            );
        } else {
            eprintln!(
                "probing cutoff {} (candidate {}@{}); ~{} step(s) remaining",
                step.cutoff, step.candidate.package_name, step.candidate.version, step.remaining_steps
            );
        }
    })?;

    let report = CulpritReport::new(&outcome.culprit, package_manager, &registry_base);
    if cli.json {
        println!("{}", report.to_json().context("failed to serialize report as JSON")?);
    } else {
        print!("{}", report.to_human());
    }

    Ok(ExitCode::SUCCESS)
}

fn dependency_tree_dir_name(package_manager: PackageManager) -> &'static str {
    match package_manager {
        PackageManager::Npm | PackageManager::Yarn | PackageManager::Pnpm => "node_modules",
    }
}

fn parse_filters(raw: &[String]) -> Result<Vec<FilterSpec>> {
    raw.iter().map(|s| FilterSpec::from_str(s).map_err(Into::into)).collect()
}

fn resolve_instant(cli_value: Option<&str>, label: &str, default: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
    if let Some(raw) = cli_value {
        return parse_instant(raw).with_context(|| format!("could not parse `{raw}` as a date-time"));
    }

    let mut input = dialoguer::Input::<String>::new().with_prompt(label);
    if let Some(d) = default {
        input = input.default(d.to_rfc3339());
    }
    let raw = input.interact_text().context("failed to read interactive input")?;
    parse_instant(&raw).with_context(|| format!("could not parse `{raw}` as a date-time"))
}

fn prompt_for_exclusions(names: &[String]) -> Result<Vec<String>> {
    let selections = dialoguer::MultiSelect::new()
        .with_prompt("Multiple packages were published in this range. Select any to exclude from the search")
        .items(names)
        .interact()
        .context("failed to read interactive selection")?;

    Ok(selections.into_iter().map(|i| names[i].clone()).collect())
}

fn print_candidates(candidates: &[bisect_types::TimelineEvent], json: bool) {
    if json {
        let values: Vec<_> = candidates
            .iter()
            .map(|e| serde_json::json!({ "package_name": e.package_name, "version": e.version, "time": e.time.to_rfc3339() }))
            .collect();
        println!("{}", serde_json::Value::Array(values));
        return;
    }

    for e in candidates {
        println!("{}@{} published at {}", e.package_name, e.version, e.time.to_rfc3339());
    }
}

/// Reads the current HEAD commit's author date, for pre-filling the
/// `--good` prompt's default. `None` when this
/// isn't a git repository or `git` isn't on PATH — the prompt then has no
/// default and the user must type an instant.
fn git_head_commit_time(workspace_root: &Path) -> Option<DateTime<Utc>> {
    let output = Command::new("git")
        .args(["log", "-1", "--format=%cI"])
        .current_dir(workspace_root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8(output.stdout).ok()?;
    parse_instant(raw.trim())
}
