//! The bisection driver: filters the first probe's timeline down to
//! in-range, unfiltered candidates, then binary-searches over it, probing
//! at ever-tighter cutoffs and consulting the oracle after each, until a
//! single culprit publication remains.

use anyhow::Result;
use bisect_types::{Cutoff, FilterSpec, TimelineEvent};
use chrono::{DateTime, Utc};

use crate::oracle::Oracle;
use crate::probe::{run_probe, ProbeContext};

/// Runs one ordinary (non-timeline) probe at `cutoff`. Implemented for
/// real runs by [`RealProbeRunner`], which wraps a [`ProbeContext`]; tests
/// substitute a fake that never touches the filesystem or a subprocess,
/// so the search loop itself can be exercised against synthetic
/// scenarios without installing anything.
pub trait ProbeRunner {
    fn probe(&mut self, cutoff: Cutoff) -> Result<()>;
}

/// The production [`ProbeRunner`]: a real reinstall cycle via
/// [`crate::probe::run_probe`].
pub struct RealProbeRunner<'a> {
    pub ctx: &'a ProbeContext,
}

impl ProbeRunner for RealProbeRunner<'_> {
    fn probe(&mut self, cutoff: Cutoff) -> Result<()> {
        run_probe(self.ctx, cutoff, false)?;
        Ok(())
    }
}

/// The result of a completed search: the one publication identified as
/// having introduced the regression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectOutcome {
    pub culprit: TimelineEvent,
}

/// Reported before each probe so `--debug` can render the interval table
/// and the plain progress line can report estimated remaining steps.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub good_before_index: usize,
    pub bad_after_index: usize,
    pub try_index: usize,
    pub candidate: TimelineEvent,
    pub cutoff: Cutoff,
    pub remaining_steps: u32,
}

/// Filters a first-probe timeline down to candidates: strictly after
/// `good`, at or before `bad`, and passing the `only`/`ignore` filters.
///
/// An event matches an `only` filter iff it matches at least one entry;
/// if `only` is non-empty, everything else is dropped. An event matching
/// any `ignore` entry is dropped outright, `only` restrictions
/// notwithstanding — this is why a too-broad `--ignore` can hide the true
/// culprit; the tests assert this as intended behavior, not as something
/// desirable.
pub fn filter_candidates(
    timeline: Vec<TimelineEvent>,
    good: DateTime<Utc>,
    bad: DateTime<Utc>,
    only: &[FilterSpec],
    ignore: &[FilterSpec],
) -> Vec<TimelineEvent> {
    timeline
        .into_iter()
        .filter(|e| e.time > good && e.time <= bad)
        .filter(|e| {
            if only.is_empty() {
                true
            } else {
                only.iter().any(|f| f.matches(&e.package_name, &e.version))
            }
        })
        .filter(|e| !ignore.iter().any(|f| f.matches(&e.package_name, &e.version)))
        .collect()
}

/// Every distinct package name appearing in `timeline`, in first-seen
/// order. `bisect-cli` uses this to decide whether to interactively ask
/// the user for per-package exclusions — the prompt itself lives there
/// since it needs the interactive prompt library this crate doesn't
/// depend on.
pub fn distinct_package_names(timeline: &[TimelineEvent]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for event in timeline {
        if seen.insert(event.package_name.clone()) {
            names.push(event.package_name.clone());
        }
    }
    names
}

/// `ceil(log2(bad_after_index - good_before_index))`, the progress aid
/// reported before each probe. Zero when the interval already has one
/// candidate (no further probes are needed).
pub fn remaining_steps(good_before_index: usize, bad_after_index: usize) -> u32 {
    let span = bad_after_index.saturating_sub(good_before_index);
    if span == 0 {
        return 0;
    }
    (span as f64).log2().ceil() as u32
}

/// Renders the `--debug` interval table: one row per remaining candidate,
/// marking the current `[goodBefore, badAfter]` window and the probe
/// about to run.
pub fn render_interval_table(
    timeline: &[TimelineEvent],
    good_before_index: usize,
    bad_after_index: usize,
    try_index: Option<usize>,
) -> String {
    let mut out = String::new();
    out.push_str("idx  package           version      published            state\n");
    for (idx, event) in timeline.iter().enumerate() {
        let state = if idx < good_before_index || idx > bad_after_index {
            "excluded"
        } else if Some(idx) == try_index {
            "probing"
        } else if idx == good_before_index {
            "good-before"
        } else if idx == bad_after_index {
            "bad-after"
        } else {
            "candidate"
        };
        out.push_str(&format!(
            "{:<4} {:<17} {:<12} {:<20} {}\n",
            idx,
            event.package_name,
            event.version,
            event.time.to_rfc3339(),
            state
        ));
    }
    out
}

/// Runs the search loop over an already-filtered, non-empty `timeline`,
/// reporting each step through `on_step` before probing. Returns the
/// single surviving candidate once `bad_after_index == good_before_index`.
///
/// A probe install failure bubbles straight out of this function: it is
/// never converted into an oracle "does not work" answer.
pub fn run_search(
    runner: &mut dyn ProbeRunner,
    timeline: Vec<TimelineEvent>,
    oracle: &mut dyn Oracle,
    mut on_step: impl FnMut(&StepReport),
) -> Result<BisectOutcome> {
    assert!(!timeline.is_empty(), "caller must filter out the empty case first");

    let mut good_before_index = 0usize;
    let mut bad_after_index = timeline.len() - 1;

    while bad_after_index > good_before_index {
        let try_index = (good_before_index + bad_after_index + 1) / 2;
        let candidate = timeline[try_index].clone();
        let cutoff = Cutoff::just_before(candidate.time);
        let remaining = remaining_steps(good_before_index, bad_after_index);

        on_step(&StepReport {
            good_before_index,
            bad_after_index,
            try_index,
            candidate: candidate.clone(),
            cutoff,
            remaining_steps: remaining,
        });

        runner.probe(cutoff)?;
        let works = oracle.works(&candidate)?;

        if works {
            good_before_index = try_index;
        } else {
            bad_after_index = try_index - 1;
        }
    }

    Ok(BisectOutcome {
        culprit: timeline[good_before_index].clone(),
    })
}
