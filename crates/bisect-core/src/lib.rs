//! # bisect-core
//!
//! Composes [`bisect_process`] (cache directory + child lifecycle) and
//! [`bisect_proxy`] (the registry-rewriting intercept) into a single
//! probe, and drives the binary search over a project's dependency
//! timeline on top of that.
//!
//! `bisect-cli` is the only crate that should construct a [`probe::ProbeContext`]
//! and call [`driver::run_search`] directly; everything here is plain library
//! code with no argument parsing or terminal I/O of its own.

pub mod driver;
pub mod oracle;
pub mod probe;
pub mod report;

pub use driver::{
    distinct_package_names, filter_candidates, remaining_steps, render_interval_table, run_search,
    BisectOutcome, ProbeRunner, RealProbeRunner, StepReport,
};
pub use oracle::{CommandOracle, Oracle};
pub use probe::{ProbeContext, ProbeError, ProbeOutcome};
pub use report::{CulpritReport, NO_CANDIDATES_MESSAGE};
