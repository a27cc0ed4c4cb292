pub mod inventory;
pub mod plan;
pub mod run;
pub mod status;
pub mod validate;

use clap::Args;
use std::path::PathBuf;

/// How a command finished when it did not error out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Clean,
    /// Completed, but at least one operation failed.
    Failures,
}

/// Where the live state for planning comes from, plus planner switches.
#[derive(Args, Debug, Clone, Default)]
pub struct PlanSource {
    /// Plan against a snapshot saved by `tre inventory --out` instead of the
    /// live tracker. `run` then rehearses against an in-memory copy.
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Adopt tracker keys minted by an earlier run (a checkpoint file)
    #[arg(long)]
    pub keys_from: Option<PathBuf>,

    /// Emit the closure transitions listed in the catalog
    #[arg(long)]
    pub close: bool,
}
