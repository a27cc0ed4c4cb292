use super::{Exit, PlanSource};
use crate::output::{print_json, print_summary};
use crate::setup::{self, Backend, Globals};
use anyhow::{bail, Context};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tre_core::audit::{self, AuditLog, Summary};
use tre_core::checkpoint::Checkpoint;
use tre_core::engine::{CancelToken, Engine, EngineOptions};
use tre_core::tracker::MemoryTracker;

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Record what would happen without calling the tracker
    #[arg(long)]
    pub dry_run: bool,

    /// Replay the plan stored beside this checkpoint instead of replanning
    #[arg(long, conflicts_with = "keys_from")]
    pub resume_from: Option<PathBuf>,

    /// Stop the run after this many failed operations
    #[arg(long)]
    pub max_failures: Option<usize>,

    /// Soft deadline in seconds; remaining operations stay pending
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    run_id: &'a str,
    plan_hash: &'a str,
    dry_run: bool,
    rehearsal: bool,
    checkpoint: Option<&'a PathBuf>,
    journal: PathBuf,
    summary: &'a Summary,
}

pub fn run(
    globals: &Globals,
    catalogs: &[PathBuf],
    source: &PlanSource,
    args: &RunArgs,
    json: bool,
) -> anyhow::Result<Exit> {
    let mut config = globals.config()?;

    let (plan, mut backend) = match &args.resume_from {
        Some(path) => {
            let plan = Checkpoint::load_plan(path)
                .with_context(|| format!("cannot resume from {}", path.display()))?;
            if config.project_key.is_empty() {
                config.project_key = plan.project.clone();
            }
            if config.project_key != plan.project {
                bail!(
                    "checkpoint belongs to project {}, not {}",
                    plan.project,
                    config.project_key
                );
            }
            let backend = match &source.snapshot {
                Some(_) => {
                    let (snap, backend) = setup::snapshot(&mut config, source, None)?;
                    info!(tests = snap.tests.len(), "rehearsing resume offline");
                    backend
                }
                None => Backend::Live(setup::connect(&config)?),
            };
            (plan, backend)
        }
        None => {
            if catalogs.is_empty() {
                bail!("no catalog files given (or use --resume-from)");
            }
            let catalog = setup::load_catalog(catalogs, source.keys_from.as_deref())?;
            let (snapshot, mut backend) = setup::snapshot(&mut config, source, Some(&catalog))?;
            let plan = setup::build_plan(&catalog, &snapshot, &mut backend, source.close);
            (plan, backend)
        }
    };

    let mut options = EngineOptions::from_config(&config);
    options.dry_run |= args.dry_run;
    options.max_failures = args.max_failures;
    let cancel = match args.deadline_secs {
        Some(secs) => CancelToken::new().with_deadline(Duration::from_secs(secs)),
        None => CancelToken::new(),
    };
    cancel_on_interrupt(&cancel);

    let run_id = audit::new_run_id();
    let mut log = AuditLog::create(&config.audit_dir, &run_id, &plan, options.dry_run)?;
    let rehearsal = backend.is_offline();
    if rehearsal {
        info!("running against an in-memory copy of the snapshot; the tracker is not touched");
    }

    let outcome = Engine::new(backend.tracker(), options.clone(), cancel)
        .run(&plan, &mut log)
        .with_context(|| format!("run {run_id} aborted; see {}", log.journal_path().display()))?;

    if let Backend::Offline(memory) = &backend {
        report_rehearsal(memory);
    }

    if json {
        print_json(&RunOutput {
            run_id: &outcome.run_id,
            plan_hash: &outcome.plan_hash,
            dry_run: options.dry_run,
            rehearsal,
            checkpoint: outcome.checkpoint_path.as_ref(),
            journal: log.journal_path().to_path_buf(),
            summary: &outcome.summary,
        })?;
    } else {
        print_summary(&outcome.summary);
        println!();
        println!("run {}  plan {}", outcome.run_id, outcome.plan_hash);
        println!("journal    {}", log.journal_path().display());
        if let Some(path) = &outcome.checkpoint_path {
            println!("checkpoint {}", path.display());
        }
    }

    if outcome.has_failures() {
        Ok(Exit::Failures)
    } else {
        Ok(Exit::Clean)
    }
}

/// Ctrl-C stops the walk between operations so the checkpoint and summary
/// are flushed; a second Ctrl-C exits immediately.
fn cancel_on_interrupt(cancel: &CancelToken) {
    let token = cancel.clone();
    let pressed = AtomicBool::new(false);
    let installed = ctrlc::set_handler(move || {
        if pressed.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        eprintln!("interrupt received, stopping after the current operation");
        token.cancel();
    });
    if let Err(e) = installed {
        warn!("cannot install interrupt handler: {e}");
    }
}

fn report_rehearsal(memory: &MemoryTracker) {
    info!(
        tests = memory.tests().len(),
        preconditions = memory.preconditions().len(),
        folders = memory.folders().len(),
        "rehearsal finished"
    );
}
