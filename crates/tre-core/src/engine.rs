//! Execution engine: walks a [`Plan`] phase by phase against a [`Tracker`].
//!
//! The loop is single-threaded. Each operation either runs, is skipped
//! because an earlier run already succeeded it, is skipped because a symbol
//! it needs never resolved, or is skipped because the run is a dry run.
//! Per-operation failures are recorded and the walk continues; only fatal
//! kinds abort, and they flush the checkpoint and summary first.

use crate::audit::{AuditLog, AuditStatus, Summary};
use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::{Result, TreError};
use crate::plan::{Action, KeyRef, Operation, Plan};
use crate::tracker::{FieldPatch, Tracker, TrackerCapabilities};
use crate::types::Phase;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative stop signal checked between operations. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Soft deadline: once `after` has elapsed the token reads as cancelled.
    pub fn with_deadline(mut self, after: Duration) -> Self {
        self.deadline = Some(Instant::now() + after);
        self
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ---------------------------------------------------------------------------
// Options / outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub dry_run: bool,
    /// Upper bound on targets coalesced into one bulk call.
    pub batch_size: usize,
    pub checkpoint_dir: PathBuf,
    /// Stop after this many failed operations in one run.
    pub max_failures: Option<usize>,
}

impl EngineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dry_run: config.dry_run,
            batch_size: config.batch_size.max(1),
            checkpoint_dir: config.checkpoint_path.clone(),
            max_failures: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub plan_hash: String,
    pub checkpoint: Checkpoint,
    /// `None` for dry runs, which never write a checkpoint.
    pub checkpoint_path: Option<PathBuf>,
    pub summary: Summary,
    pub interrupted: bool,
}

impl RunOutcome {
    /// Some operation ended in a failure that was not a skip.
    pub fn has_failures(&self) -> bool {
        self.summary.failure_count() > 0
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<'a, T: Tracker + ?Sized> {
    tracker: &'a mut T,
    options: EngineOptions,
    cancel: CancelToken,
    capabilities: TrackerCapabilities,
    failures: usize,
}

/// Why the walk stopped before the last operation.
enum Halt {
    Interrupted,
    Fatal(TreError),
}

impl<'a, T: Tracker + ?Sized> Engine<'a, T> {
    pub fn new(tracker: &'a mut T, options: EngineOptions, cancel: CancelToken) -> Self {
        let capabilities = tracker.capabilities();
        Self {
            tracker,
            options,
            cancel,
            capabilities,
            failures: 0,
        }
    }

    pub fn run(&mut self, plan: &Plan, audit: &mut AuditLog) -> Result<RunOutcome> {
        let dir = self.options.checkpoint_dir.clone();
        let mut cp = Checkpoint::load_or_new(&dir, plan)?;
        if !self.options.dry_run {
            Checkpoint::save_plan(&dir, plan)?;
        }
        self.tracker.take_attempts();
        self.failures = 0;

        info!(
            run_id = audit.run_id(),
            plan_hash = %cp.plan_hash,
            operations = plan.operations.len(),
            dry_run = self.options.dry_run,
            "run started"
        );

        let halt = self.walk(plan, &mut cp, audit);

        let checkpoint_path = if self.options.dry_run {
            None
        } else {
            Some(cp.save(&dir)?)
        };
        let interrupted = halt.is_some();
        let summary = audit.finish(interrupted)?;

        if let Some(Halt::Fatal(e)) = halt {
            return Err(e);
        }
        info!(
            succeeded = summary.per_status.get("succeeded").copied().unwrap_or(0),
            failed = summary.failure_count(),
            interrupted,
            "run finished"
        );
        Ok(RunOutcome {
            run_id: audit.run_id().to_string(),
            plan_hash: cp.plan_hash.clone(),
            checkpoint: cp,
            checkpoint_path,
            summary,
            interrupted,
        })
    }

    fn walk(&mut self, plan: &Plan, cp: &mut Checkpoint, audit: &mut AuditLog) -> Option<Halt> {
        for &phase in Phase::all() {
            let ops: Vec<&Operation> = plan.in_phase(phase).collect();
            if ops.is_empty() {
                continue;
            }
            info!(phase = %phase, operations = ops.len(), "phase started");

            let mut handled: BTreeSet<&str> = BTreeSet::new();
            for (i, op) in ops.iter().enumerate() {
                if handled.contains(op.id.as_str()) {
                    continue;
                }
                if let Some(halt) = self.should_stop(audit) {
                    return Some(halt);
                }
                let batch = self.batch_from(&ops[i..], &handled, cp);
                let result = if batch.len() > 1 {
                    for &o in &batch {
                        handled.insert(o.id.as_str());
                    }
                    self.execute_batch(&batch, cp, audit)
                } else {
                    self.execute(op, cp, audit)
                };
                if let Err(e) = result {
                    return Some(Halt::Fatal(e));
                }
            }

            cp.phase_cursor = Some(phase);
            if !self.options.dry_run {
                if let Err(e) = cp.save(&self.options.checkpoint_dir) {
                    return Some(Halt::Fatal(e));
                }
            }
        }
        None
    }

    fn should_stop(&self, audit: &mut AuditLog) -> Option<Halt> {
        if self.cancel.is_cancelled() {
            audit.warn("run cancelled, remaining operations left pending");
            return Some(Halt::Interrupted);
        }
        if let Some(max) = self.options.max_failures {
            if self.failures >= max {
                audit.warn(format!(
                    "stopped after {} failure(s), remaining operations left pending",
                    self.failures
                ));
                return Some(Halt::Interrupted);
            }
        }
        None
    }

    // -----------------------------------------------------------------------
    // Single operations
    // -----------------------------------------------------------------------

    /// Run one operation. `Err` only for fatal kinds, after recording them.
    fn execute(&mut self, op: &Operation, cp: &mut Checkpoint, audit: &mut AuditLog) -> Result<()> {
        let recorded = cp.operations.get(&op.id).and_then(|r| r.tracker_key.clone());

        // Dry runs report every operation as skipped(dry_run), even ones an
        // earlier run of the same plan already finished.
        if self.options.dry_run {
            let (before, after) = change_of(&op.action);
            let key = target_of(&op.action)
                .and_then(|r| r.resolve(&cp.symbolic_refs))
                .or(recorded);
            let event = audit
                .event(op, AuditStatus::SkippedDryRun, 0)
                .with_key(key)
                .with_change(before, after);
            return audit.record(event);
        }

        if cp.is_done(&op.id) {
            let event = audit
                .event(op, AuditStatus::SkippedAlreadyDone, 0)
                .with_key(recorded);
            return audit.record(event);
        }

        let unresolved: Vec<String> = op
            .action
            .dependencies()
            .into_iter()
            .filter(|r| r.resolve(&cp.symbolic_refs).is_none())
            .map(|r| r.to_string())
            .collect();
        if !unresolved.is_empty() {
            let err = TreError::DependencyMissing(unresolved.join(", "));
            warn!(op = %op.id, "{err}");
            cp.record_skip(&op.id, "missing_dependency");
            let event = audit
                .event(op, AuditStatus::SkippedMissingDependency, 0)
                .with_error(&err);
            return audit.record(event);
        }

        debug!(op = %op.id, "executing");
        let result = self.invoke(op, &cp.plan_hash, &cp.symbolic_refs);
        let attempts = self.tracker.take_attempts();
        let target = target_of(&op.action).and_then(|r| r.resolve(&cp.symbolic_refs));
        let (before, after) = change_of(&op.action);

        match result {
            Ok(created) => {
                let minted = match (op.action.produces(), &created) {
                    (Some(symbol), Some(key)) => {
                        cp.bind(symbol, key);
                        true
                    }
                    _ => false,
                };
                let key = created.or(target);
                cp.record_success(&op.id, attempts, key.clone());
                let event = audit
                    .event(op, AuditStatus::Succeeded, attempts)
                    .with_key(key)
                    .with_change(before, after);
                audit.record(event)?;
                // Minted keys hit disk before the next operation starts.
                if minted {
                    cp.save(&self.options.checkpoint_dir)?;
                }
                Ok(())
            }
            Err(e) => self.fail(op, attempts, target, e, cp, audit),
        }
    }

    fn fail(
        &mut self,
        op: &Operation,
        attempts: u32,
        target: Option<String>,
        error: TreError,
        cp: &mut Checkpoint,
        audit: &mut AuditLog,
    ) -> Result<()> {
        warn!(op = %op.id, kind = %error.kind(), "operation failed: {error}");
        self.failures += 1;
        cp.record_failure(&op.id, attempts, &error);
        let event = audit
            .event(op, AuditStatus::Failed, attempts)
            .with_key(target)
            .with_error(&error);
        audit.record(event)?;
        if error.is_fatal() {
            return Err(error);
        }
        Ok(())
    }

    /// Call the tracker. Returns the key minted by a create.
    fn invoke(
        &mut self,
        op: &Operation,
        plan_hash: &str,
        symbols: &BTreeMap<String, String>,
    ) -> Result<Option<String>> {
        let resolve = |r: &KeyRef| {
            r.resolve(symbols)
                .ok_or_else(|| TreError::DependencyMissing(r.to_string()))
        };
        let idempotency_key = self
            .capabilities
            .idempotency_keys
            .then(|| format!("{plan_hash}:{}", op.id));
        let idempotency_key = idempotency_key.as_deref();

        match &op.action {
            Action::CreateFolder { path } => self.tracker.create_folder(path).map(|_| None),
            Action::CreatePrecondition { spec, .. } => self
                .tracker
                .create_precondition(spec, idempotency_key)
                .map(Some),
            Action::CreateTest { spec, .. } => {
                self.tracker.create_test(spec, idempotency_key).map(Some)
            }
            Action::UpdateLabels { target, labels, .. } => {
                let key = resolve(target)?;
                self.tracker
                    .update_issue(&key, &FieldPatch::labels(labels.clone()))
                    .map(|_| None)
            }
            Action::UpdatePriority {
                target, priority, ..
            } => {
                let key = resolve(target)?;
                self.tracker
                    .update_issue(&key, &FieldPatch::priority(*priority))
                    .map(|_| None)
            }
            Action::SetSteps { target, steps } => {
                let key = resolve(target)?;
                self.tracker.set_steps(&key, steps).map(|_| None)
            }
            Action::MoveTestToFolder { target, path, .. } => {
                let key = resolve(target)?;
                self.tracker.move_test_to_folder(&key, path).map(|_| None)
            }
            Action::AddPreconditionLink { test, precondition } => {
                let (t, p) = (resolve(test)?, resolve(precondition)?);
                self.tracker.add_precondition_link(&t, &p).map(|_| None)
            }
            Action::RemovePreconditionLink { test, precondition } => {
                let (t, p) = (resolve(test)?, resolve(precondition)?);
                self.tracker.remove_precondition_link(&t, &p).map(|_| None)
            }
            Action::TransitionIssue { target, status, .. } => {
                let key = resolve(target)?;
                self.tracker.transition_issue(&key, status).map(|_| None)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Batching
    // -----------------------------------------------------------------------

    /// Folder moves later in the same phase that can ride along with `ops[0]`
    /// in one bulk call: same destination, known key, not yet done.
    fn batch_from<'p>(
        &self,
        ops: &[&'p Operation],
        handled: &BTreeSet<&str>,
        cp: &Checkpoint,
    ) -> Vec<&'p Operation> {
        let Some(first) = ops.first() else {
            return Vec::new();
        };
        let mut batch = vec![*first];
        if self.options.dry_run
            || !self.capabilities.bulk_folder_moves
            || self.options.batch_size < 2
        {
            return batch;
        }
        let Some(path) = movable(first, cp) else {
            return batch;
        };
        for op in &ops[1..] {
            if batch.len() >= self.options.batch_size {
                break;
            }
            if !handled.contains(op.id.as_str()) && movable(op, cp) == Some(path) {
                batch.push(*op);
            }
        }
        batch
    }

    fn execute_batch(
        &mut self,
        batch: &[&Operation],
        cp: &mut Checkpoint,
        audit: &mut AuditLog,
    ) -> Result<()> {
        let (path, keys): (&str, Vec<String>) = {
            let path = match &batch[0].action {
                Action::MoveTestToFolder { path, .. } => path.as_str(),
                _ => return Err(TreError::Internal("batch of non-move operations".into())),
            };
            let keys = batch
                .iter()
                .filter_map(|op| target_of(&op.action).and_then(|r| r.known()).map(String::from))
                .collect();
            (path, keys)
        };
        if keys.len() != batch.len() {
            return Err(TreError::Internal("batched move without a known key".into()));
        }
        debug!(path, count = keys.len(), "bulk folder move");

        let outcome = self.tracker.move_tests_to_folder(path, &keys);
        let attempts = self.tracker.take_attempts();
        let mut by_key: BTreeMap<String, Result<()>> = outcome.into_iter().collect();

        let mut fatal = None;
        for op in batch {
            let key = target_of(&op.action)
                .and_then(|r| r.known())
                .map(String::from)
                .unwrap_or_default();
            let result = by_key
                .remove(&key)
                .unwrap_or_else(|| Err(TreError::Internal(format!("no bulk result for {key}"))));
            match result {
                Ok(()) => {
                    let (before, after) = change_of(&op.action);
                    cp.record_success(&op.id, attempts, Some(key.clone()));
                    let event = audit
                        .event(op, AuditStatus::Succeeded, attempts)
                        .with_key(Some(key))
                        .with_change(before, after);
                    audit.record(event)?;
                }
                Err(e) => {
                    if let Err(fatal_err) = self.fail(op, attempts, Some(key), e, cp, audit) {
                        fatal.get_or_insert(fatal_err);
                    }
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Destination of a folder move eligible for batching.
fn movable<'p>(op: &'p Operation, cp: &Checkpoint) -> Option<&'p str> {
    match &op.action {
        Action::MoveTestToFolder {
            target: KeyRef::Key(_),
            path,
            ..
        } if !cp.is_done(&op.id) => Some(path),
        _ => None,
    }
}

/// The issue an operation acts on, when it acts on an existing one.
fn target_of(action: &Action) -> Option<&KeyRef> {
    match action {
        Action::UpdateLabels { target, .. }
        | Action::UpdatePriority { target, .. }
        | Action::SetSteps { target, .. }
        | Action::MoveTestToFolder { target, .. }
        | Action::TransitionIssue { target, .. } => Some(target),
        Action::AddPreconditionLink { test, .. } | Action::RemovePreconditionLink { test, .. } => {
            Some(test)
        }
        Action::CreateFolder { .. }
        | Action::CreatePrecondition { .. }
        | Action::CreateTest { .. } => None,
    }
}

/// `before`/`after` values for the journal.
fn change_of(action: &Action) -> (Option<Value>, Option<Value>) {
    match action {
        Action::CreateFolder { path } => (None, Some(json!({ "path": path }))),
        Action::CreatePrecondition { spec, .. } => (None, serde_json::to_value(spec).ok()),
        Action::CreateTest { spec, .. } => (None, serde_json::to_value(spec).ok()),
        Action::UpdateLabels { labels, before, .. } => {
            (Some(json!(before)), Some(json!(labels)))
        }
        Action::UpdatePriority {
            priority, before, ..
        } => (before.map(|p| json!(p)), Some(json!(priority))),
        Action::SetSteps { steps, .. } => (None, Some(json!(steps))),
        Action::MoveTestToFolder { path, before, .. } => {
            (before.as_ref().map(|b| json!(b)), Some(json!(path)))
        }
        Action::AddPreconditionLink { precondition, .. } => {
            (None, Some(json!({ "precondition": precondition.to_string() })))
        }
        Action::RemovePreconditionLink { precondition, .. } => {
            (Some(json!({ "precondition": precondition.to_string() })), None)
        }
        Action::TransitionIssue { status, before, .. } => {
            (before.as_ref().map(|b| json!(b)), Some(json!(status)))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::OpStatus;
    use crate::error::ErrorKind;
    use crate::tracker::memory::{Fault, MemoryTest};
    use crate::tracker::{MemoryTracker, TestSpec};
    use crate::types::{Priority, TestType};
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> EngineOptions {
        EngineOptions {
            dry_run: false,
            batch_size: 10,
            checkpoint_dir: dir.path().join("checkpoints"),
            max_failures: None,
        }
    }

    fn op(id: &str, phase: Phase, external_id: &str, action: Action) -> Operation {
        Operation {
            id: id.into(),
            phase,
            external_id: external_id.into(),
            action,
        }
    }

    fn create_test(id: &str, folder: Option<&str>) -> Operation {
        op(
            &format!("p3:create_test:{id}"),
            Phase::TestCreation,
            id,
            Action::CreateTest {
                symbol: format!("test:{id}"),
                spec: TestSpec {
                    summary: format!("Test {id}"),
                    description: String::new(),
                    test_type: TestType::Manual,
                    priority: Priority::Medium,
                    labels: vec![],
                    folder_path: folder.map(String::from),
                    steps: vec![],
                },
            },
        )
    }

    fn plan(operations: Vec<Operation>) -> Plan {
        Plan {
            project: "API".into(),
            operations,
            ..Plan::default()
        }
    }

    fn audit(dir: &TempDir, plan: &Plan, dry_run: bool) -> AuditLog {
        AuditLog::create(&dir.path().join("audit"), "run", plan, dry_run).unwrap()
    }

    #[test]
    fn symbols_flow_between_phases() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![
            create_test("T1", None),
            op(
                "p4:update_priority:T1",
                Phase::TestFields,
                "T1",
                Action::UpdatePriority {
                    target: KeyRef::Symbol("test:T1".into()),
                    priority: Priority::High,
                    before: None,
                },
            ),
        ]);
        let mut tracker = MemoryTracker::default();
        let mut log = audit(&dir, &plan, false);
        let outcome = Engine::new(&mut tracker, options(&dir), CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();

        assert!(!outcome.has_failures());
        assert_eq!(outcome.checkpoint.symbolic_refs["test:T1"], "API-1");
        assert_eq!(tracker.test("API-1").unwrap().priority, Priority::High);
        assert_eq!(outcome.checkpoint.phase_cursor, Some(Phase::TestFields));
        assert!(outcome.checkpoint_path.unwrap().exists());
    }

    #[test]
    fn failed_producer_skips_dependents() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![
            create_test("T1", Some("/Missing")),
            op(
                "p4:set_steps:T1",
                Phase::TestFields,
                "T1",
                Action::SetSteps {
                    target: KeyRef::Symbol("test:T1".into()),
                    steps: vec![],
                },
            ),
        ]);
        let mut tracker = MemoryTracker::default();
        let mut log = audit(&dir, &plan, false);
        let outcome = Engine::new(&mut tracker, options(&dir), CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();

        assert!(outcome.has_failures());
        assert_eq!(outcome.summary.failures[&ErrorKind::NotFound].len(), 1);
        assert_eq!(
            outcome.summary.per_status["skipped(missing_dependency)"],
            1
        );
        let events = log.events();
        assert_eq!(events[1].error_kind, Some(ErrorKind::DependencyMissing));
        assert_eq!(outcome.checkpoint.status("p4:set_steps:T1"), OpStatus::Skipped);
    }

    #[test]
    fn fatal_error_aborts_and_flushes() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![create_test("T1", None), create_test("T2", None)]);
        let mut tracker = MemoryTracker::default();
        tracker.inject("create_test", "Test T1", Fault::Fail(ErrorKind::AuthError));
        let mut log = audit(&dir, &plan, false);
        let err = Engine::new(&mut tracker, options(&dir), CancelToken::new())
            .run(&plan, &mut log)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
        assert!(tracker.tests().is_empty());

        let cp = Checkpoint::load_or_new(&dir.path().join("checkpoints"), &plan).unwrap();
        assert_eq!(cp.status("p3:create_test:T1"), OpStatus::Failed);
        assert_eq!(cp.status("p3:create_test:T2"), OpStatus::Pending);
        assert!(crate::paths::summary_path(&dir.path().join("audit"), "run").exists());
    }

    #[test]
    fn cancelled_token_leaves_everything_pending() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![create_test("T1", None)]);
        let mut tracker = MemoryTracker::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut log = audit(&dir, &plan, false);
        let outcome = Engine::new(&mut tracker, options(&dir), cancel)
            .run(&plan, &mut log)
            .unwrap();
        assert!(outcome.interrupted);
        assert!(outcome.summary.interrupted);
        assert_eq!(outcome.checkpoint.count(OpStatus::Pending), 1);
        assert!(tracker.calls().is_empty());
    }

    #[test]
    fn dry_run_after_completed_run_still_reports_dry_run() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![create_test("T1", None)]);
        let mut tracker = MemoryTracker::default();
        let mut log = audit(&dir, &plan, false);
        Engine::new(&mut tracker, options(&dir), CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();

        let mut opts = options(&dir);
        opts.dry_run = true;
        let mut log = AuditLog::create(&dir.path().join("audit"), "rehearse", &plan, true).unwrap();
        let outcome = Engine::new(&mut tracker, opts, CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();
        let events = log.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, AuditStatus::SkippedDryRun);
        assert_eq!(events[0].target_tracker_key.as_deref(), Some("API-1"));
        assert_eq!(outcome.summary.per_status["skipped(dry_run)"], 1);
        assert_eq!(tracker.tests().len(), 1);
    }

    #[test]
    fn expired_deadline_reads_as_cancelled() {
        let token = CancelToken::new().with_deadline(Duration::ZERO);
        assert!(token.is_cancelled());
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn folder_moves_are_coalesced() {
        let dir = TempDir::new().unwrap();
        let mut tracker = MemoryTracker::default();
        tracker.insert_folder("/Dest");
        let mut ops = Vec::new();
        for n in 1..=3 {
            let key = format!("API-{n}");
            tracker.insert_test(&key, MemoryTest::new(&format!("t{n}")));
            ops.push(op(
                &format!("p4:move_test_to_folder:T{n}"),
                Phase::TestFields,
                &format!("T{n}"),
                Action::MoveTestToFolder {
                    target: KeyRef::Key(key),
                    path: "/Dest".into(),
                    before: Some("/".into()),
                },
            ));
        }
        tracker.inject("move_test_to_folder", "API-2", Fault::Fail(ErrorKind::PermissionError));
        let plan = plan(ops);
        let mut log = audit(&dir, &plan, false);
        let mut opts = options(&dir);
        opts.batch_size = 2;
        let outcome = Engine::new(&mut tracker, opts, CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();

        assert_eq!(outcome.summary.per_status["succeeded"], 2);
        assert_eq!(outcome.summary.failures[&ErrorKind::PermissionError].len(), 1);
        assert_eq!(tracker.test("API-1").unwrap().folder_path, "/Dest");
        assert_eq!(tracker.test("API-2").unwrap().folder_path, "/");
        assert_eq!(tracker.test("API-3").unwrap().folder_path, "/Dest");
    }

    #[test]
    fn idempotency_key_is_derived_from_plan_and_op() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![create_test("T1", None)]);
        let mut tracker = MemoryTracker::default();
        let mut log = audit(&dir, &plan, false);
        Engine::new(&mut tracker, options(&dir), CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();

        // Same key replays the earlier creation instead of minting a second issue.
        let spec = match &plan.operations[0].action {
            Action::CreateTest { spec, .. } => spec.clone(),
            _ => unreachable!(),
        };
        let again = tracker
            .create_test(&spec, Some(&format!("{}:p3:create_test:T1", plan.hash().unwrap())))
            .unwrap();
        assert_eq!(again, "API-1");
        assert_eq!(tracker.tests().len(), 1);
    }

    #[test]
    fn attempts_are_journaled() {
        let dir = TempDir::new().unwrap();
        let plan = plan(vec![create_test("T1", None)]);
        let mut tracker = MemoryTracker::default();
        tracker.inject("create_test", "Test T1", Fault::Flaky(3));
        let mut log = audit(&dir, &plan, false);
        let outcome = Engine::new(&mut tracker, options(&dir), CancelToken::new())
            .run(&plan, &mut log)
            .unwrap();
        assert_eq!(log.events()[0].attempt, 4);
        assert_eq!(outcome.checkpoint.operations["p3:create_test:T1"].attempts, 4);
    }
}
