//! End-to-end runs of snapshot -> plan -> execute against the in-memory
//! tracker.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use tempfile::TempDir;
use tre_core::audit::{read_journal, AuditLog, AuditStatus, Summary};
use tre_core::catalog::{Catalog, CatalogFile, Step};
use tre_core::checkpoint::{Checkpoint, OpStatus};
use tre_core::engine::{CancelToken, Engine, EngineOptions, RunOutcome};
use tre_core::inventory::{InventoryLoader, LiveSnapshot};
use tre_core::plan::{self, Action, KeyRef, Plan};
use tre_core::text::is_test_id_label;
use tre_core::tracker::memory::{Fault, MemoryPrecondition, MemoryTest};
use tre_core::tracker::{
    BatchOutcome, FieldPatch, MemoryTracker, PreconditionSnapshot, PreconditionSpec, TestSnapshot,
    TestSpec, Token, Tracker, TrackerCapabilities,
};
use tre_core::types::OpKind;
use tre_core::{paths, ErrorKind, Result};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn catalog(json: &str) -> Catalog {
    let file: CatalogFile = serde_json::from_str(json).unwrap();
    Catalog::from_files(vec![file]).unwrap()
}

fn snapshot(tracker: &mut MemoryTracker, catalog: &Catalog) -> LiveSnapshot {
    InventoryLoader::new(tracker, "API", 50)
        .load(Some(catalog))
        .unwrap()
}

struct Harness {
    dir: TempDir,
    run: u32,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            run: 0,
        }
    }

    fn options(&self, dry_run: bool) -> EngineOptions {
        EngineOptions {
            dry_run,
            batch_size: 10,
            checkpoint_dir: self.dir.path().join("checkpoints"),
            max_failures: None,
        }
    }

    fn execute(
        &mut self,
        tracker: &mut MemoryTracker,
        plan: &Plan,
        options: EngineOptions,
    ) -> (RunOutcome, Vec<tre_core::audit::AuditEvent>) {
        self.run += 1;
        let run_id = format!("run-{}", self.run);
        let audit_dir = self.dir.path().join("audit");
        let mut audit = AuditLog::create(&audit_dir, &run_id, plan, options.dry_run).unwrap();
        let outcome = Engine::new(tracker, options, CancelToken::new())
            .run(plan, &mut audit)
            .unwrap();
        let events = read_journal(audit.journal_path()).unwrap_or_default();
        (outcome, events)
    }
}

/// In-memory tracker that calls `hook` with the summary of every test it is
/// asked to create, before creating it.
struct Watched {
    inner: MemoryTracker,
    hook: Box<dyn FnMut(&str)>,
}

impl Watched {
    fn new(inner: MemoryTracker, hook: impl FnMut(&str) + 'static) -> Self {
        Self {
            inner,
            hook: Box::new(hook),
        }
    }
}

impl Tracker for Watched {
    fn capabilities(&self) -> TrackerCapabilities {
        self.inner.capabilities()
    }

    fn authenticate(&mut self) -> Result<Token> {
        self.inner.authenticate()
    }

    fn search_tests<'a>(
        &'a mut self,
        jql: &str,
        page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<TestSnapshot>> + 'a> {
        self.inner.search_tests(jql, page_size)
    }

    fn search_preconditions<'a>(
        &'a mut self,
        jql: &str,
        page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<PreconditionSnapshot>> + 'a> {
        self.inner.search_preconditions(jql, page_size)
    }

    fn list_folders(&mut self, project: &str) -> Result<BTreeSet<String>> {
        self.inner.list_folders(project)
    }

    fn get_steps(&mut self, test_key: &str) -> Result<Vec<Step>> {
        self.inner.get_steps(test_key)
    }

    fn create_test(&mut self, spec: &TestSpec, idempotency_key: Option<&str>) -> Result<String> {
        (self.hook)(&spec.summary);
        self.inner.create_test(spec, idempotency_key)
    }

    fn create_precondition(
        &mut self,
        spec: &PreconditionSpec,
        idempotency_key: Option<&str>,
    ) -> Result<String> {
        self.inner.create_precondition(spec, idempotency_key)
    }

    fn update_issue(&mut self, key: &str, patch: &FieldPatch) -> Result<()> {
        self.inner.update_issue(key, patch)
    }

    fn set_steps(&mut self, test_key: &str, steps: &[Step]) -> Result<()> {
        self.inner.set_steps(test_key, steps)
    }

    fn add_precondition_link(&mut self, test_key: &str, precondition_key: &str) -> Result<()> {
        self.inner.add_precondition_link(test_key, precondition_key)
    }

    fn remove_precondition_link(&mut self, test_key: &str, precondition_key: &str) -> Result<()> {
        self.inner.remove_precondition_link(test_key, precondition_key)
    }

    fn move_test_to_folder(&mut self, test_key: &str, path: &str) -> Result<()> {
        self.inner.move_test_to_folder(test_key, path)
    }

    fn move_tests_to_folder(&mut self, path: &str, test_keys: &[String]) -> BatchOutcome {
        self.inner.move_tests_to_folder(path, test_keys)
    }

    fn create_folder(&mut self, path: &str) -> Result<()> {
        self.inner.create_folder(path)
    }

    fn transition_issue(&mut self, key: &str, target_status: &str) -> Result<()> {
        self.inner.transition_issue(key, target_status)
    }

    fn take_attempts(&mut self) -> u32 {
        self.inner.take_attempts()
    }
}

fn assert_converged(tracker: &mut MemoryTracker, catalog: &Catalog) {
    let after = snapshot(tracker, catalog);
    let replan = plan::plan(catalog, &after);
    assert!(
        replan.is_empty(),
        "expected no further changes, got {:?}",
        replan.operations.iter().map(|o| &o.id).collect::<Vec<_>>()
    );
    for t in after.tests.values() {
        assert!(t.labels.iter().all(|l| !is_test_id_label(l)), "{t:?}");
    }
    for p in after.preconditions.values() {
        assert!(p.labels.contains("precondition"), "{p:?}");
    }
}

const GREENFIELD: &str = r#"{
  "tests": [
    {
      "external_id": "T1", "summary": "Checkout applies coupon", "test_type": "Manual",
      "priority": "High", "labels": ["alpha"], "folder_path": "/X",
      "steps": [{"action": "Add coupon", "result": "Total drops"}],
      "precondition_refs": ["P1"]
    },
    {
      "external_id": "T2", "summary": "Cart keeps items", "test_type": "Manual",
      "priority": "Medium", "labels": [], "folder_path": "/X/Y",
      "steps": [{"action": "Reload", "data": "cart=3", "result": "Three items"}]
    }
  ],
  "preconditions": [
    {"external_id": "P1", "summary": "User logged in", "definition": "A user session exists"}
  ]
}"#;

// ---------------------------------------------------------------------------
// S1 greenfield
// ---------------------------------------------------------------------------

#[test]
fn greenfield_creates_everything_in_order() {
    let cat = catalog(GREENFIELD);
    let mut tracker = MemoryTracker::default();
    let snap = snapshot(&mut tracker, &cat);
    let plan = plan::plan(&cat, &snap);

    let kinds: Vec<(OpKind, &str)> = plan
        .operations
        .iter()
        .map(|o| (o.kind(), o.external_id.as_str()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (OpKind::CreateFolder, "/X"),
            (OpKind::CreateFolder, "/X/Y"),
            (OpKind::CreatePrecondition, "P1"),
            (OpKind::CreateTest, "T1"),
            (OpKind::CreateTest, "T2"),
            (OpKind::AddPreconditionLink, "T1"),
        ]
    );

    let mut h = Harness::new();
    let (outcome, events) = h.execute(&mut tracker, &plan, h.options(false));
    assert!(!outcome.has_failures());
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.status == AuditStatus::Succeeded));

    let after = snapshot(&mut tracker, &cat);
    assert_eq!(after.tests.len(), 2);
    assert_eq!(after.preconditions.len(), 1);
    let pre = after.preconditions.values().next().unwrap();
    assert_eq!(pre.labels, BTreeSet::from(["precondition".to_string()]));
    let links: usize = after.tests.values().map(|t| t.precondition_keys.len()).sum();
    assert_eq!(links, 1);

    let t1 = &after.tests[&outcome.checkpoint.symbolic_refs["test:T1"]];
    assert_eq!(t1.folder_path, "/X");
    assert!(t1.precondition_keys.contains(&pre.key));

    assert_converged(&mut tracker, &cat);
}

#[test]
fn greenfield_without_combined_create_still_converges() {
    let cat = catalog(GREENFIELD);
    let caps = tre_core::tracker::TrackerCapabilities {
        combined_create: false,
        bulk_folder_moves: false,
        idempotency_keys: false,
    };
    let mut tracker = MemoryTracker::default().with_capabilities(caps);
    let snap = snapshot(&mut tracker, &cat);
    let plan = plan::plan_with(
        &cat,
        &snap,
        &plan::PlanOptions {
            enable_closure: false,
            capabilities: caps,
        },
    );
    let mut h = Harness::new();
    let (outcome, _) = h.execute(&mut tracker, &plan, h.options(false));
    assert!(!outcome.has_failures());
    assert_converged(&mut tracker, &cat);
}

// ---------------------------------------------------------------------------
// S2 label cleanup
// ---------------------------------------------------------------------------

#[test]
fn test_id_labels_are_removed_in_one_update() {
    let cat = catalog(
        r#"{"tests": [{
            "external_id": "T1", "summary": "Search finds item", "test_type": "Manual",
            "priority": "Medium", "labels": ["ui"], "folder_path": "/",
            "steps": [{"action": "Search", "result": "Found"}]
        }]}"#,
    );
    let mut tracker = MemoryTracker::new("K");
    let mut live = MemoryTest::new("Search finds item");
    live.labels = BTreeSet::from(["API-001".to_string(), "ui".to_string()]);
    live.steps = vec![Step::new(1, "Search", "", "Found")];
    tracker.insert_test("K-1", live);

    let snap = snapshot(&mut tracker, &cat);
    let plan = plan::plan(&cat, &snap);
    assert_eq!(plan.operations.len(), 1);
    match &plan.operations[0].action {
        Action::UpdateLabels { target, labels, .. } => {
            assert_eq!(target, &KeyRef::Key("K-1".into()));
            assert_eq!(labels, &vec!["ui".to_string()]);
        }
        other => panic!("unexpected {other:?}"),
    }

    let mut h = Harness::new();
    h.execute(&mut tracker, &plan, h.options(false));
    assert_eq!(
        tracker.test("K-1").unwrap().labels,
        BTreeSet::from(["ui".to_string()])
    );
    assert_converged(&mut tracker, &cat);
}

// ---------------------------------------------------------------------------
// S3 precondition canonicalization
// ---------------------------------------------------------------------------

#[test]
fn equivalent_preconditions_collapse_to_one_issue() {
    let cat = catalog(
        r#"{
          "tests": [
            {"external_id": "TA", "summary": "Profile opens", "test_type": "Manual",
             "priority": "Low", "folder_path": "/", "precondition_refs": ["P1"],
             "steps": [{"action": "Open profile", "result": "Shown"}]},
            {"external_id": "TB", "summary": "Settings open", "test_type": "Manual",
             "priority": "Low", "folder_path": "/", "precondition_refs": ["P2"],
             "steps": [{"action": "Open settings", "result": "Shown"}]}
          ],
          "preconditions": [
            {"external_id": "P1", "summary": "User is logged in", "definition": "User is logged in"},
            {"external_id": "P2", "summary": "user  is logged  in.", "definition": "user  is logged  in."}
          ]
        }"#,
    );
    let mut tracker = MemoryTracker::default();
    let snap = snapshot(&mut tracker, &cat);
    let plan = plan::plan(&cat, &snap);
    assert_eq!(
        plan.operations
            .iter()
            .filter(|o| o.kind() == OpKind::CreatePrecondition)
            .count(),
        1
    );

    let mut h = Harness::new();
    let (outcome, _) = h.execute(&mut tracker, &plan, h.options(false));
    assert!(!outcome.summary.warnings.is_empty());

    let pre_key = &outcome.checkpoint.symbolic_refs["precondition:P1"];
    for symbol in ["test:TA", "test:TB"] {
        let key = &outcome.checkpoint.symbolic_refs[symbol];
        let linked = &tracker.test(key).unwrap().preconditions;
        assert_eq!(linked, &BTreeSet::from([pre_key.clone()]));
    }
    assert_eq!(tracker.preconditions().len(), 1);
    assert_converged(&mut tracker, &cat);
}

// ---------------------------------------------------------------------------
// S4 resumable failure
// ---------------------------------------------------------------------------

fn five_tests() -> Catalog {
    let tests: Vec<String> = (1..=5)
        .map(|n| {
            format!(
                r#"{{"external_id": "T{n}", "summary": "Case {n}", "test_type": "Manual",
                    "priority": "Medium", "folder_path": "/",
                    "steps": [{{"action": "step {n}", "result": "ok"}}]}}"#
            )
        })
        .collect();
    catalog(&format!(r#"{{"tests": [{}]}}"#, tests.join(",")))
}

#[test]
fn interrupted_run_resumes_to_the_same_state() {
    let cat = five_tests();

    let mut clean = MemoryTracker::default();
    let clean_plan = plan::plan(&cat, &snapshot(&mut clean, &cat));
    let mut h = Harness::new();
    h.execute(&mut clean, &clean_plan, h.options(false));

    let mut tracker = MemoryTracker::default();
    let plan = plan::plan(&cat, &snapshot(&mut tracker, &cat));
    assert_eq!(plan.hash().unwrap(), clean_plan.hash().unwrap());
    tracker.inject("create_test", "Case 3", Fault::Flaky(5));

    let mut h = Harness::new();
    let mut options = h.options(false);
    options.max_failures = Some(1);
    let (first, _) = h.execute(&mut tracker, &plan, options);
    assert!(first.interrupted);
    let ids: Vec<&str> = plan.operations.iter().map(|o| o.id.as_str()).collect();
    let statuses: Vec<OpStatus> = ids.iter().map(|id| first.checkpoint.status(id)).collect();
    assert_eq!(
        statuses,
        vec![
            OpStatus::Succeeded,
            OpStatus::Succeeded,
            OpStatus::Failed,
            OpStatus::Pending,
            OpStatus::Pending
        ]
    );
    let failed = &first.checkpoint.operations[ids[2]];
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::RetryExhausted);

    // The tracker recovers; the stored plan is replayed.
    tracker.clear_faults();
    let stored = Checkpoint::load_plan(first.checkpoint_path.as_ref().unwrap()).unwrap();
    assert_eq!(stored, plan);
    let (second, events) = h.execute(&mut tracker, &stored, h.options(false));
    assert!(!second.has_failures());
    let statuses: Vec<AuditStatus> = events.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            AuditStatus::SkippedAlreadyDone,
            AuditStatus::SkippedAlreadyDone,
            AuditStatus::Succeeded,
            AuditStatus::Succeeded,
            AuditStatus::Succeeded
        ]
    );

    assert_eq!(tracker.tests(), clean.tests());
    assert_converged(&mut tracker, &cat);
}

#[test]
fn cancel_between_operations_flushes_progress() {
    let cat = five_tests();
    let mut inner = MemoryTracker::default();
    let plan = plan::plan(&cat, &snapshot(&mut inner, &cat));

    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let mut tracker = Watched::new(inner, move |summary| {
        if summary == "Case 2" {
            trigger.cancel();
        }
    });

    let h = Harness::new();
    let audit_dir = h.dir.path().join("audit");
    let mut audit = AuditLog::create(&audit_dir, "cancelled", &plan, false).unwrap();
    let outcome = Engine::new(&mut tracker, h.options(false), cancel)
        .run(&plan, &mut audit)
        .unwrap();
    assert!(outcome.interrupted);

    let on_disk = Checkpoint::load(outcome.checkpoint_path.as_ref().unwrap()).unwrap();
    let statuses: Vec<OpStatus> = plan
        .operations
        .iter()
        .map(|o| on_disk.status(&o.id))
        .collect();
    assert_eq!(
        statuses,
        vec![
            OpStatus::Succeeded,
            OpStatus::Succeeded,
            OpStatus::Pending,
            OpStatus::Pending,
            OpStatus::Pending
        ]
    );
    assert_eq!(on_disk.symbolic_refs["test:T1"], "API-1");
    assert_eq!(on_disk.symbolic_refs["test:T2"], "API-2");
    assert_eq!(tracker.inner.tests().len(), 2);

    let summary = Summary::load(&paths::summary_path(&audit_dir, "cancelled")).unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.per_status["succeeded"], 2);
}

#[test]
fn created_keys_reach_disk_before_the_next_create() {
    let cat = five_tests();
    let mut inner = MemoryTracker::default();
    let plan = plan::plan(&cat, &snapshot(&mut inner, &cat));
    inner.inject("create_test", "Case 4", Fault::Fail(ErrorKind::AuthError));

    let h = Harness::new();
    let options = h.options(false);
    let cp_path = paths::checkpoint_file(&options.checkpoint_dir, "API", &plan.hash().unwrap());
    let seen: Rc<RefCell<Vec<(String, usize)>>> = Rc::default();
    let record = Rc::clone(&seen);
    let mut tracker = Watched::new(inner, move |summary| {
        let persisted = Checkpoint::load(&cp_path)
            .map(|cp| cp.symbolic_refs.len())
            .unwrap_or(0);
        record.borrow_mut().push((summary.to_string(), persisted));
    });

    let mut audit = AuditLog::create(&h.dir.path().join("audit"), "crash", &plan, false).unwrap();
    let err = Engine::new(&mut tracker, options, CancelToken::new())
        .run(&plan, &mut audit)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthError);

    assert_eq!(
        *seen.borrow(),
        vec![
            ("Case 1".to_string(), 0),
            ("Case 2".to_string(), 1),
            ("Case 3".to_string(), 2),
            ("Case 4".to_string(), 3),
        ]
    );
}

// ---------------------------------------------------------------------------
// S5 dry run
// ---------------------------------------------------------------------------

#[test]
fn dry_run_touches_nothing() {
    let cat = catalog(GREENFIELD);
    let mut tracker = MemoryTracker::default();
    let plan = plan::plan(&cat, &snapshot(&mut tracker, &cat));
    tracker.clear_calls();

    let mut h = Harness::new();
    let (outcome, events) = h.execute(&mut tracker, &plan, h.options(true));
    assert!(tracker.calls().is_empty());
    assert!(tracker.tests().is_empty());
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.status == AuditStatus::SkippedDryRun));
    assert!(!outcome.has_failures());
    assert!(outcome.checkpoint_path.is_none());
    assert!(!h.dir.path().join("checkpoints").exists());
}

// ---------------------------------------------------------------------------
// S6 link removal
// ---------------------------------------------------------------------------

#[test]
fn stale_precondition_link_is_removed() {
    let cat = catalog(
        r#"{
          "tests": [{
            "external_id": "T9", "tracker_key": "K-9", "summary": "Refund issued",
            "test_type": "Manual", "priority": "Medium", "folder_path": "/",
            "steps": [{"action": "Refund", "result": "Money back"}],
            "precondition_refs": ["PA"]
          }],
          "preconditions": [
            {"external_id": "PA", "tracker_key": "P-A", "summary": "Order paid", "definition": "An order is paid"}
          ]
        }"#,
    );
    let mut tracker = MemoryTracker::new("K");
    let mut live = MemoryTest::new("Refund issued");
    live.steps = vec![Step::new(1, "Refund", "", "Money back")];
    live.preconditions = BTreeSet::from(["P-A".to_string(), "P-B".to_string()]);
    tracker.insert_test("K-9", live);
    for (key, summary) in [("P-A", "Order paid"), ("P-B", "Order shipped")] {
        let mut p = MemoryPrecondition::new(summary, "");
        p.labels.insert("precondition".into());
        tracker.insert_precondition(key, p);
    }

    let snap = snapshot(&mut tracker, &cat);
    let plan = plan::plan(&cat, &snap);
    assert_eq!(plan.operations.len(), 1);
    assert_eq!(plan.operations[0].kind(), OpKind::RemovePreconditionLink);

    let mut h = Harness::new();
    h.execute(&mut tracker, &plan, h.options(false));
    assert_eq!(
        tracker.test("K-9").unwrap().preconditions,
        BTreeSet::from(["P-A".to_string()])
    );
    assert_converged(&mut tracker, &cat);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn planning_is_byte_identical_across_invocations() {
    let cat = catalog(GREENFIELD);
    let mut tracker = MemoryTracker::default();
    let snap = snapshot(&mut tracker, &cat);
    let a = plan::plan(&cat, &snap).to_json().unwrap();
    let b = plan::plan(&catalog(GREENFIELD), &snap).to_json().unwrap();
    assert_eq!(a, b);
}

#[test]
fn drift_after_convergence_is_repaired() {
    let cat = catalog(GREENFIELD);
    let mut tracker = MemoryTracker::default();
    let plan = plan::plan(&cat, &snapshot(&mut tracker, &cat));
    let mut h = Harness::new();
    let (outcome, _) = h.execute(&mut tracker, &plan, h.options(false));

    // Someone edits the tracker by hand.
    let key = outcome.checkpoint.symbolic_refs["test:T2"].clone();
    let mut drifted = tracker.test(&key).unwrap().clone();
    drifted.labels.insert("API-42".into());
    drifted.steps[0].action = "Reload twice".into();
    drifted.folder_path = "/X".into();
    tracker.insert_test(&key, drifted);

    let replan = plan::plan(&cat, &snapshot(&mut tracker, &cat));
    let kinds: Vec<OpKind> = replan.operations.iter().map(|o| o.kind()).collect();
    assert_eq!(
        kinds,
        vec![OpKind::UpdateLabels, OpKind::SetSteps, OpKind::MoveTestToFolder]
    );
    h.execute(&mut tracker, &replan, h.options(false));
    assert_converged(&mut tracker, &cat);
}

#[test]
fn closure_transitions_listed_issues() {
    let mut cat = catalog(GREENFIELD);
    let mut tracker = MemoryTracker::default();
    tracker.insert_test("API-90", MemoryTest::new("Legacy flow"));
    cat.closure = Some(tre_core::catalog::Closure {
        target_status: "Closed".into(),
        issues: BTreeSet::from(["API-90".to_string()]),
    });

    let snap = snapshot(&mut tracker, &cat);
    let plan = plan::plan_with(
        &cat,
        &snap,
        &plan::PlanOptions {
            enable_closure: true,
            ..plan::PlanOptions::default()
        },
    );
    assert_eq!(
        plan.operations.last().map(|o| o.kind()),
        Some(OpKind::TransitionIssue)
    );
    let mut h = Harness::new();
    h.execute(&mut tracker, &plan, h.options(false));
    assert_eq!(tracker.test("API-90").unwrap().status, "Closed");
}
