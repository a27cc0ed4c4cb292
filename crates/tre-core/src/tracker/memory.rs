//! In-process tracker holding issues and folders in maps.
//!
//! Mirrors the contract of the real client closely enough to rehearse whole
//! runs: parents must exist before children, bulk calls report per target,
//! and faults can be injected per call and target.

use super::{
    BatchOutcome, FieldPatch, PreconditionSnapshot, PreconditionSpec, TestSnapshot, TestSpec,
    Token, Tracker, TrackerCapabilities,
};
use crate::catalog::Step;
use crate::error::{ErrorKind, Result, TreError};
use crate::inventory::LiveSnapshot;
use crate::text;
use crate::types::{Priority, TestType};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

pub const DEFAULT_STATUS: &str = "Open";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTest {
    pub summary: String,
    #[serde(default)]
    pub description: String,
    pub test_type: TestType,
    pub priority: Priority,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default = "root")]
    pub folder_path: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub preconditions: BTreeSet<String>,
    #[serde(default = "open")]
    pub status: String,
}

fn root() -> String {
    "/".to_string()
}

fn open() -> String {
    DEFAULT_STATUS.to_string()
}

impl MemoryTest {
    pub fn new(summary: &str) -> Self {
        Self {
            summary: summary.to_string(),
            description: String::new(),
            test_type: TestType::Manual,
            priority: Priority::Medium,
            labels: BTreeSet::new(),
            folder_path: root(),
            steps: Vec::new(),
            preconditions: BTreeSet::new(),
            status: open(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPrecondition {
    pub summary: String,
    #[serde(default)]
    pub definition: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default = "open")]
    pub status: String,
}

impl MemoryPrecondition {
    pub fn new(summary: &str, definition: &str) -> Self {
        Self {
            summary: summary.to_string(),
            definition: definition.to_string(),
            labels: BTreeSet::new(),
            status: open(),
        }
    }
}

/// Injected misbehavior for one call name and target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail every time with this kind.
    Fail(ErrorKind),
    /// Behave as if the first `n` attempts hit retriable errors. Succeeds
    /// when `n` is below the retry budget, otherwise retries run out.
    Flaky(u32),
}

#[derive(Debug)]
pub struct MemoryTracker {
    prefix: String,
    tests: BTreeMap<String, MemoryTest>,
    preconditions: BTreeMap<String, MemoryPrecondition>,
    folders: BTreeSet<String>,
    capabilities: TrackerCapabilities,
    faults: HashMap<(String, String), Fault>,
    idempotency: HashMap<String, String>,
    max_attempts: u32,
    next_seq: u64,
    attempts: u32,
    calls: Vec<String>,
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new("API")
    }
}

impl MemoryTracker {
    /// Issue keys are minted as `<prefix>-<n>`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            tests: BTreeMap::new(),
            preconditions: BTreeMap::new(),
            folders: BTreeSet::new(),
            capabilities: TrackerCapabilities {
                combined_create: true,
                bulk_folder_moves: true,
                idempotency_keys: true,
            },
            faults: HashMap::new(),
            idempotency: HashMap::new(),
            max_attempts: 5,
            next_seq: 0,
            attempts: 0,
            calls: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: TrackerCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    // -----------------------------------------------------------------------
    // Seeding and inspection
    // -----------------------------------------------------------------------

    pub fn insert_test(&mut self, key: &str, test: MemoryTest) {
        self.tests.insert(key.to_string(), test);
    }

    pub fn insert_precondition(&mut self, key: &str, precondition: MemoryPrecondition) {
        self.preconditions.insert(key.to_string(), precondition);
    }

    /// Adds the folder and its ancestors.
    pub fn insert_folder(&mut self, path: &str) {
        for p in text::folder_lineage(path) {
            self.folders.insert(p);
        }
    }

    pub fn test(&self, key: &str) -> Option<&MemoryTest> {
        self.tests.get(key)
    }

    pub fn precondition(&self, key: &str) -> Option<&MemoryPrecondition> {
        self.preconditions.get(key)
    }

    pub fn tests(&self) -> &BTreeMap<String, MemoryTest> {
        &self.tests
    }

    pub fn preconditions(&self) -> &BTreeMap<String, MemoryPrecondition> {
        &self.preconditions
    }

    pub fn folders(&self) -> &BTreeSet<String> {
        &self.folders
    }

    /// Seed from a captured snapshot, for rehearsing a plan offline. Steps
    /// that were never fetched are left empty.
    pub fn from_snapshot(snapshot: &LiveSnapshot) -> Self {
        let mut m = Self::new(&snapshot.project);
        for path in &snapshot.folders {
            m.insert_folder(path);
        }
        for (key, t) in &snapshot.tests {
            m.insert_test(
                key,
                MemoryTest {
                    summary: t.summary.clone(),
                    description: String::new(),
                    test_type: t.test_type.unwrap_or(TestType::Manual),
                    priority: t.priority.unwrap_or(Priority::Medium),
                    labels: t.labels.clone(),
                    folder_path: t.folder_path.clone(),
                    steps: t.steps.clone().unwrap_or_default(),
                    preconditions: t.precondition_keys.clone(),
                    status: t.status.clone().unwrap_or_else(open),
                },
            );
        }
        for (key, p) in &snapshot.preconditions {
            m.insert_precondition(
                key,
                MemoryPrecondition {
                    summary: p.summary.clone(),
                    definition: p.definition.clone(),
                    labels: p.labels.clone(),
                    status: p.status.clone().unwrap_or_else(open),
                },
            );
        }
        m
    }

    /// Key of the test or precondition with this summary, if any.
    pub fn key_for_summary(&self, summary: &str) -> Option<String> {
        let target = text::fold(summary);
        self.tests
            .iter()
            .find(|(_, t)| text::fold(&t.summary) == target)
            .map(|(k, _)| k.clone())
            .or_else(|| {
                self.preconditions
                    .iter()
                    .find(|(_, p)| text::fold(&p.summary) == target)
                    .map(|(k, _)| k.clone())
            })
    }

    /// Mutating calls in the order they were accepted, as `call:target`.
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn inject(&mut self, call: &str, target: &str, fault: Fault) {
        self.faults
            .insert((call.to_string(), target.to_string()), fault);
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Apply any injected fault for `call` on `target` (or on `*`), then
    /// record the call.
    fn enter(&mut self, call: &str, target: &str) -> Result<()> {
        let fault = self
            .faults
            .get(&(call.to_string(), target.to_string()))
            .or_else(|| self.faults.get(&(call.to_string(), "*".to_string())))
            .copied();
        match fault {
            Some(Fault::Fail(kind)) => {
                self.attempts = self.attempts.max(1);
                return Err(error_of(kind, &format!("{call} {target}")));
            }
            Some(Fault::Flaky(failures)) if failures >= self.max_attempts => {
                self.attempts = self.attempts.max(self.max_attempts);
                return Err(TreError::RetryExhausted {
                    attempts: self.max_attempts,
                    last: Box::new(TreError::RateLimited {
                        retry_after_secs: None,
                    }),
                });
            }
            Some(Fault::Flaky(failures)) => {
                self.attempts = self.attempts.max(failures + 1);
            }
            None => {
                self.attempts = self.attempts.max(1);
            }
        }
        self.calls.push(format!("{call}:{target}"));
        Ok(())
    }

    fn next_key(&mut self) -> String {
        loop {
            self.next_seq += 1;
            let key = format!("{}-{}", self.prefix, self.next_seq);
            if !self.tests.contains_key(&key) && !self.preconditions.contains_key(&key) {
                return key;
            }
        }
    }

    fn folder_exists(&self, path: &str) -> bool {
        path == "/" || self.folders.contains(path)
    }

    fn test_mut(&mut self, key: &str) -> Result<&mut MemoryTest> {
        self.tests
            .get_mut(key)
            .ok_or_else(|| TreError::NotFound(format!("test {key}")))
    }

    fn test_snapshot(key: &str, t: &MemoryTest) -> TestSnapshot {
        TestSnapshot {
            key: key.to_string(),
            summary: t.summary.clone(),
            status: Some(t.status.clone()),
            labels: t.labels.clone(),
            priority: Some(t.priority),
            test_type: Some(t.test_type),
            folder_path: t.folder_path.clone(),
            precondition_keys: t.preconditions.clone(),
            step_count: t.steps.len(),
        }
    }
}

fn error_of(kind: ErrorKind, context: &str) -> TreError {
    let msg = format!("injected {kind} on {context}");
    match kind {
        ErrorKind::ConfigError => TreError::Config(msg),
        ErrorKind::ValidationError => TreError::Rejected(msg),
        ErrorKind::AuthError => TreError::Auth(msg),
        ErrorKind::PermissionError => TreError::Permission(msg),
        ErrorKind::NotFound => TreError::NotFound(msg),
        ErrorKind::Conflict => TreError::Conflict(msg),
        ErrorKind::RateLimited => TreError::RateLimited {
            retry_after_secs: None,
        },
        ErrorKind::TransientServerError => TreError::TransientServer {
            status: 503,
            message: msg,
        },
        ErrorKind::NetworkError => TreError::Network(msg),
        ErrorKind::RetryExhausted => TreError::RetryExhausted {
            attempts: 1,
            last: Box::new(TreError::Network(msg)),
        },
        ErrorKind::DependencyMissing => TreError::DependencyMissing(msg),
        ErrorKind::InternalError => TreError::Internal(msg),
    }
}

impl Tracker for MemoryTracker {
    fn capabilities(&self) -> TrackerCapabilities {
        self.capabilities
    }

    fn authenticate(&mut self) -> Result<Token> {
        self.enter("authenticate", "*")?;
        Ok(Token {
            value: "memory".into(),
            expires_at: Utc::now() + Duration::minutes(60),
        })
    }

    fn search_tests<'a>(
        &'a mut self,
        _jql: &str,
        _page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<TestSnapshot>> + 'a> {
        if let Err(e) = self.enter("search_tests", "*") {
            return Box::new(std::iter::once(Err(e)));
        }
        Box::new(
            self.tests
                .iter()
                .map(|(k, t)| Ok(Self::test_snapshot(k, t))),
        )
    }

    fn search_preconditions<'a>(
        &'a mut self,
        _jql: &str,
        _page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<PreconditionSnapshot>> + 'a> {
        if let Err(e) = self.enter("search_preconditions", "*") {
            return Box::new(std::iter::once(Err(e)));
        }
        Box::new(self.preconditions.iter().map(|(k, p)| {
            Ok(PreconditionSnapshot {
                key: k.clone(),
                summary: p.summary.clone(),
                definition: p.definition.clone(),
                status: Some(p.status.clone()),
                labels: p.labels.clone(),
            })
        }))
    }

    fn list_folders(&mut self, _project: &str) -> Result<BTreeSet<String>> {
        self.enter("list_folders", "*")?;
        Ok(self.folders.clone())
    }

    fn get_steps(&mut self, test_key: &str) -> Result<Vec<Step>> {
        self.enter("get_steps", test_key)?;
        self.tests
            .get(test_key)
            .map(|t| t.steps.clone())
            .ok_or_else(|| TreError::NotFound(format!("test {test_key}")))
    }

    fn create_test(&mut self, spec: &TestSpec, idempotency_key: Option<&str>) -> Result<String> {
        self.enter("create_test", &spec.summary)?;
        if let Some(existing) = idempotency_key.and_then(|k| self.idempotency.get(k)) {
            debug!(key = %existing, "idempotent replay of create_test");
            return Ok(existing.clone());
        }
        let folder = spec.folder_path.clone().unwrap_or_else(root);
        if !self.folder_exists(&folder) {
            return Err(TreError::NotFound(format!("folder {folder}")));
        }
        let key = self.next_key();
        self.tests.insert(
            key.clone(),
            MemoryTest {
                summary: spec.summary.clone(),
                description: spec.description.clone(),
                test_type: spec.test_type,
                priority: spec.priority,
                labels: spec.labels.iter().cloned().collect(),
                folder_path: folder,
                steps: spec.steps.clone(),
                preconditions: BTreeSet::new(),
                status: open(),
            },
        );
        if let Some(k) = idempotency_key {
            self.idempotency.insert(k.to_string(), key.clone());
        }
        Ok(key)
    }

    fn create_precondition(
        &mut self,
        spec: &PreconditionSpec,
        idempotency_key: Option<&str>,
    ) -> Result<String> {
        self.enter("create_precondition", &spec.summary)?;
        if let Some(existing) = idempotency_key.and_then(|k| self.idempotency.get(k)) {
            return Ok(existing.clone());
        }
        let key = self.next_key();
        self.preconditions.insert(
            key.clone(),
            MemoryPrecondition {
                summary: spec.summary.clone(),
                definition: spec.definition.clone(),
                labels: spec.labels.iter().cloned().collect(),
                status: open(),
            },
        );
        if let Some(k) = idempotency_key {
            self.idempotency.insert(k.to_string(), key.clone());
        }
        Ok(key)
    }

    fn update_issue(&mut self, key: &str, patch: &FieldPatch) -> Result<()> {
        self.enter("update_issue", key)?;
        if let Some(test) = self.tests.get_mut(key) {
            if let Some(labels) = &patch.labels {
                test.labels = labels.iter().cloned().collect();
            }
            if let Some(priority) = patch.priority {
                test.priority = priority;
            }
            return Ok(());
        }
        if let Some(pre) = self.preconditions.get_mut(key) {
            if let Some(labels) = &patch.labels {
                pre.labels = labels.iter().cloned().collect();
            }
            return Ok(());
        }
        Err(TreError::NotFound(format!("issue {key}")))
    }

    fn set_steps(&mut self, test_key: &str, steps: &[Step]) -> Result<()> {
        self.enter("set_steps", test_key)?;
        self.test_mut(test_key)?.steps = steps.to_vec();
        Ok(())
    }

    fn add_precondition_link(&mut self, test_key: &str, precondition_key: &str) -> Result<()> {
        self.enter("add_precondition_link", test_key)?;
        if !self.preconditions.contains_key(precondition_key) {
            return Err(TreError::NotFound(format!("precondition {precondition_key}")));
        }
        self.test_mut(test_key)?
            .preconditions
            .insert(precondition_key.to_string());
        Ok(())
    }

    fn remove_precondition_link(
        &mut self,
        test_key: &str,
        precondition_key: &str,
    ) -> Result<()> {
        self.enter("remove_precondition_link", test_key)?;
        self.test_mut(test_key)?
            .preconditions
            .remove(precondition_key);
        Ok(())
    }

    fn move_test_to_folder(&mut self, test_key: &str, path: &str) -> Result<()> {
        self.enter("move_test_to_folder", test_key)?;
        if !self.folder_exists(path) {
            return Err(TreError::NotFound(format!("folder {path}")));
        }
        self.test_mut(test_key)?.folder_path = path.to_string();
        Ok(())
    }

    fn move_tests_to_folder(&mut self, path: &str, test_keys: &[String]) -> BatchOutcome {
        test_keys
            .iter()
            .map(|key| (key.clone(), self.move_test_to_folder(key, path)))
            .collect()
    }

    fn create_folder(&mut self, path: &str) -> Result<()> {
        self.enter("create_folder", path)?;
        if self.folders.contains(path) {
            return Ok(());
        }
        let lineage = text::folder_lineage(path);
        if let Some(parent) = lineage.iter().rev().nth(1) {
            if !self.folders.contains(parent) {
                return Err(TreError::NotFound(format!("parent folder {parent}")));
            }
        }
        self.folders.insert(path.to_string());
        Ok(())
    }

    fn transition_issue(&mut self, key: &str, target_status: &str) -> Result<()> {
        self.enter("transition_issue", key)?;
        if let Some(t) = self.tests.get_mut(key) {
            t.status = target_status.to_string();
            return Ok(());
        }
        if let Some(p) = self.preconditions.get_mut(key) {
            p.status = target_status.to_string();
            return Ok(());
        }
        Err(TreError::NotFound(format!("issue {key}")))
    }

    fn take_attempts(&mut self) -> u32 {
        std::mem::take(&mut self.attempts).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(summary: &str, folder: Option<&str>) -> TestSpec {
        TestSpec {
            summary: summary.into(),
            description: String::new(),
            test_type: TestType::Manual,
            priority: Priority::High,
            labels: vec!["ui".into()],
            folder_path: folder.map(String::from),
            steps: vec![Step::new(1, "a", "", "r")],
        }
    }

    #[test]
    fn create_test_mints_sequential_keys() {
        let mut m = MemoryTracker::default();
        m.insert_test("API-1", MemoryTest::new("existing"));
        let key = m.create_test(&spec("new", None), None).unwrap();
        assert_eq!(key, "API-2");
        assert_eq!(m.test(&key).unwrap().steps.len(), 1);
    }

    #[test]
    fn idempotency_key_replays_creation() {
        let mut m = MemoryTracker::default();
        let a = m.create_test(&spec("x", None), Some("op-1")).unwrap();
        let b = m.create_test(&spec("x", None), Some("op-1")).unwrap();
        assert_eq!(a, b);
        assert_eq!(m.tests().len(), 1);
    }

    #[test]
    fn folders_need_parents() {
        let mut m = MemoryTracker::default();
        let err = m.create_folder("/A/B").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        m.create_folder("/A").unwrap();
        m.create_folder("/A/B").unwrap();
        m.create_folder("/A/B").unwrap();
        assert!(m.folders().contains("/A/B"));
    }

    #[test]
    fn filing_into_missing_folder_fails() {
        let mut m = MemoryTracker::default();
        let err = m.create_test(&spec("x", Some("/Nope")), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn flaky_calls_report_attempts() {
        let mut m = MemoryTracker::default();
        m.insert_test("API-1", MemoryTest::new("t"));
        m.inject("update_issue", "API-1", Fault::Flaky(3));
        m.update_issue("API-1", &FieldPatch::priority(Priority::Low))
            .unwrap();
        assert_eq!(m.take_attempts(), 4);
        assert_eq!(m.test("API-1").unwrap().priority, Priority::Low);
    }

    #[test]
    fn flaky_beyond_budget_exhausts() {
        let mut m = MemoryTracker::default().with_max_attempts(3);
        m.insert_test("API-1", MemoryTest::new("t"));
        m.inject("set_steps", "*", Fault::Flaky(3));
        let err = m.set_steps("API-1", &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert_eq!(m.take_attempts(), 3);
    }

    #[test]
    fn injected_failure_is_not_recorded_as_call() {
        let mut m = MemoryTracker::default();
        m.inject("create_folder", "/A", Fault::Fail(ErrorKind::PermissionError));
        assert!(m.create_folder("/A").is_err());
        assert!(m.calls().is_empty());
    }

    #[test]
    fn search_returns_snapshots() {
        let mut m = MemoryTracker::default();
        let mut t = MemoryTest::new("Login works");
        t.preconditions.insert("API-9".into());
        t.folder_path = "/Auth".into();
        m.insert_test("API-3", t);
        let found: Vec<TestSnapshot> = m.search_tests("", 50).collect::<Result<_>>().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].folder_path, "/Auth");
        assert!(found[0].precondition_keys.contains("API-9"));
        assert_eq!(m.key_for_summary("login works."), Some("API-3".into()));
    }

    #[test]
    fn seeded_from_snapshot() {
        let mut source = MemoryTracker::default();
        let mut t = MemoryTest::new("Checkout");
        t.folder_path = "/Shop/Cart".into();
        source.insert_folder("/Shop/Cart");
        source.insert_test("API-4", t);
        source.insert_precondition("API-5", MemoryPrecondition::new("Cart empty", "no items"));

        let snapshot = crate::inventory::InventoryLoader::new(&mut source, "API", 50)
            .load(None)
            .unwrap();
        let mut copy = MemoryTracker::from_snapshot(&snapshot);
        assert_eq!(copy.test("API-4").unwrap().folder_path, "/Shop/Cart");
        assert!(copy.folders().contains("/Shop"));
        assert_eq!(copy.preconditions().len(), 1);
        // Fresh keys never collide with seeded ones.
        let key = copy.create_test(&spec("new", None), None).unwrap();
        assert_eq!(key, "API-1");
    }
}
