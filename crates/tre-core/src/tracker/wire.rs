//! Xray GraphQL documents and the response shapes they decode into.

use super::{PreconditionSnapshot, TestSnapshot};
use crate::catalog::Step;
use crate::error::TreError;
use crate::text;
use crate::types::{Priority, TestType};
use serde::Deserialize;
use std::collections::BTreeSet;

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

pub const SEARCH_TESTS: &str = r#"query SearchTests($jql: String!, $limit: Int!, $start: Int!) {
  getTests(jql: $jql, limit: $limit, start: $start) {
    total start limit
    results {
      issueId
      testType { name }
      folder { path }
      steps { id }
      preconditions(limit: 100) { total results { issueId jira(fields: ["key"]) } }
      jira(fields: ["key", "summary", "labels", "priority", "status"])
    }
  }
}"#;

pub const SEARCH_PRECONDITIONS: &str = r#"query SearchPreconditions($jql: String!, $limit: Int!, $start: Int!) {
  getPreconditions(jql: $jql, limit: $limit, start: $start) {
    total start limit
    results { issueId definition jira(fields: ["key", "summary", "labels", "status"]) }
  }
}"#;

pub const TEST_STEPS: &str = r#"query TestSteps($jql: String!) {
  getTests(jql: $jql, limit: 1) {
    total
    results { issueId steps { id action data result } jira(fields: ["key"]) }
  }
}"#;

pub const GET_FOLDER: &str = r#"query GetFolder($projectId: String!, $path: String!) {
  getFolder(projectId: $projectId, path: $path) { name path folders }
}"#;

pub const CREATE_TEST: &str = r#"mutation CreateTest($testType: UpdateTestTypeInput, $steps: [CreateStepInput], $folderPath: String, $jira: JSON!) {
  createTest(testType: $testType, steps: $steps, folderPath: $folderPath, jira: $jira) {
    test { issueId jira(fields: ["key"]) }
    warnings
  }
}"#;

pub const CREATE_PRECONDITION: &str = r#"mutation CreatePrecondition($preconditionType: UpdatePreconditionTypeInput, $definition: String, $jira: JSON!) {
  createPrecondition(preconditionType: $preconditionType, definition: $definition, jira: $jira) {
    precondition { issueId jira(fields: ["key"]) }
    warnings
  }
}"#;

pub const REMOVE_ALL_STEPS: &str = r#"mutation RemoveAllTestSteps($issueId: String!) {
  removeAllTestSteps(issueId: $issueId)
}"#;

pub const ADD_STEP: &str = r#"mutation AddTestStep($issueId: String!, $step: CreateStepInput!) {
  addTestStep(issueId: $issueId, step: $step) { id }
}"#;

pub const ADD_PRECONDITIONS: &str = r#"mutation AddPreconditionsToTest($issueId: String!, $preconditionIssueIds: [String]!) {
  addPreconditionsToTest(issueId: $issueId, preconditionIssueIds: $preconditionIssueIds) {
    addedPreconditions
    warning
  }
}"#;

pub const REMOVE_PRECONDITIONS: &str = r#"mutation RemovePreconditionsFromTest($issueId: String!, $preconditionIssueIds: [String]!) {
  removePreconditionsFromTest(issueId: $issueId, preconditionIssueIds: $preconditionIssueIds)
}"#;

pub const UPDATE_TEST_FOLDER: &str = r#"mutation UpdateTestFolder($issueId: String!, $folderPath: String!) {
  updateTestFolder(issueId: $issueId, folderPath: $folderPath)
}"#;

pub const ADD_TESTS_TO_FOLDER: &str = r#"mutation AddTestsToFolder($projectId: String!, $path: String!, $testIssueIds: [String]!) {
  addTestsToFolder(projectId: $projectId, path: $path, testIssueIds: $testIssueIds) {
    folder { path }
    warnings
  }
}"#;

pub const CREATE_FOLDER: &str = r#"mutation CreateFolder($projectId: String!, $path: String!) {
  createFolder(projectId: $projectId, path: $path) {
    folder { path }
    warnings
  }
}"#;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GraphqlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
pub struct GraphqlError {
    pub message: String,
}

/// Xray reports most failures as `errors[]` with HTTP 200. Map them onto
/// the shared taxonomy by message.
pub fn classify_graphql_errors(errors: &[GraphqlError]) -> TreError {
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let lower = message.to_lowercase();
    if lower.contains("already exist") {
        TreError::Conflict(message)
    } else if lower.contains("not found") || lower.contains("does not exist") {
        TreError::NotFound(message)
    } else if lower.contains("permission")
        || lower.contains("not authorized")
        || lower.contains("forbidden")
    {
        TreError::Permission(message)
    } else if lower.contains("too many requests") || lower.contains("rate limit") {
        TreError::RateLimited {
            retry_after_secs: None,
        }
    } else {
        TreError::Rejected(message)
    }
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// `results` may be absent on an empty page. The explicit bound keeps serde
/// from requiring `T: Default` for the defaulted field.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct Page<T> {
    #[serde(default)]
    pub total: usize,
    #[serde(default)]
    pub results: Vec<T>,
}

#[derive(Debug, Deserialize)]
pub struct NameRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PathRef {
    pub path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct JiraFields {
    pub key: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub priority: Option<NameRef>,
    #[serde(default)]
    pub status: Option<NameRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNode {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedIssue {
    pub issue_id: String,
    pub jira: JiraFields,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    pub issue_id: String,
    #[serde(default)]
    pub test_type: Option<NameRef>,
    #[serde(default)]
    pub folder: Option<PathRef>,
    #[serde(default)]
    pub steps: Vec<StepNode>,
    #[serde(default)]
    pub preconditions: Option<Page<LinkedIssue>>,
    pub jira: JiraFields,
}

impl TestNode {
    /// Issue ids seen in this node, keyed by issue key.
    pub fn issue_ids(&self) -> Vec<(String, String)> {
        let mut ids = vec![(self.jira.key.clone(), self.issue_id.clone())];
        if let Some(pre) = &self.preconditions {
            ids.extend(
                pre.results
                    .iter()
                    .map(|p| (p.jira.key.clone(), p.issue_id.clone())),
            );
        }
        ids
    }

    pub fn into_snapshot(self) -> TestSnapshot {
        let precondition_keys: BTreeSet<String> = self
            .preconditions
            .map(|p| p.results.into_iter().map(|l| l.jira.key).collect())
            .unwrap_or_default();
        TestSnapshot {
            key: self.jira.key,
            summary: self.jira.summary.unwrap_or_default(),
            status: self.jira.status.map(|s| s.name),
            labels: self.jira.labels.into_iter().collect(),
            priority: self.jira.priority.and_then(|p| Priority::parse(&p.name)),
            test_type: self.test_type.and_then(|t| t.name.parse::<TestType>().ok()),
            folder_path: text::normalize_folder_path(
                self.folder.as_ref().map(|f| f.path.as_str()).unwrap_or("/"),
            ),
            precondition_keys,
            step_count: self.steps.len(),
        }
    }

    pub fn steps(&self) -> Vec<Step> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| {
                Step::new(
                    (i + 1) as u32,
                    s.action.clone().unwrap_or_default(),
                    s.data.clone().unwrap_or_default(),
                    s.result.clone().unwrap_or_default(),
                )
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreconditionNode {
    pub issue_id: String,
    #[serde(default)]
    pub definition: Option<String>,
    pub jira: JiraFields,
}

impl PreconditionNode {
    pub fn into_snapshot(self) -> PreconditionSnapshot {
        PreconditionSnapshot {
            key: self.jira.key,
            summary: self.jira.summary.unwrap_or_default(),
            definition: self.definition.unwrap_or_default(),
            status: self.jira.status.map(|s| s.name),
            labels: self.jira.labels.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestsData {
    pub get_tests: Page<TestNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreconditionsData {
    pub get_preconditions: Page<PreconditionNode>,
}

#[derive(Debug, Deserialize)]
pub struct FolderNode {
    pub path: String,
    #[serde(default)]
    pub folders: Vec<FolderNode>,
}

impl FolderNode {
    /// Every path in the tree below and including this node, root excluded.
    pub fn collect_paths(&self, out: &mut BTreeSet<String>) {
        let path = text::normalize_folder_path(&self.path);
        if path != "/" {
            out.insert(path);
        }
        for child in &self.folders {
            child.collect_paths(out);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderData {
    pub get_folder: Option<FolderNode>,
}

// ---------------------------------------------------------------------------
// Jira REST
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IssueRef {
    pub id: String,
    #[serde(default)]
    pub fields: Option<StatusFields>,
}

#[derive(Debug, Deserialize)]
pub struct StatusFields {
    #[serde(default)]
    pub status: Option<NameRef>,
}

#[derive(Debug, Deserialize)]
pub struct ProjectRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct Transitions {
    #[serde(default)]
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Deserialize)]
pub struct Transition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub to: Option<NameRef>,
}

impl Transitions {
    /// A transition whose destination (or, failing that, whose own name)
    /// matches `target`, case-insensitively.
    pub fn find(&self, target: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| {
                t.to
                    .as_ref()
                    .is_some_and(|to| to.name.eq_ignore_ascii_case(target))
            })
            .or_else(|| {
                self.transitions
                    .iter()
                    .find(|t| t.name.eq_ignore_ascii_case(target))
            })
    }
}
