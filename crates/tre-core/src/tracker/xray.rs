//! Blocking client for Xray Cloud GraphQL and Jira Cloud REST behind one
//! base URL and one bearer token.

use super::auth::{self, Credentials, TokenCache};
use super::retry::{RetryPolicy, Throttle};
use super::wire::{self, FolderData, GraphqlResponse, PreconditionsData, TestsData};
use super::{
    jql_quote, BatchOutcome, FieldPatch, PreconditionSnapshot, PreconditionSpec, TestSnapshot,
    TestSpec, Token, Tracker, TrackerCapabilities,
};
use crate::catalog::Step;
use crate::config::Config;
use crate::error::{Result, TreError};
use crate::text;
use chrono::Utc;
use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

const AUTHENTICATE_PATH: &str = "/api/v1/authenticate";
const GRAPHQL_PATH: &str = "/api/v2/graphql";

/// Xray caps `limit` on paged queries.
const MAX_PAGE_SIZE: u32 = 100;

pub struct XrayClient {
    http: reqwest::blocking::Client,
    base_url: String,
    project: String,
    credentials: Credentials,
    tokens: TokenCache,
    throttle: Throttle,
    retry: RetryPolicy,
    issue_ids: HashMap<String, String>,
    project_ids: HashMap<String, String>,
    attempts: u32,
}

impl XrayClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("tre/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TreError::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.tracker_base_url.trim_end_matches('/').to_string(),
            project: config.project_key.clone(),
            credentials: Credentials {
                client_id: config.auth_client_id.clone(),
                client_secret: config.auth_client_secret.clone(),
            },
            tokens: TokenCache::default(),
            throttle: Throttle::new(config.rate_limit_rps),
            retry: RetryPolicy::default().with_max_attempts(config.retry_max_attempts),
            issue_ids: HashMap::new(),
            project_ids: HashMap::new(),
            attempts: 0,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn note_attempts(&mut self, attempts: u32) {
        self.attempts = self.attempts.max(attempts);
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        bearer: Option<&str>,
    ) -> Result<String> {
        let mut req = self.http.request(method.clone(), url);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().map_err(transport_error)?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let text = resp.text().map_err(transport_error)?;
        if (200..300).contains(&status) {
            Ok(text)
        } else {
            Err(status_error(status, retry_after, &text))
        }
    }

    fn acquire_token(&mut self) -> Result<Token> {
        let url = format!("{}{AUTHENTICATE_PATH}", self.base_url);
        let body = serde_json::to_value(&self.credentials)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.throttle.wait();
            match self.send_once(&Method::POST, &url, Some(&body), None) {
                Ok(text) => {
                    let value = auth::parse_token_body(&text).ok_or_else(|| {
                        TreError::Auth("authenticate returned an empty token".into())
                    })?;
                    info!(client_id = %self.credentials.client_id, "authenticated with tracker");
                    return Ok(self.tokens.store(value, Utc::now()));
                }
                Err(e) if e.is_retriable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, retry_after(&e));
                    warn!(attempt, kind = %e.kind(), ?delay, "retrying authentication");
                    std::thread::sleep(delay);
                }
                Err(e) if e.is_retriable() => {
                    return Err(TreError::RetryExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    })
                }
                Err(e) => return Err(TreError::Auth(format!("credentials rejected: {e}"))),
            }
        }
    }

    fn bearer(&mut self) -> Result<String> {
        if let Some(value) = self.tokens.valid_at(Utc::now()) {
            return Ok(value.to_string());
        }
        Ok(self.acquire_token()?.value)
    }

    fn send(&mut self, method: Method, path: &str, body: Option<&Value>) -> Result<String> {
        self.send_with(method, path, body, |text| Ok(text.to_string()))
    }

    /// One logical request: throttled, authenticated, retried. `accept` reads
    /// a 2xx body; a retriable error it returns (GraphQL throttling, a
    /// truncated payload) backs off like an HTTP 429 or 5xx. A 401 triggers a
    /// single re-authentication before it is reported.
    fn send_with<R>(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        accept: impl Fn(&str) -> Result<R>,
    ) -> Result<R> {
        let url = format!("{}{path}", self.base_url);
        let mut attempt = 0;
        let mut refreshed = false;
        loop {
            attempt += 1;
            let token = self.bearer()?;
            self.throttle.wait();
            let outcome = self
                .send_once(&method, &url, body, Some(&token))
                .and_then(|text| accept(&text));
            debug!(%method, path, attempt, ok = outcome.is_ok(), "tracker request");
            match outcome {
                Ok(value) => {
                    self.note_attempts(attempt);
                    return Ok(value);
                }
                Err(TreError::Auth(_)) if !refreshed => {
                    debug!("token rejected, re-authenticating");
                    self.tokens.invalidate();
                    refreshed = true;
                }
                Err(e) if e.is_retriable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt, retry_after(&e));
                    warn!(path, attempt, kind = %e.kind(), ?delay, "retrying tracker request");
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    self.note_attempts(attempt);
                    if e.is_retriable() {
                        return Err(TreError::RetryExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    return Err(e);
                }
            }
        }
    }

    fn graphql<T: DeserializeOwned>(&mut self, query: &str, variables: Value) -> Result<T> {
        let body = json!({ "query": query, "variables": variables });
        self.send_with(Method::POST, GRAPHQL_PATH, Some(&body), decode_graphql::<T>)
    }

    fn jira_get<T: DeserializeOwned>(&mut self, path: &str) -> Result<T> {
        self.send_with(Method::GET, path, None, |text| {
            serde_json::from_str(text).map_err(malformed)
        })
    }

    // -----------------------------------------------------------------------
    // Id resolution
    // -----------------------------------------------------------------------

    fn issue_id(&mut self, key: &str) -> Result<String> {
        if let Some(id) = self.issue_ids.get(key) {
            return Ok(id.clone());
        }
        let issue: wire::IssueRef = self.jira_get(&format!("/rest/api/3/issue/{key}?fields=summary"))?;
        self.issue_ids.insert(key.to_string(), issue.id.clone());
        Ok(issue.id)
    }

    fn project_id(&mut self, project: &str) -> Result<String> {
        if let Some(id) = self.project_ids.get(project) {
            return Ok(id.clone());
        }
        let p: wire::ProjectRef = self.jira_get(&format!("/rest/api/3/project/{project}"))?;
        self.project_ids.insert(project.to_string(), p.id.clone());
        Ok(p.id)
    }

    fn remember_created(&mut self, data: &Value, pointer: &str) -> Result<String> {
        let node = data
            .pointer(pointer)
            .ok_or_else(|| malformed("create response without issue"))?;
        let key = node
            .pointer("/jira/key")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("create response without issue key"))?
            .to_string();
        if let Some(id) = node.get("issueId").and_then(Value::as_str) {
            self.issue_ids.insert(key.clone(), id.to_string());
        }
        Ok(key)
    }

    // -----------------------------------------------------------------------
    // Paging
    // -----------------------------------------------------------------------

    fn fetch_test_page(&mut self, jql: &str, limit: u32, start: usize) -> Result<(usize, Vec<TestSnapshot>)> {
        let data: TestsData = self.graphql(
            wire::SEARCH_TESTS,
            json!({ "jql": jql, "limit": limit, "start": start }),
        )?;
        let page = data.get_tests;
        let mut out = Vec::with_capacity(page.results.len());
        for node in page.results {
            self.issue_ids.extend(node.issue_ids());
            out.push(node.into_snapshot());
        }
        Ok((page.total, out))
    }

    fn fetch_precondition_page(
        &mut self,
        jql: &str,
        limit: u32,
        start: usize,
    ) -> Result<(usize, Vec<PreconditionSnapshot>)> {
        let data: PreconditionsData = self.graphql(
            wire::SEARCH_PRECONDITIONS,
            json!({ "jql": jql, "limit": limit, "start": start }),
        )?;
        let page = data.get_preconditions;
        let mut out = Vec::with_capacity(page.results.len());
        for node in page.results {
            self.issue_ids
                .insert(node.jira.key.clone(), node.issue_id.clone());
            out.push(node.into_snapshot());
        }
        Ok((page.total, out))
    }

    // -----------------------------------------------------------------------
    // Uniqueness lookups
    // -----------------------------------------------------------------------

    fn find_existing_test(&mut self, summary: &str) -> Result<Option<String>> {
        let jql = format!(
            "project = \"{}\" AND issuetype = Test AND summary ~ {}",
            self.project,
            jql_quote(&search_phrase(summary))
        );
        let target = text::fold(summary);
        let hits: Vec<TestSnapshot> = self.search_tests(&jql, MAX_PAGE_SIZE).collect::<Result<_>>()?;
        single_match(
            summary,
            hits.into_iter()
                .filter(|t| text::fold(&t.summary) == target)
                .map(|t| t.key),
        )
    }

    fn find_existing_precondition(&mut self, summary: &str) -> Result<Option<String>> {
        let jql = format!(
            "project = \"{}\" AND issuetype = Precondition AND summary ~ {}",
            self.project,
            jql_quote(&search_phrase(summary))
        );
        let target = text::fold(summary);
        let hits: Vec<PreconditionSnapshot> =
            self.search_preconditions(&jql, MAX_PAGE_SIZE).collect::<Result<_>>()?;
        single_match(
            summary,
            hits.into_iter()
                .filter(|p| text::fold(&p.summary) == target)
                .map(|p| p.key),
        )
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

impl Tracker for XrayClient {
    fn capabilities(&self) -> TrackerCapabilities {
        TrackerCapabilities {
            combined_create: true,
            bulk_folder_moves: true,
            idempotency_keys: false,
        }
    }

    fn authenticate(&mut self) -> Result<Token> {
        self.acquire_token()
    }

    fn search_tests<'a>(
        &'a mut self,
        jql: &str,
        page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<TestSnapshot>> + 'a> {
        Box::new(Pager::new(self, jql, page_size, XrayClient::fetch_test_page))
    }

    fn search_preconditions<'a>(
        &'a mut self,
        jql: &str,
        page_size: u32,
    ) -> Box<dyn Iterator<Item = Result<PreconditionSnapshot>> + 'a> {
        Box::new(Pager::new(
            self,
            jql,
            page_size,
            XrayClient::fetch_precondition_page,
        ))
    }

    fn list_folders(&mut self, project: &str) -> Result<BTreeSet<String>> {
        let project_id = self.project_id(project)?;
        let data: FolderData = self.graphql(
            wire::GET_FOLDER,
            json!({ "projectId": project_id, "path": "/" }),
        )?;
        let mut out = BTreeSet::new();
        if let Some(root) = data.get_folder {
            root.collect_paths(&mut out);
        }
        Ok(out)
    }

    fn get_steps(&mut self, test_key: &str) -> Result<Vec<Step>> {
        let data: TestsData = self.graphql(
            wire::TEST_STEPS,
            json!({ "jql": format!("key = {}", jql_quote(test_key)) }),
        )?;
        let node = data
            .get_tests
            .results
            .into_iter()
            .next()
            .ok_or_else(|| TreError::NotFound(format!("test {test_key}")))?;
        Ok(node.steps())
    }

    fn create_test(&mut self, spec: &TestSpec, _idempotency_key: Option<&str>) -> Result<String> {
        if let Some(key) = self.find_existing_test(&spec.summary)? {
            info!(key = %key, summary = %spec.summary, "test already exists, adopting");
            return Ok(key);
        }
        let mut vars = json!({
            "testType": { "name": spec.test_type.as_str() },
            "jira": { "fields": {
                "project": { "key": self.project },
                "summary": spec.summary,
                "description": spec.description,
                "issuetype": { "name": "Test" },
                "labels": spec.labels,
                "priority": { "name": spec.priority.as_str() },
            }},
        });
        if !spec.steps.is_empty() {
            vars["steps"] = steps_json(&spec.steps);
        }
        if let Some(path) = &spec.folder_path {
            vars["folderPath"] = json!(path);
        }
        match self.graphql::<Value>(wire::CREATE_TEST, vars) {
            Ok(data) => {
                log_warnings(&data, "/createTest/warnings");
                self.remember_created(&data, "/createTest/test")
            }
            Err(TreError::Conflict(msg)) => self
                .find_existing_test(&spec.summary)?
                .ok_or(TreError::Conflict(msg)),
            Err(e) => Err(e),
        }
    }

    fn create_precondition(
        &mut self,
        spec: &PreconditionSpec,
        _idempotency_key: Option<&str>,
    ) -> Result<String> {
        if let Some(key) = self.find_existing_precondition(&spec.summary)? {
            info!(key = %key, summary = %spec.summary, "precondition already exists, adopting");
            return Ok(key);
        }
        let vars = json!({
            "preconditionType": { "name": "Manual" },
            "definition": spec.definition,
            "jira": { "fields": {
                "project": { "key": self.project },
                "summary": spec.summary,
                "issuetype": { "name": "Precondition" },
                "labels": spec.labels,
            }},
        });
        match self.graphql::<Value>(wire::CREATE_PRECONDITION, vars) {
            Ok(data) => {
                log_warnings(&data, "/createPrecondition/warnings");
                self.remember_created(&data, "/createPrecondition/precondition")
            }
            Err(TreError::Conflict(msg)) => self
                .find_existing_precondition(&spec.summary)?
                .ok_or(TreError::Conflict(msg)),
            Err(e) => Err(e),
        }
    }

    fn update_issue(&mut self, key: &str, patch: &FieldPatch) -> Result<()> {
        let mut fields = serde_json::Map::new();
        if let Some(labels) = &patch.labels {
            fields.insert("labels".into(), json!(labels));
        }
        if let Some(priority) = patch.priority {
            fields.insert("priority".into(), json!({ "name": priority.as_str() }));
        }
        if fields.is_empty() {
            return Ok(());
        }
        let body = json!({ "fields": fields });
        self.send(Method::PUT, &format!("/rest/api/3/issue/{key}"), Some(&body))?;
        Ok(())
    }

    fn set_steps(&mut self, test_key: &str, steps: &[Step]) -> Result<()> {
        let issue_id = self.issue_id(test_key)?;
        self.graphql::<Value>(wire::REMOVE_ALL_STEPS, json!({ "issueId": issue_id }))?;
        for step in steps {
            self.graphql::<Value>(
                wire::ADD_STEP,
                json!({
                    "issueId": issue_id,
                    "step": { "action": step.action, "data": step.data, "result": step.result },
                }),
            )?;
        }
        Ok(())
    }

    fn add_precondition_link(&mut self, test_key: &str, precondition_key: &str) -> Result<()> {
        let test_id = self.issue_id(test_key)?;
        let pre_id = self.issue_id(precondition_key)?;
        let data: Value = self.graphql(
            wire::ADD_PRECONDITIONS,
            json!({ "issueId": test_id, "preconditionIssueIds": [pre_id] }),
        )?;
        if let Some(w) = data
            .pointer("/addPreconditionsToTest/warning")
            .and_then(Value::as_str)
        {
            warn!(test_key, precondition_key, warning = w, "tracker warning");
        }
        Ok(())
    }

    fn remove_precondition_link(
        &mut self,
        test_key: &str,
        precondition_key: &str,
    ) -> Result<()> {
        let test_id = self.issue_id(test_key)?;
        let pre_id = self.issue_id(precondition_key)?;
        self.graphql::<Value>(
            wire::REMOVE_PRECONDITIONS,
            json!({ "issueId": test_id, "preconditionIssueIds": [pre_id] }),
        )?;
        Ok(())
    }

    fn move_test_to_folder(&mut self, test_key: &str, path: &str) -> Result<()> {
        let issue_id = self.issue_id(test_key)?;
        self.graphql::<Value>(
            wire::UPDATE_TEST_FOLDER,
            json!({ "issueId": issue_id, "folderPath": path }),
        )?;
        Ok(())
    }

    fn move_tests_to_folder(&mut self, path: &str, test_keys: &[String]) -> BatchOutcome {
        let mut outcome: BatchOutcome = Vec::with_capacity(test_keys.len());
        let mut resolved = Vec::new();
        let mut ids = Vec::new();
        for key in test_keys {
            match self.issue_id(key) {
                Ok(id) => {
                    resolved.push(key.clone());
                    ids.push(id);
                }
                Err(e) => outcome.push((key.clone(), Err(e))),
            }
        }
        if !ids.is_empty() {
            let project = self.project.clone();
            let result = self.project_id(&project).and_then(|project_id| {
                self.graphql::<Value>(
                    wire::ADD_TESTS_TO_FOLDER,
                    json!({ "projectId": project_id, "path": path, "testIssueIds": ids }),
                )
            });
            match result {
                Ok(data) => {
                    log_warnings(&data, "/addTestsToFolder/warnings");
                    outcome.extend(resolved.into_iter().map(|k| (k, Ok(()))));
                }
                Err(e) if e.is_fatal() => {
                    outcome.extend(resolved.into_iter().map(|k| (k, Err(e.replicate()))));
                }
                Err(e) => {
                    warn!(path, error = %e, "bulk folder move failed, moving one by one");
                    for key in resolved {
                        let r = self.move_test_to_folder(&key, path);
                        outcome.push((key, r));
                    }
                }
            }
        }
        outcome.sort_by_key(|(k, _)| test_keys.iter().position(|t| t == k));
        outcome
    }

    fn create_folder(&mut self, path: &str) -> Result<()> {
        let project = self.project.clone();
        let project_id = self.project_id(&project)?;
        match self.graphql::<Value>(
            wire::CREATE_FOLDER,
            json!({ "projectId": project_id, "path": path }),
        ) {
            Ok(_) => Ok(()),
            Err(TreError::Conflict(_)) => {
                debug!(path, "folder already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn transition_issue(&mut self, key: &str, target_status: &str) -> Result<()> {
        let issue: wire::IssueRef = self.jira_get(&format!("/rest/api/3/issue/{key}?fields=status"))?;
        self.issue_ids.insert(key.to_string(), issue.id.clone());
        let current = issue
            .fields
            .and_then(|f| f.status)
            .map(|s| s.name)
            .unwrap_or_default();
        if current.eq_ignore_ascii_case(target_status) {
            debug!(key, status = %current, "already in target status");
            return Ok(());
        }
        let path = format!("/rest/api/3/issue/{key}/transitions");
        let transitions: wire::Transitions = self.jira_get(&path)?;
        let id = transitions
            .find(target_status)
            .map(|t| t.id.clone())
            .ok_or_else(|| {
                TreError::Rejected(format!(
                    "no transition from '{current}' to '{target_status}' for {key}"
                ))
            })?;
        self.send(Method::POST, &path, Some(&json!({ "transition": { "id": id } })))?;
        Ok(())
    }

    fn take_attempts(&mut self) -> u32 {
        std::mem::take(&mut self.attempts).max(1)
    }
}

// ---------------------------------------------------------------------------
// Pager
// ---------------------------------------------------------------------------

type FetchPage<T> = fn(&mut XrayClient, &str, u32, usize) -> Result<(usize, Vec<T>)>;

/// Pulls one page at a time as the caller consumes items. Stops at the
/// reported total, on an empty page, or after yielding an error.
struct Pager<'a, T> {
    client: &'a mut XrayClient,
    jql: String,
    limit: u32,
    start: usize,
    total: Option<usize>,
    buffer: std::vec::IntoIter<T>,
    done: bool,
    fetch: FetchPage<T>,
}

impl<'a, T> Pager<'a, T> {
    fn new(client: &'a mut XrayClient, jql: &str, page_size: u32, fetch: FetchPage<T>) -> Self {
        Self {
            client,
            jql: jql.to_string(),
            limit: page_size.clamp(1, MAX_PAGE_SIZE),
            start: 0,
            total: None,
            buffer: Vec::new().into_iter(),
            done: false,
            fetch,
        }
    }
}

impl<T> Iterator for Pager<'_, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        loop {
            if let Some(item) = self.buffer.next() {
                return Some(Ok(item));
            }
            if self.done || self.total.is_some_and(|total| self.start >= total) {
                return None;
            }
            match (self.fetch)(&mut *self.client, &self.jql, self.limit, self.start) {
                Ok((total, items)) => {
                    debug!(start = self.start, fetched = items.len(), total, "page");
                    self.total = Some(total);
                    if items.is_empty() {
                        self.done = true;
                        return None;
                    }
                    self.start += items.len();
                    self.buffer = items.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn transport_error(e: reqwest::Error) -> TreError {
    if e.is_timeout() {
        TreError::Network("request timed out".into())
    } else if e.is_connect() {
        TreError::Network(format!("connection failed: {e}"))
    } else {
        TreError::Network(e.to_string())
    }
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

fn status_error(status: u16, retry_after: Option<u64>, body: &str) -> TreError {
    let detail = format!("HTTP {status}: {}", snippet(body));
    match status {
        401 => TreError::Auth(detail),
        403 => TreError::Permission(detail),
        404 => TreError::NotFound(detail),
        409 => TreError::Conflict(detail),
        429 => TreError::RateLimited {
            retry_after_secs: retry_after,
        },
        500..=599 => TreError::TransientServer {
            status,
            message: snippet(body),
        },
        _ => TreError::Rejected(detail),
    }
}

fn retry_after(e: &TreError) -> Option<Duration> {
    match e {
        TreError::RateLimited {
            retry_after_secs: Some(secs),
        } => Some(Duration::from_secs(*secs)),
        _ => None,
    }
}

/// Xray answers 200 with `errors[]` for most failures, throttling included.
fn decode_graphql<T: DeserializeOwned>(text: &str) -> Result<T> {
    let resp: GraphqlResponse<T> = serde_json::from_str(text).map_err(malformed)?;
    if !resp.errors.is_empty() {
        return Err(wire::classify_graphql_errors(&resp.errors));
    }
    resp.data
        .ok_or_else(|| malformed("GraphQL response without data"))
}

fn malformed(e: impl std::fmt::Display) -> TreError {
    TreError::TransientServer {
        status: 200,
        message: format!("malformed response: {e}"),
    }
}

fn steps_json(steps: &[Step]) -> Value {
    Value::Array(
        steps
            .iter()
            .map(|s| json!({ "action": s.action, "data": s.data, "result": s.result }))
            .collect(),
    )
}

fn log_warnings(data: &Value, pointer: &str) {
    if let Some(warnings) = data.pointer(pointer).and_then(Value::as_array) {
        for w in warnings.iter().filter_map(Value::as_str) {
            warn!(warning = w, "tracker warning");
        }
    }
}

/// Jira text search chokes on its reserved characters; the lookup only needs
/// the words, exact matching happens afterwards.
fn search_phrase(summary: &str) -> String {
    let cleaned: String = summary
        .chars()
        .map(|c| {
            if "+-&|!(){}[]^~*?\\:\"'/".contains(c) {
                ' '
            } else {
                c
            }
        })
        .collect();
    text::collapse_whitespace(&cleaned)
}

fn single_match(summary: &str, keys: impl Iterator<Item = String>) -> Result<Option<String>> {
    let keys: Vec<String> = keys.collect();
    match keys.len() {
        0 => Ok(None),
        1 => Ok(keys.into_iter().next()),
        _ => Err(TreError::Conflict(format!(
            "{} issues share the summary '{summary}': {}",
            keys.len(),
            keys.join(", ")
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
