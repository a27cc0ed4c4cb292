use crate::error::{Result, TreError};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const AUDIT_DIR: &str = "audit";
pub const CHECKPOINTS_DIR: &str = "checkpoints";

pub const JOURNAL_EXT: &str = "jsonl";
pub const SUMMARY_SUFFIX: &str = "summary.json";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `audit/<run_id>.jsonl`
pub fn journal_path(audit_dir: &Path, run_id: &str) -> PathBuf {
    audit_dir.join(format!("{run_id}.{JOURNAL_EXT}"))
}

/// `audit/<run_id>.summary.json`
pub fn summary_path(audit_dir: &Path, run_id: &str) -> PathBuf {
    audit_dir.join(format!("{run_id}.{SUMMARY_SUFFIX}"))
}

/// `checkpoints/<project>_<plan_hash>.json`
pub fn checkpoint_file(checkpoint_dir: &Path, project: &str, plan_hash: &str) -> PathBuf {
    checkpoint_dir.join(format!("{project}_{plan_hash}.json"))
}

/// `checkpoints/<project>_<plan_hash>.plan.json`, the plan a checkpoint
/// belongs to. Resuming re-executes this file rather than replanning.
pub fn plan_file(checkpoint_dir: &Path, project: &str, plan_hash: &str) -> PathBuf {
    checkpoint_dir.join(format!("{project}_{plan_hash}.plan.json"))
}

// ---------------------------------------------------------------------------
// Project key validation
// ---------------------------------------------------------------------------

static PROJECT_KEY_RE: OnceLock<Regex> = OnceLock::new();

fn project_key_re() -> &'static Regex {
    PROJECT_KEY_RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]{0,31}$").unwrap())
}

/// Jira project keys: uppercase, starting with a letter. They end up in file
/// names and JQL, so anything else is rejected up front.
pub fn validate_project_key(key: &str) -> Result<()> {
    if !project_key_re().is_match(key) {
        return Err(TreError::Config(format!(
            "invalid project key '{key}': expected uppercase letters, digits or '_'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_project_keys() {
        for key in ["FRAMED", "MLB", "A1", "QA_TOOLS"] {
            validate_project_key(key).unwrap_or_else(|_| panic!("expected valid: {key}"));
        }
    }

    #[test]
    fn invalid_project_keys() {
        for key in ["", "framed", "1ABC", "HAS SPACE", "A/B"] {
            assert!(validate_project_key(key).is_err(), "expected invalid: {key}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/run");
        assert_eq!(
            journal_path(&root.join(AUDIT_DIR), "r1"),
            PathBuf::from("/tmp/run/audit/r1.jsonl")
        );
        assert_eq!(
            summary_path(&root.join(AUDIT_DIR), "r1"),
            PathBuf::from("/tmp/run/audit/r1.summary.json")
        );
        assert_eq!(
            checkpoint_file(&root.join(CHECKPOINTS_DIR), "FRAMED", "abc123"),
            PathBuf::from("/tmp/run/checkpoints/FRAMED_abc123.json")
        );
        assert_eq!(
            plan_file(&root.join(CHECKPOINTS_DIR), "FRAMED", "abc123"),
            PathBuf::from("/tmp/run/checkpoints/FRAMED_abc123.plan.json")
        );
    }
}
