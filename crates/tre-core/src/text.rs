//! Text normalization shared by the catalog, the inventory and the planner.
//!
//! Every comparison between desired and live state goes through one of these
//! functions, so that cosmetic differences (HTML entities from Confluence
//! exports, doubled spaces, trailing periods) never produce a mutation.

use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Test-id labels
// ---------------------------------------------------------------------------

static TEST_ID_RE: OnceLock<Regex> = OnceLock::new();

fn test_id_re() -> &'static Regex {
    TEST_ID_RE.get_or_init(|| Regex::new(r"^API-[A-Z]*-?\d+$").unwrap())
}

/// True for labels shaped like a test identifier (`API-123`, `API-TEAM-7`).
/// Those belong in identity, never in labels.
pub fn is_test_id_label(label: &str) -> bool {
    test_id_re().is_match(label)
}

// ---------------------------------------------------------------------------
// Phrase folding
// ---------------------------------------------------------------------------

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Collapse every whitespace run to a single space and trim both ends.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Matching key for summaries and precondition definitions: lowercased,
/// whitespace collapsed, trailing punctuation stripped.
pub fn fold(s: &str) -> String {
    let collapsed = collapse_whitespace(&decode_entities(s)).to_lowercase();
    collapsed
        .trim_end_matches(|c: char| TRAILING_PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_string()
}

// ---------------------------------------------------------------------------
// HTML entities
// ---------------------------------------------------------------------------

/// Decode the entities that survive Confluence/Jira exports. Unknown
/// entities are left untouched.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.bytes().take(12).position(|b| b == b';') else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };
        let entity = &tail[1..semi];
        match decode_entity(entity) {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" | "#39" => Some('\''),
        "nbsp" => Some(' '),
        _ => {
            let num = entity.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse::<u32>().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Normalized form of a step field: entities decoded, whitespace collapsed.
pub fn normalize_step_text(s: &str) -> String {
    collapse_whitespace(&decode_entities(s))
}

// ---------------------------------------------------------------------------
// Folder paths
// ---------------------------------------------------------------------------

/// Normalize a POSIX-style folder path: leading `/`, no trailing slash, no
/// empty segments. The repository root is `/`.
pub fn normalize_folder_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Every ancestor of a normalized path plus the path itself, shallowest
/// first. The root is never included.
pub fn folder_lineage(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

pub fn folder_depth(path: &str) -> usize {
    path.split('/').filter(|s| !s.is_empty()).count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
