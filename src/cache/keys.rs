// src/cache/keys.rs
// Cache key conventions for sprint, issue and repository data

use regex::Regex;
use std::time::Duration;

use super::store::{StoreError, StoreResult};

pub const KEY_DELIMITER: char = ':';

/// Percent-encode the characters that carry meaning in keys or glob patterns.
/// `%` is encoded first so the mapping stays reversible.
pub fn escape_part(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '*' => out.push_str("%2A"),
            '?' => out.push_str("%3F"),
            '[' => out.push_str("%5B"),
            ']' => out.push_str("%5D"),
            '\\' => out.push_str("%5C"),
            ' ' => out.push_str("%20"),
            '\t' => out.push_str("%09"),
            '\n' => out.push_str("%0A"),
            '\r' => out.push_str("%0D"),
            other => out.push(other),
        }
    }
    out
}

/// Compose a structured key from typed parts.
///
/// ```
/// use sprintcore::cache::keys::build_key;
/// assert_eq!(build_key(&["sprint", "42", "issues"]), "sprint:42:issues");
/// assert_eq!(build_key(&["repo", "acme/web:main"]), "repo:acme/web%3Amain");
/// ```
pub fn build_key<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(|p| escape_part(p.as_ref()))
        .collect::<Vec<_>>()
        .join(&KEY_DELIMITER.to_string())
}

pub fn sprint(sprint_id: &str) -> String {
    build_key(&["sprint", sprint_id])
}

pub fn sprint_issues(sprint_id: &str) -> String {
    build_key(&["sprint", sprint_id, "issues"])
}

pub fn sprint_metrics(sprint_id: &str) -> String {
    build_key(&["sprint", sprint_id, "metrics"])
}

/// Glob matching every sub-resource cached under one sprint
/// (the bare `sprint(id)` key itself is not included)
pub fn sprint_family(sprint_id: &str) -> String {
    format!("{}{}*", build_key(&["sprint", sprint_id]), KEY_DELIMITER)
}

pub fn issue(issue_key: &str) -> String {
    build_key(&["issue", issue_key])
}

pub fn repository(owner: &str, repo: &str) -> String {
    build_key(&["repo", owner, repo])
}

pub fn commits(owner: &str, repo: &str, since: &str, until: &str) -> String {
    build_key(&["repo", owner, repo, "commits", since, until])
}

pub fn pull_requests(owner: &str, repo: &str, state: &str) -> String {
    build_key(&["repo", owner, repo, "pulls", state])
}

pub fn report(sprint_id: &str, format: &str) -> String {
    build_key(&["report", sprint_id, format])
}

/// Kind of data held under a key, with the TTL it is usually cached for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Sprint,
    SprintIssues,
    Issue,
    Repository,
    Commits,
    PullRequests,
    Report,
    Metrics,
}

impl DataKind {
    pub fn default_ttl(&self) -> Duration {
        match self {
            // Active sprint data moves quickly
            DataKind::SprintIssues | DataKind::Issue => Duration::from_secs(300),
            DataKind::PullRequests => Duration::from_secs(600),
            DataKind::Sprint | DataKind::Commits | DataKind::Metrics => Duration::from_secs(1800),
            DataKind::Repository | DataKind::Report => Duration::from_secs(3600),
        }
    }
}

/// Glob pattern (`*` any run, `?` one char) compiled to an anchored regex
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> StoreResult<Self> {
        if pattern.trim().is_empty() {
            return Err(StoreError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        // Redis reads these as classes and escapes; the in-process matcher does not
        if let Some(c) = pattern.chars().find(|c| matches!(c, '[' | ']' | '\\')) {
            return Err(StoreError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: format!("unsupported character '{}'", c),
            });
        }
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for c in pattern.chars() {
            match c {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if c == '*' { ".*" } else { "." });
                }
                other => literal.push(other),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delimiters_are_escaped() {
        let key = build_key(&["sprint", "a:b", "x*y"]);
        assert_eq!(key, "sprint:a%3Ab:x%2Ay");
        assert_eq!(key.matches(KEY_DELIMITER).count(), 2);
    }

    #[test]
    fn test_escape_is_injective_for_percent() {
        assert_ne!(escape_part("%3A"), escape_part(":"));
    }

    #[test]
    fn test_typed_helpers() {
        assert_eq!(sprint_issues("17"), "sprint:17:issues");
        assert_eq!(repository("acme", "web"), "repo:acme:web");
        assert_eq!(pull_requests("acme", "web", "open"), "repo:acme:web:pulls:open");
        assert_eq!(sprint_family("17"), "sprint:17:*");
        assert!(!GlobPattern::new(&sprint_family("17")).unwrap().matches("sprint:170:issues"));
    }

    #[test]
    fn test_glob_matching() {
        let glob = GlobPattern::new("user:*").unwrap();
        assert!(glob.matches("user:1"));
        assert!(glob.matches("user:"));
        assert!(!glob.matches("session:1"));
        assert!(!glob.matches("xuser:1"));

        let single = GlobPattern::new("user:?").unwrap();
        assert!(single.matches("user:2"));
        assert!(!single.matches("user:22"));
    }

    #[test]
    fn test_glob_rejects_classes_and_escapes() {
        for pattern in ["sprint:[12]", "sprint:1]", "user:\\*"] {
            assert!(
                matches!(GlobPattern::new(pattern), Err(StoreError::InvalidPattern { .. })),
                "{} accepted",
                pattern
            );
        }
        let key = build_key(&["repo", "a\\b[1]"]);
        assert_eq!(key, "repo:a%5Cb%5B1%5D");
        assert!(GlobPattern::new(&key).unwrap().matches(&key));
    }

    #[test]
    fn test_glob_treats_regex_metachars_literally() {
        let glob = GlobPattern::new("repo:a.b*").unwrap();
        assert!(glob.matches("repo:a.b:commits"));
        assert!(!glob.matches("repo:axb:commits"));
    }

    #[test]
    fn test_escaped_parts_cannot_widen_a_family_glob() {
        // A sprint id containing '*' must not turn into a wildcard
        let family = sprint_family("1*");
        let glob = GlobPattern::new(&family).unwrap();
        assert!(glob.matches(&sprint_issues("1*")));
        assert!(!glob.matches(&sprint_issues("12")));
    }
}
