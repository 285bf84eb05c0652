//! HTTPProxy prefix replacement.

use thiserror::Error;

use super::{PathMatch, PathRewrite};
use crate::k8s::projectcontour::PathRewritePolicy;

pub const PREFIX_REPLACE_ERROR: &str = "PrefixReplaceError";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("duplicate replacement prefix '{0}'")]
    DuplicateReplacement(String),

    #[error("ambiguous prefix replacement")]
    AmbiguousReplacement,
}

impl RewriteError {
    pub fn reason(&self) -> &'static str {
        match self {
            RewriteError::DuplicateReplacement(_) => "DuplicateReplacement",
            RewriteError::AmbiguousReplacement => "AmbiguousReplacement",
        }
    }
}

/// Check a policy for duplicate or ambiguous entries.
pub fn validate(policy: &PathRewritePolicy) -> Result<(), RewriteError> {
    let mut seen: Vec<&str> = Vec::new();
    let mut empty = 0;
    for entry in &policy.replace_prefix {
        if entry.prefix.is_empty() {
            empty += 1;
            if empty > 1 {
                return Err(RewriteError::AmbiguousReplacement);
            }
            continue;
        }
        if seen.contains(&entry.prefix.as_str()) {
            return Err(RewriteError::DuplicateReplacement(entry.prefix.clone()));
        }
        seen.push(&entry.prefix);
    }
    Ok(())
}

/// Whether `prefix` matches `path` on a segment boundary.
fn segment_matches(prefix: &str, path: &str) -> bool {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    path == trimmed || path.starts_with(&format!("{}/", trimmed))
}

/// The replacement for `routing_prefix`: the longest non-empty prefix that
/// segment-matches wins, otherwise the prefix-less entry applies.
pub fn replacement_for<'a>(policy: &'a PathRewritePolicy, routing_prefix: &str) -> Option<&'a str> {
    policy
        .replace_prefix
        .iter()
        .filter(|e| !e.prefix.is_empty() && segment_matches(&e.prefix, routing_prefix))
        .max_by_key(|e| e.prefix.len())
        .or_else(|| policy.replace_prefix.iter().find(|e| e.prefix.is_empty()))
        .map(|e| e.replacement.as_str())
}

/// Expand a routing prefix with a replacement into `(match, rewrite)` pairs.
///
/// `/` yields a single route. Any other prefix `X` yields `X` with the
/// replacement's trailing slash removed (an empty result becomes `/`) and
/// `X/` with the trailing slash kept, so both `/X` and `/X/...` rewrite to
/// well-formed paths.
pub fn expand(routing_prefix: &str, replacement: &str) -> Vec<(PathMatch, PathRewrite)> {
    if routing_prefix == "/" {
        return vec![(PathMatch::root(), PathRewrite::Prefix(replacement.to_string()))];
    }
    let base = routing_prefix.trim_end_matches('/');
    let trimmed = replacement.trim_end_matches('/');
    let bare = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
    let slashed = format!("{}/", trimmed);
    vec![
        (PathMatch::string_prefix(base), PathRewrite::Prefix(bare)),
        (PathMatch::string_prefix(format!("{}/", base)), PathRewrite::Prefix(slashed)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::projectcontour::ReplacePrefix;

    fn policy(entries: &[(&str, &str)]) -> PathRewritePolicy {
        PathRewritePolicy {
            replace_prefix: entries
                .iter()
                .map(|(p, r)| ReplacePrefix { prefix: p.to_string(), replacement: r.to_string() })
                .collect(),
        }
    }

    #[test]
    fn duplicate_and_ambiguous_policies() {
        let err = validate(&policy(&[("/foo", "/a"), ("/foo", "/b")])).unwrap_err();
        assert_eq!(err.to_string(), "duplicate replacement prefix '/foo'");
        assert_eq!(err.reason(), "DuplicateReplacement");

        let err = validate(&policy(&[("", "/a"), ("", "/b")])).unwrap_err();
        assert_eq!(err.to_string(), "ambiguous prefix replacement");
        assert_eq!(err.reason(), "AmbiguousReplacement");

        assert!(validate(&policy(&[("", "/a"), ("/foo", "/b")])).is_ok());
    }

    #[test]
    fn most_specific_prefix_wins() {
        let p = policy(&[("", "/default"), ("/api", "/a"), ("/api/v1", "/v1")]);
        assert_eq!(replacement_for(&p, "/api/v1"), Some("/v1"));
        assert_eq!(replacement_for(&p, "/api/v2"), Some("/a"));
        assert_eq!(replacement_for(&p, "/apiary"), Some("/default"));
        assert_eq!(replacement_for(&policy(&[("/x", "/y")]), "/z"), None);
    }

    #[test]
    fn expansion_adjusts_trailing_slashes() {
        assert_eq!(
            expand("/foo", "/bar/"),
            vec![
                (PathMatch::string_prefix("/foo"), PathRewrite::Prefix("/bar".into())),
                (PathMatch::string_prefix("/foo/"), PathRewrite::Prefix("/bar/".into())),
            ]
        );
        assert_eq!(
            expand("/foo/", "/"),
            vec![
                (PathMatch::string_prefix("/foo"), PathRewrite::Prefix("/".into())),
                (PathMatch::string_prefix("/foo/"), PathRewrite::Prefix("/".into())),
            ]
        );
        assert_eq!(
            expand("/", "/bar"),
            vec![(PathMatch::root(), PathRewrite::Prefix("/bar".into()))]
        );
    }
}
