//! Route pattern matching
//!
//! [`match_url`] walks a parsed path against one pattern, segment by segment.
//! Literal segments compare case-insensitively; `:name` segments bind
//! unconditionally; `:name(regex)` segments bind only when the regex finds a
//! match in the path segment (the full segment text is bound, not the regex
//! capture). When trailing capture is requested, the last pattern segment
//! consumes the joined remainder of the path as one value.

use regex::Regex;
use std::collections::HashMap;

use super::RouteError;

/// Result of matching one path against one pattern
#[derive(Debug, Clone, Default)]
pub struct RouteMatch {
    /// Whether every segment satisfied its rule
    pub matched: bool,

    /// Captured variables, by name
    pub params: HashMap<String, String>,
}

impl RouteMatch {
    fn miss() -> Self {
        Self::default()
    }
}

/// Match `path_parts` against `pattern`.
///
/// `path_parts` must already be split on `/` with empty leading/trailing
/// segments removed; the pattern is split the same way here.
pub fn match_url(
    path_parts: &[String],
    pattern: &str,
    match_trailing_path_parts: bool,
) -> Result<RouteMatch, RouteError> {
    let pattern_parts = split_segments(pattern);

    if pattern_parts.len() != path_parts.len() && !match_trailing_path_parts {
        return Ok(RouteMatch::miss());
    }
    if path_parts.len() < pattern_parts.len().saturating_sub(1) {
        return Ok(RouteMatch::miss());
    }

    let mut params = HashMap::new();

    for (i, pattern_part) in pattern_parts.iter().enumerate() {
        let is_trailing = match_trailing_path_parts && i == pattern_parts.len() - 1;

        let path_segment = if is_trailing {
            path_parts[i.min(path_parts.len())..].join("/")
        } else {
            match path_parts.get(i) {
                Some(segment) if !segment.is_empty() => segment.clone(),
                _ => return Ok(RouteMatch::miss()),
            }
        };

        if let Some(colon) = pattern_part.find(':') {
            let variable = &pattern_part[colon + 1..];
            match variable.find('(') {
                Some(paren) => {
                    let name = &variable[..paren];
                    let raw = variable[paren + 1..].strip_suffix(')').unwrap_or(&variable[paren + 1..]);
                    let re = Regex::new(raw).map_err(|source| RouteError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    })?;
                    if re.find(&path_segment).is_none() {
                        return Ok(RouteMatch::miss());
                    }
                    // Bind the full segment text, not the regex capture
                    params.insert(name.to_string(), path_segment);
                }
                None => {
                    params.insert(variable.to_string(), path_segment);
                }
            }
        } else if !pattern_part.eq_ignore_ascii_case(&path_segment) {
            return Ok(RouteMatch::miss());
        }
    }

    Ok(RouteMatch {
        matched: true,
        params,
    })
}

/// Split a pattern on `/`, discarding the empty segments produced by leading
/// and trailing slashes.
pub fn split_segments(path: &str) -> Vec<String> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
