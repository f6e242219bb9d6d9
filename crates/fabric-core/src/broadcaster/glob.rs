//! Minimal glob matching for hierarchical topic patterns.
//!
//! Patterns may contain `*` as a wildcard matching any run of characters
//! (including none), e.g. `workspace:abc.task:*` matches every task topic
//! under workspace `abc`. No other glob metacharacters are supported; topic
//! segments are plain strings, not paths, so `*` does not need to stop at a
//! separator the way a filesystem glob would.

/// Whether `topic` matches `pattern`.
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern == "all" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == topic;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = topic;

    if let Some(first) = parts.first() {
        if !rest.starts_with(first) {
            return false;
        }
        rest = &rest[first.len()..];
    }

    for part in &parts[1..parts.len().saturating_sub(1)] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }

    if let Some(last) = parts.last() {
        if parts.len() > 1 {
            return rest.ends_with(last);
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_matches_everything() {
        assert!(matches("all", "workspace:foo.task:bar"));
    }

    #[test]
    fn exact_match_without_wildcard() {
        assert!(matches("workspace:foo", "workspace:foo"));
        assert!(!matches("workspace:foo", "workspace:bar"));
    }

    #[test]
    fn trailing_wildcard_matches_prefix() {
        assert!(matches("workspace:foo.*", "workspace:foo.task:bar"));
        assert!(!matches("workspace:foo.*", "workspace:other.task:bar"));
    }

    #[test]
    fn leading_wildcard_matches_suffix() {
        assert!(matches("*.task:bar", "workspace:foo.task:bar"));
    }

    #[test]
    fn middle_wildcard_matches_infix() {
        assert!(matches("workspace:foo.*:bar", "workspace:foo.task:bar"));
    }
}
