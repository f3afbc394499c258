//! Filename pattern utilities for dirwatch
//! Extracted to a separate crate for compilation optimization

use once_cell::sync::Lazy;
use regex::Regex;

/// Default noisy filename conventions
pub mod defaults {
    /// Files that grow constantly or are rewritten by every session start
    pub const PREFIXES: &[&str] = &[".X.err", ".xsession-errors", ".fonts.cache"];

    /// Editor swap files, backups and lock files
    pub const SUFFIXES: &[&str] = &[".swp", ".swx", ".swpx", "~", ".lock", ".part"];
}

static DEFAULT_FILTER: Lazy<NoiseFilter> =
    Lazy::new(|| NoiseFilter::new(defaults::PREFIXES, defaults::SUFFIXES));

/// Matches transient filenames whose churn should not count as a content change.
///
/// Prefixes and suffixes are literal; they are escaped before being compiled
/// into a single alternation so one regex check covers the whole denylist.
#[derive(Debug, Clone)]
pub struct NoiseFilter {
    matcher: Option<Regex>,
}

impl NoiseFilter {
    /// Build a filter from literal prefixes and suffixes
    pub fn new<P, S>(prefixes: &[P], suffixes: &[S]) -> Self
    where
        P: AsRef<str>,
        S: AsRef<str>,
    {
        let prefixes = alternation(prefixes);
        let suffixes = alternation(suffixes);

        let pattern = match (prefixes, suffixes) {
            (None, None) => None,
            (Some(p), None) => Some(format!("^(?:{p})")),
            (None, Some(s)) => Some(format!("(?:{s})$")),
            (Some(p), Some(s)) => Some(format!("^(?:{p})|(?:{s})$")),
        };

        // Escaped literals always compile
        let matcher = pattern.and_then(|p| Regex::new(&p).ok());
        Self { matcher }
    }

    /// Check a bare filename (not a path) against the denylist
    pub fn is_noisy(&self, filename: &str) -> bool {
        self.matcher.as_ref().is_some_and(|re| re.is_match(filename))
    }
}

impl Default for NoiseFilter {
    fn default() -> Self {
        DEFAULT_FILTER.clone()
    }
}

fn alternation<T: AsRef<str>>(items: &[T]) -> Option<String> {
    let parts: Vec<String> = items
        .iter()
        .map(|item| item.as_ref())
        .filter(|item| !item.is_empty())
        .map(regex::escape)
        .collect();

    if parts.is_empty() { None } else { Some(parts.join("|")) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_matches_session_noise() {
        let filter = NoiseFilter::default();
        assert!(filter.is_noisy(".xsession-errors"));
        assert!(filter.is_noisy(".xsession-errors-:0"));
        assert!(filter.is_noisy(".X.err"));
        assert!(filter.is_noisy(".fonts.cache-1"));
    }

    #[test]
    fn test_default_filter_matches_swap_and_lock_files() {
        let filter = NoiseFilter::default();
        assert!(filter.is_noisy(".notes.txt.swp"));
        assert!(filter.is_noisy("draft.md~"));
        assert!(filter.is_noisy("Cargo.lock"));
        assert!(!filter.is_noisy("notes.txt"));
        assert!(!filter.is_noisy("lockfile.rs"));
    }

    #[test]
    fn test_literals_are_escaped() {
        let filter = NoiseFilter::new(&["a.b"], &[".(tmp)"]);
        assert!(filter.is_noisy("a.b-1"));
        assert!(!filter.is_noisy("axb-1"));
        assert!(filter.is_noisy("file.(tmp)"));
        assert!(!filter.is_noisy("file.tmp"));
    }

    #[test]
    fn test_empty_filter() {
        let filter = NoiseFilter::new::<&str, &str>(&[], &[]);
        assert!(!filter.is_noisy(".X.err"));
        assert!(!filter.is_noisy("x.swp"));
    }

    #[test]
    fn test_prefix_only_and_suffix_only() {
        let prefix_only = NoiseFilter::new(&[".cache"], &[""]);
        assert!(prefix_only.is_noisy(".cache-x"));
        assert!(!prefix_only.is_noisy("x.cache"));

        let suffix_only = NoiseFilter::new(&[""], &[".bak"]);
        assert!(suffix_only.is_noisy("x.bak"));
        assert!(!suffix_only.is_noisy(".bak.x"));
    }
}
