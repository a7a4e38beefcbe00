//! Exclusion of irrelevant call sites from snapshots.

use std::collections::BTreeMap;

use glob::{MatchOptions, Pattern};

use crate::snapshot::normalize_path;
use crate::{Error, Result, Snapshot};

/// Path prefixes of the Rust toolchain sources as they appear in debug info.
pub(crate) const RUNTIME_PATH_PREFIXES: [&str; 2] = ["/rustc/", "/rust/deps/"];

const UNKNOWN_PATTERN: &str = "<unknown>";

// Stack capture and symbolization.
const BACKTRACE_PATTERN: &str = "*/backtrace-*/src/*";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: !cfg!(windows),
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A deduplicated set of call-site filename patterns to exclude from snapshots.
///
/// Patterns are glob patterns (`*`, `?`, `[...]`) matched against the filename of the call
/// site of each allocation, where `*` also matches path separators. A pattern without
/// wildcards matches the exact filename.
///
/// The set always contains the baseline patterns, which exclude unresolved frames, the Rust
/// runtime, the stack capture library and the sources of this package.
///
/// # Examples
///
/// ```
/// use alloc_assert::ExcludeSet;
///
/// let exclude = ExcludeSet::new(["*/vendored/*", "*/vendored/*"]).unwrap();
///
/// assert!(exclude.matches("/work/vendored/zlib.rs"));
/// assert!(exclude.matches("<unknown>"));
/// assert!(!exclude.matches("/work/src/main.rs"));
/// ```
#[derive(Clone, Debug)]
pub struct ExcludeSet {
    patterns: BTreeMap<String, Pattern>,
}

impl ExcludeSet {
    /// Creates the baseline set extended with the caller's `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] if a pattern is not a valid glob pattern.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::baseline();

        for pattern in patterns {
            set.insert(pattern.as_ref())?;
        }

        Ok(set)
    }

    /// Creates a set holding only the baseline patterns.
    #[must_use]
    pub fn baseline() -> Self {
        let mut set = Self {
            patterns: BTreeMap::new(),
        };

        for pattern in baseline_patterns() {
            set.insert(&pattern)
                .expect("baseline patterns are valid glob patterns");
        }

        set
    }

    fn insert(&mut self, pattern: &str) -> Result<()> {
        let normalized = normalize_path(pattern);

        if self.patterns.contains_key(&normalized) {
            return Ok(());
        }

        let compiled = Pattern::new(&normalized).map_err(|source| Error::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        self.patterns.insert(normalized, compiled);
        Ok(())
    }

    /// The patterns in the set, in lexicographic order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    /// Whether `filename` matches any pattern in the set.
    #[must_use]
    pub fn matches(&self, filename: &str) -> bool {
        let filename = normalize_path(filename);

        self.patterns
            .values()
            .any(|pattern| pattern.matches_with(&filename, MATCH_OPTIONS))
    }
}

fn baseline_patterns() -> Vec<String> {
    let own_sources = format!(
        "{}/src/*",
        Pattern::escape(&normalize_path(env!("CARGO_MANIFEST_DIR")))
    );

    let mut patterns = vec![
        UNKNOWN_PATTERN.to_string(),
        BACKTRACE_PATTERN.to_string(),
        own_sources,
    ];

    patterns.extend(RUNTIME_PATH_PREFIXES.iter().map(|prefix| format!("{prefix}*")));
    patterns
}

/// Returns a new snapshot without the traces whose call site matches `exclude`.
///
/// The input snapshot is left untouched.
#[must_use]
pub fn filter_snapshot(snapshot: &Snapshot, exclude: &ExcludeSet) -> Snapshot {
    snapshot.retain(|trace| !exclude.matches(trace.traceback().call_site().filename()))
}
