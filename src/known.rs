//! Known-callsigns set for confidence labeling.
//!
//! A newline-delimited watchlist of callsigns considered real (contest
//! regulars, club stations, previously confirmed calls). Membership upgrades
//! a low-consensus spot's confidence label from "?" to "S".

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Set of callsigns known to be real.
#[derive(Debug, Default)]
pub struct KnownCallsigns {
    entries: HashSet<String>,
}

impl KnownCallsigns {
    pub fn from_calls<I, S>(calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            entries: calls
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty() && !c.starts_with('#'))
                .collect(),
        }
    }

    /// Load a newline-delimited file; lines starting with `#` are comments.
    /// Only the first whitespace-delimited token of each line is used, so
    /// notes after the call are fine.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read known callsigns: {}", path.display()))?;
        Ok(Self::from_calls(
            content.lines().filter_map(|l| l.split_whitespace().next()),
        ))
    }

    pub fn contains(&self, call: &str) -> bool {
        let call = call.trim().to_ascii_uppercase();
        !call.is_empty() && self.entries.contains(&call)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_is_case_insensitive() {
        let known = KnownCallsigns::from_calls(["K1ABC", "ea5wu"]);
        assert!(known.contains("k1abc"));
        assert!(known.contains("EA5WU"));
        assert!(!known.contains("W9ZZZ"));
        assert!(!known.contains(""));
    }

    #[test]
    fn test_load_with_comments_and_notes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known.txt");
        std::fs::write(&path, "# watchlist\nVK1AO Alan\n\nVK4KC Marty\nKI2D\n").unwrap();
        let known = KnownCallsigns::load(&path).unwrap();
        assert_eq!(known.len(), 3);
        assert!(known.contains("VK1AO"));
        assert!(known.contains("VK4KC"));
        assert!(known.contains("KI2D"));
    }
}
