//! US amateur-license lookup collaborator.
//!
//! The FCC ULS database itself is maintained outside this crate; we consume
//! a newline-delimited export of licensed callsigns. Only the membership
//! contract matters here: spots from US spotters (ADIF 291) that fail the
//! check are dropped at parse time.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// ADIF entity number for the United States.
pub const ADIF_UNITED_STATES: u16 = 291;

/// Set of licensed US callsigns.
pub struct UlsIndex {
    calls: HashSet<String>,
}

impl UlsIndex {
    pub fn from_calls<I, S>(calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            calls: calls
                .into_iter()
                .map(|c| c.as_ref().trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// Load a newline-delimited callsign file; `#` starts a comment line.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read ULS file: {}", path.display()))?;
        Ok(Self::from_calls(
            content.lines().filter(|l| !l.trim_start().starts_with('#')),
        ))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Membership check on the base call: SSIDs, the skimmer marker, and
    /// portable designators are ignored.
    pub fn is_licensed(&self, call: &str) -> bool {
        let mut base = call.trim().to_ascii_uppercase();
        if let Some(slash) = base.find('/') {
            base.truncate(slash);
        }
        if base.ends_with("-#") {
            base.truncate(base.len() - 2);
        }
        let ssid_head = match base.rsplit_once('-') {
            Some((head, ssid))
                if !head.is_empty()
                    && !ssid.is_empty()
                    && ssid.bytes().all(|b| b.is_ascii_digit()) =>
            {
                Some(head.len())
            }
            _ => None,
        };
        if let Some(len) = ssid_head {
            base.truncate(len);
        }
        self.calls.contains(&base)
    }
}
