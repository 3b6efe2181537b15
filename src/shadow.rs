//! # Shadow — Shadow-File Hash Extraction
//!
//! Reads colon-separated shadow-style records: first field username, second
//! field the stored hash (which doubles as the crypt setting). Blank lines
//! and `#` comments are skipped. The placeholders `!`, `*`, `x`, and an
//! empty field mark accounts with no crackable hash.

use std::path::Path;

use anyhow::{Context, Result};

/// Second-field markers that mean "no crackable hash".
pub const PLACEHOLDERS: [&str; 3] = ["!", "*", "x"];

/// Whether a second field holds a hash a campaign can target.
pub fn is_crackable(hash: &str) -> bool {
    !hash.is_empty() && !PLACEHOLDERS.contains(&hash)
}

/// Extract the raw second field for `username`, placeholder or not.
/// Returns `None` when no record matches.
pub fn find_hash<'a>(content: &'a str, username: &str) -> Option<&'a str> {
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(':');
        if fields.next() == Some(username) {
            return Some(fields.next().unwrap_or(""));
        }
    }
    None
}

/// Read a shadow file and return `username`'s hash, or `None` when the user
/// is missing or the entry is locked/placeholder.
pub fn load_hash(path: &Path, username: &str) -> Result<Option<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading shadow file {}", path.display()))?;
    Ok(find_hash(&content, username)
        .filter(|h| is_crackable(h))
        .map(|h| h.to_string()))
}
