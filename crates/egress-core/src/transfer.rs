//! Blacklist import/export text format.
//!
//! One pattern per line. Blank lines and lines starting with `#` are ignored
//! on import. Export writes a commented header followed by the sorted
//! pattern list.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::blacklist::HostPattern;
use crate::error::{StoreError, TransferError};
use crate::store::BlacklistStore;

/// Parses the import format into unique patterns, in file order.
pub fn parse_patterns(text: &str) -> Result<Vec<HostPattern>, TransferError> {
    let mut seen = BTreeSet::new();
    let mut patterns = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let pattern = HostPattern::parse(line).map_err(|source| TransferError::Line {
            line: idx + 1,
            source,
        })?;

        if seen.insert(pattern.clone()) {
            patterns.push(pattern);
        }
    }

    Ok(patterns)
}

/// Renders the export format.
pub fn render_patterns<'a, I>(patterns: I, generated_at: DateTime<Utc>) -> String
where
    I: IntoIterator<Item = &'a HostPattern>,
{
    let sorted: BTreeSet<&HostPattern> = patterns.into_iter().collect();

    let mut out = String::new();
    out.push_str("# Egress blacklist export\n");
    out.push_str(&format!("# Generated: {}\n", generated_at.to_rfc3339()));
    out.push_str(&format!("# Patterns: {}\n", sorted.len()));
    out.push_str("# One host name or *.domain wildcard per line.\n");
    out.push_str("# Lines starting with '#' and blank lines are ignored.\n");
    out.push('\n');

    for pattern in sorted {
        out.push_str(pattern.as_str());
        out.push('\n');
    }
    out
}

/// Reads and parses a blacklist file.
pub fn read_file(path: impl AsRef<Path>) -> Result<Vec<HostPattern>, TransferError> {
    let text = std::fs::read_to_string(path)?;
    parse_patterns(&text)
}

/// Writes a blacklist file.
pub fn write_file<'a, I>(path: impl AsRef<Path>, patterns: I) -> Result<(), TransferError>
where
    I: IntoIterator<Item = &'a HostPattern>,
{
    std::fs::write(path, render_patterns(patterns, Utc::now()))?;
    Ok(())
}

/// Outcome of importing patterns into a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Patterns newly added.
    pub added: usize,
    /// Patterns that were already present.
    pub unchanged: usize,
}

/// Adds every pattern to `store`.
pub fn import_into(
    store: &dyn BlacklistStore,
    patterns: &[HostPattern],
) -> Result<ImportSummary, StoreError> {
    let mut summary = ImportSummary::default();
    for pattern in patterns {
        if store.add(pattern)? {
            summary.added += 1;
        } else {
            summary.unchanged += 1;
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::BlacklistSnapshot;
    use crate::store::MemoryStore;

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = "# header\n\nads.example.com\n   \n  # indented comment\n*.Tracker.NET\nads.example.com\n";
        let patterns = parse_patterns(text).unwrap();
        let texts: Vec<&str> = patterns.iter().map(|p| p.as_str()).collect();
        assert_eq!(texts, vec!["ads.example.com", "*.tracker.net"]);
    }

    #[test]
    fn parse_reports_line_number() {
        let err = parse_patterns("good.com\nbad host\n").unwrap_err();
        match err {
            TransferError::Line { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn render_has_header_and_sorted_list() {
        let patterns = vec![
            HostPattern::parse("b.com").unwrap(),
            HostPattern::parse("*.a.com").unwrap(),
        ];
        let text = render_patterns(&patterns, Utc::now());
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with('#'));
        assert!(lines.contains(&"# Patterns: 2"));

        let body: Vec<&str> = lines
            .into_iter()
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        assert_eq!(body, vec!["*.a.com", "b.com"]);
    }

    #[test]
    fn export_then_import_reproduces_set() {
        let original =
            BlacklistSnapshot::parse_all(["Ads.Example.com", "*.tracker.net", "x.org"]).unwrap();
        let text = render_patterns(&original.patterns(), Utc::now());

        let store = MemoryStore::new();
        let summary = import_into(&store, &parse_patterns(&text).unwrap()).unwrap();
        assert_eq!(summary.added, 3);

        assert_eq!(store.load_snapshot().unwrap(), original);
    }

    #[test]
    fn import_counts_existing() {
        let store = MemoryStore::with_patterns([HostPattern::parse("a.com").unwrap()]);
        let patterns = parse_patterns("a.com\nb.com\n").unwrap();
        let summary = import_into(&store, &patterns).unwrap();
        assert_eq!(
            summary,
            ImportSummary {
                added: 1,
                unchanged: 1
            }
        );
    }
}
