//! Commit enumeration helpers: `git log` record parsing and the
//! from/to/limit window applied to a head-first walk.

use chrono::DateTime;

use crate::error::{RepoError, RepoResult};
use crate::model::Commit;

/// Commits visited on any single walk, whether collected or skipped.
pub const WALK_CAP: usize = 1000;

/// Select the slice of a head-first `walk` to report.
///
/// With a non-empty `to`, commits are skipped until `to` is seen, which
/// starts collection inclusively.  Collection ends before `from`, after
/// `limit` commits, or at the end of the walk.
pub fn select_window<'a>(walk: &'a [String], from: &str, to: &str, limit: usize) -> &'a [String] {
    let walk = &walk[..walk.len().min(WALK_CAP)];
    let start = if to.is_empty() {
        0
    } else {
        match walk.iter().position(|hash| hash == to) {
            Some(index) => index,
            None => return &[],
        }
    };

    let rest = &walk[start..];
    let mut end = rest.len().min(limit);
    if !from.is_empty() {
        if let Some(stop) = rest[..end].iter().position(|hash| hash == from) {
            end = stop;
        }
    }
    &rest[..end]
}

/// Parse the output of [`super::commands::log_records`].
pub fn parse_log(raw: &str) -> RepoResult<Vec<Commit>> {
    raw.split('\x1e')
        .filter(|record| !record.trim().is_empty())
        .map(parse_record)
        .collect()
}

fn parse_record(record: &str) -> RepoResult<Commit> {
    let malformed = || RepoError::Git {
        command: "log".to_string(),
        stderr: format!("unexpected log record: {:?}", record.trim()),
    };

    let mut fields = record.splitn(5, '\x1f');
    let hash = fields.next().ok_or_else(malformed)?.trim();
    let author = fields.next().ok_or_else(malformed)?;
    let date = fields.next().ok_or_else(malformed)?;
    let message = fields.next().ok_or_else(malformed)?;
    let files = fields.next().unwrap_or_default();

    let date = DateTime::parse_from_rfc3339(date.trim()).map_err(|_| malformed())?;
    Ok(Commit {
        hash: hash.to_string(),
        author: author.to_string(),
        date,
        message: message.trim_end().to_string(),
        changes: files
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        tag: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(hashes: &[&str]) -> Vec<String> {
        hashes.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn unbounded_window_starts_at_head() {
        let w = walk(&["e", "d", "c", "b", "a"]);
        assert_eq!(select_window(&w, "", "", 3), &w[..3]);
        assert_eq!(select_window(&w, "", "", 15), &w[..]);
    }

    #[test]
    fn from_is_exclusive() {
        let w = walk(&["e", "d", "c", "b", "a"]);
        assert_eq!(select_window(&w, "c", "", 15), &w[..2]);
        assert!(select_window(&w, "e", "", 15).is_empty());
    }

    #[test]
    fn to_is_inclusive_start() {
        let w = walk(&["e", "d", "c", "b", "a"]);
        assert_eq!(select_window(&w, "a", "d", 15), &w[1..4]);
        assert_eq!(select_window(&w, "", "d", 2), &w[1..3]);
    }

    #[test]
    fn missing_to_yields_nothing() {
        let w = walk(&["b", "a"]);
        assert!(select_window(&w, "", "zzz", 10).is_empty());
    }

    #[test]
    fn from_before_to_is_ignored() {
        // `from` only ends collection once collection has started.
        let w = walk(&["d", "c", "b", "a"]);
        assert_eq!(select_window(&w, "d", "b", 10), &w[2..]);
    }

    #[test]
    fn walk_is_capped() {
        let w: Vec<String> = (0..1500).map(|i| format!("h{i}")).collect();
        assert_eq!(select_window(&w, "", "", usize::MAX).len(), WALK_CAP);
        assert!(select_window(&w, "", "h1200", 10).is_empty());
    }

    #[test]
    fn parses_log_records_with_changes() {
        let raw = "\x1eaaa\x1fAda <ada@example.com>\x1f2024-03-01T10:00:00+01:00\x1fFix parser\n\nLonger body\n\x1f\n\nsrc/lib.rs\nsrc/main.rs\n\
\x1ebbb\x1fBob <bob@example.com>\x1f2024-02-28T09:30:00Z\x1fInitial\n\x1f\n\nREADME.md\n";
        let commits = parse_log(raw).unwrap();
        assert_eq!(commits.len(), 2);

        assert_eq!(commits[0].hash, "aaa");
        assert_eq!(commits[0].author, "Ada <ada@example.com>");
        assert_eq!(commits[0].message, "Fix parser\n\nLonger body");
        assert_eq!(commits[0].changes, vec!["src/lib.rs", "src/main.rs"]);
        assert_eq!(commits[0].date.to_rfc3339(), "2024-03-01T10:00:00+01:00");

        assert_eq!(commits[1].hash, "bbb");
        assert_eq!(commits[1].changes, vec!["README.md"]);
    }

    #[test]
    fn merge_without_changes_has_empty_list() {
        let raw = "\x1emmm\x1fAda <ada@example.com>\x1f2024-03-01T10:00:00+01:00\x1fMerge\n\x1f\n";
        let commits = parse_log(raw).unwrap();
        assert!(commits[0].changes.is_empty());
    }

    #[test]
    fn garbage_record_is_an_error() {
        assert!(parse_log("\x1enot a record").is_err());
    }
}
