//! Validation and sanitisation of untrusted archive path segments (C1).
//!
//! The archive path is assembled here and handed to the storage writer as a
//! relative path; this crate never touches the filesystem. Validation
//! happens on the raw segment, before sanitisation, and only rejects the
//! literal `.`/`..` tokens; a fullwidth or combining-mark lookalike passes
//! validation and can still normalise to a literal `..` during
//! sanitisation. That laundered result is caught downstream by
//! [`assert_root_containment`], which classifies any `..` path component as
//! disallowed regardless of how it was produced — so the write path never
//! escapes the root even though sanitisation alone cannot be trusted to
//! keep a traversal token out.

use std::path::{Component, Path, PathBuf};

use archiver_retry::{ArchiverError, ErrorCode};
use chrono::{DateTime, Utc};
use unicode_normalization::UnicodeNormalization;

/// Maximum byte length of a single sanitised path segment.
pub const MAX_SEGMENT_LEN: usize = 64;
/// Maximum number of path segments between the user segment and the filename.
pub const MAX_DEPTH: usize = 10;
/// Maximum byte length of the final filename.
pub const MAX_FILENAME_LEN: usize = 255;

fn permanent(message: impl Into<String>) -> ArchiverError {
    ArchiverError::permanent(ErrorCode::PathPolicy, message)
}

/// Validates one raw, untrusted segment before any sanitisation is applied.
/// Rejects empty/whitespace-only segments, `.`/`..`, separators, and NUL.
pub fn validate_segment(raw: &str) -> Result<(), ArchiverError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(permanent("path segment is empty after trimming"));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(permanent(format!("path segment {trimmed:?} is a traversal token")));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(permanent(format!(
            "path segment {trimmed:?} contains a separator or NUL byte"
        )));
    }
    if trimmed.len() > MAX_SEGMENT_LEN {
        return Err(permanent(format!(
            "path segment is {} bytes, exceeds the {MAX_SEGMENT_LEN}-byte limit",
            trimmed.len()
        )));
    }
    Ok(())
}

/// Deterministic, idempotent sanitisation applied *after* validation.
/// NFKD-normalises, strips combining marks, collapses ASCII whitespace to
/// `_`, replaces anything outside `[A-Za-z0-9._-]` with `_`, and collapses
/// runs of `_`.
pub fn sanitise_segment(raw: &str) -> String {
    let decomposed: String = raw.trim().nfkd().collect();
    let without_marks: String = decomposed
        .chars()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect();

    let mut out = String::with_capacity(without_marks.len());
    let mut last_was_underscore = false;
    for ch in without_marks.chars() {
        let mapped = if ch.is_ascii_whitespace() {
            '_'
        } else if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            ch
        } else {
            '_'
        };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }
    out
}

/// One fully validated, sanitised, depth- and length-checked archive path,
/// relative to the storage root — assembled, never written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivePath {
    pub user_segment: String,
    pub path_segments: Vec<String>,
    pub filename: String,
}

impl ArchivePath {
    /// Joins the segments into a path relative to the storage root.
    pub fn relative_path(&self) -> PathBuf {
        let mut p = PathBuf::from(&self.user_segment);
        for seg in &self.path_segments {
            p.push(seg);
        }
        p.push(&self.filename);
        p
    }
}

/// Validates, per the prefix allow-list, that a sanitised path-segment
/// sequence begins with one of the configured allowed prefixes. `None`
/// means "no restriction"; `Some(&[])` means "nothing is allowed".
pub fn check_prefix_allow_list(
    segments: &[String],
    allow_list: Option<&[String]>,
) -> Result<(), ArchiverError> {
    let Some(allowed) = allow_list else {
        return Ok(());
    };
    if allowed.is_empty() {
        return Err(permanent(
            "an empty prefix allow-list is configured; no archive path is permitted",
        ));
    }
    let normalised: Vec<Vec<String>> = allowed
        .iter()
        .map(|p| sanitise_prefix_for_comparison(p))
        .collect();
    if normalised.iter().any(|prefix| segments.starts_with(prefix)) {
        Ok(())
    } else {
        Err(permanent(format!(
            "sanitised path {:?} does not match any configured allow-list prefix",
            segments.join("/")
        )))
    }
}

fn sanitise_prefix_for_comparison(prefix: &str) -> Vec<String> {
    prefix.split(['/', '\\']).map(sanitise_segment).collect()
}

/// Confirms that `root ⊕ rel_path`, resolved lexically against a
/// symlink-resolved `root`, is a strict descendant of `root`. This is the
/// invariant under test in §8-1; it never performs I/O beyond resolving
/// `root` itself (the caller is expected to have already canonicalised
/// `root` once at startup).
pub fn assert_root_containment(resolved_root: &Path, rel_path: &Path) -> Result<PathBuf, ArchiverError> {
    for component in rel_path.components() {
        match component {
            Component::Normal(_) => {}
            other => {
                return Err(permanent(format!(
                    "archive path contains a disallowed component: {other:?}"
                )));
            }
        }
    }
    let joined = resolved_root.join(rel_path);
    if joined.starts_with(resolved_root) && joined != resolved_root {
        Ok(joined)
    } else {
        Err(permanent(format!(
            "resolved path {joined:?} escapes storage root {resolved_root:?}"
        )))
    }
}

/// Resolves `{ticket_number}` and `{timestamp_utc}` tokens in a filename
/// pattern, then validates and sanitises the result as a single segment.
pub fn render_filename(pattern: &str, ticket_number: &str, now: DateTime<Utc>) -> Result<String, ArchiverError> {
    let timestamp = now.format("%Y-%m-%d").to_string();
    let rendered = pattern
        .replace("{ticket_number}", ticket_number)
        .replace("{timestamp_utc}", &timestamp);

    let trimmed = rendered.trim();
    if trimmed.is_empty() {
        return Err(permanent("rendered filename is empty after trimming"));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(permanent(format!("rendered filename {trimmed:?} is a traversal token")));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed.contains('\0') {
        return Err(permanent(
            "rendered filename pattern produced more than one path segment, or contains NUL",
        ));
    }
    let sanitised = sanitise_segment(trimmed);
    if sanitised.is_empty() {
        return Err(permanent("rendered filename sanitised to an empty string"));
    }
    if sanitised.len() > MAX_FILENAME_LEN {
        return Err(permanent(format!(
            "rendered filename is {} bytes, exceeds the {MAX_FILENAME_LEN}-byte limit",
            sanitised.len()
        )));
    }
    Ok(sanitised)
}

/// Validates and sanitises a full set of untrusted `>`-separated path
/// segments (or an already-split sequence) against depth and per-segment
/// constraints, producing the sanitised segment list. Does not include the
/// user segment or filename.
pub fn validate_and_sanitise_segments(raw_segments: &[String]) -> Result<Vec<String>, ArchiverError> {
    if raw_segments.len() > MAX_DEPTH {
        return Err(permanent(format!(
            "path depth {} exceeds the {MAX_DEPTH}-segment limit",
            raw_segments.len()
        )));
    }
    raw_segments
        .iter()
        .map(|seg| {
            validate_segment(seg)?;
            Ok(sanitise_segment(seg))
        })
        .collect()
}

/// Splits a raw `archive_path` field on `>`, trimming whitespace around
/// each piece, as accepted from the TMS custom-field shape.
pub fn split_archive_path_field(raw: &str) -> Vec<String> {
    raw.split('>').map(|s| s.trim().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_dot_dot() {
        assert!(validate_segment("..").is_err());
        assert!(validate_segment(".").is_err());
    }

    #[test]
    fn rejects_empty_after_trim() {
        assert!(validate_segment("   ").is_err());
    }

    #[test]
    fn rejects_separator_characters() {
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("a\\b").is_err());
        assert!(validate_segment("a\0b").is_err());
    }

    #[test]
    fn segment_length_boundary() {
        let ok = "a".repeat(MAX_SEGMENT_LEN);
        let too_long = "a".repeat(MAX_SEGMENT_LEN + 1);
        assert!(validate_segment(&ok).is_ok());
        assert!(validate_segment(&too_long).is_err());
    }

    #[test]
    fn depth_boundary() {
        let ok: Vec<String> = (0..MAX_DEPTH).map(|i| format!("s{i}")).collect();
        let too_deep: Vec<String> = (0..=MAX_DEPTH).map(|i| format!("s{i}")).collect();
        assert!(validate_and_sanitise_segments(&ok).is_ok());
        assert!(validate_and_sanitise_segments(&too_deep).is_err());
    }

    #[test]
    fn sanitisation_is_idempotent() {
        let raw = "Acme Corp / Support!!  ëxample";
        let once = sanitise_segment(raw);
        let twice = sanitise_segment(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn fullwidth_traversal_survives_to_root_containment_and_is_rejected() {
        // U+FF0E FULLWIDTH FULL STOP, twice: validate_segment only rejects
        // the literal "." / ".." tokens, so this raw segment passes
        // unchanged (§4.1: validation runs before sanitisation, on the raw
        // string). NFKD then folds the fullwidth stops to ASCII periods, so
        // sanitisation *does* launder it into a literal "..". The traversal
        // is still caught: the root-containment check classifies any ".."
        // path component as `Component::ParentDir` and rejects it, so the
        // write path never escapes the root regardless of what sanitisation
        // produced.
        let fullwidth_dotdot = "\u{FF0E}\u{FF0E}";
        assert!(validate_segment(fullwidth_dotdot).is_ok());
        let sanitised = sanitise_segment(fullwidth_dotdot);
        assert_eq!(sanitised, "..");

        let root = Path::new("/archive/root");
        let rel = Path::new(&sanitised);
        assert!(assert_root_containment(root, rel).is_err());
    }

    #[test]
    fn root_containment_rejects_escaping_path() {
        let root = Path::new("/archive/root");
        let escaping = Path::new("../../etc/passwd");
        assert!(assert_root_containment(root, escaping).is_err());
    }

    #[test]
    fn root_containment_accepts_nested_path() {
        let root = Path::new("/archive/root");
        let nested = Path::new("acme/support/Ticket-1_2026-07-01.pdf");
        let resolved = assert_root_containment(root, nested).unwrap();
        assert!(resolved.starts_with(root));
    }

    #[test]
    fn prefix_allow_list_empty_means_nothing_allowed() {
        let segments = vec!["acme".to_string()];
        let err = check_prefix_allow_list(&segments, Some(&[])).unwrap_err();
        assert_eq!(err.code, archiver_retry::ErrorCode::PathPolicy);
    }

    #[test]
    fn prefix_allow_list_none_means_unrestricted() {
        let segments = vec!["anything".to_string()];
        assert!(check_prefix_allow_list(&segments, None).is_ok());
    }

    #[test]
    fn prefix_allow_list_does_not_match_mid_segment() {
        let segments = vec!["acme".to_string(), "support".to_string()];
        let allow_list = vec!["ac".to_string()];
        let err = check_prefix_allow_list(&segments, Some(&allow_list)).unwrap_err();
        assert_eq!(err.code, archiver_retry::ErrorCode::PathPolicy);
    }

    #[test]
    fn prefix_allow_list_does_not_match_mid_segment_on_a_later_component() {
        let segments = vec!["a".to_string(), "bc".to_string()];
        let allow_list = vec!["a/b".to_string()];
        let err = check_prefix_allow_list(&segments, Some(&allow_list)).unwrap_err();
        assert_eq!(err.code, archiver_retry::ErrorCode::PathPolicy);
    }

    #[test]
    fn prefix_allow_list_matches_exact_leading_segments() {
        let segments = vec!["acme".to_string(), "support".to_string(), "2026".to_string()];
        let allow_list = vec!["acme/support".to_string()];
        assert!(check_prefix_allow_list(&segments, Some(&allow_list)).is_ok());
    }

    #[test]
    fn filename_pattern_resolves_tokens() {
        let now = DateTime::parse_from_rfc3339("2026-07-28T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let name = render_filename("Ticket-{ticket_number}_{timestamp_utc}.pdf", "12345", now).unwrap();
        assert_eq!(name, "Ticket-12345_2026-07-28.pdf");
    }

    #[test]
    fn filename_length_boundary() {
        let now = Utc::now();
        let long_number = "9".repeat(MAX_FILENAME_LEN);
        let err = render_filename("{ticket_number}", &long_number, now);
        assert!(err.is_err());
    }
}
