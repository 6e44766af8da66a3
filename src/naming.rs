//! Destination name resolution for uploaded files.
//!
//! A stored name is `stem + "_" + timestamp + extension`, where the stem and
//! extension come from the sanitized client-declared filename and the
//! timestamp is the capture time in milliseconds since the Unix epoch.
//!
//! Sanitization strips every directory component (both `/` and `\`), so the
//! result is always a single path segment inside the upload directory.

/// Stem used when nothing usable survives sanitization.
pub const FALLBACK_STEM: &str = "upload";

/// Stems are cut to this many bytes so the full name stays under common
/// filesystem limits (255 bytes) once the timestamp and extension are added.
const MAX_STEM_LEN: usize = 200;

/// Longer suffixes are not treated as an extension.
const MAX_EXTENSION_LEN: usize = 16;

const RESERVED_CHARS: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

/// Reduce a client-declared filename to a safe, single-segment file name.
///
/// Never fails: an empty or fully stripped name becomes [`FALLBACK_STEM`].
pub fn sanitize_filename(declared: &str) -> String {
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !RESERVED_CHARS.contains(c))
        .collect();

    // No hidden files, no "." / ".." and no trailing dots or spaces
    let trimmed = cleaned
        .trim()
        .trim_start_matches('.')
        .trim_end_matches(['.', ' '])
        .trim();

    if trimmed.is_empty() {
        FALLBACK_STEM.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Split a file name into stem and extension, the extension keeping its
/// leading dot. A name without a dot (or with only a leading dot) has no
/// extension: `archive.tar.gz` -> (`archive.tar`, `.gz`).
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && name.len() - idx <= MAX_EXTENSION_LEN => name.split_at(idx),
        _ => (name, ""),
    }
}

/// Compute the stored file name for `declared` at `timestamp_ms`.
pub fn resolve_stored_name(declared: &str, timestamp_ms: i64) -> String {
    let sanitized = sanitize_filename(declared);
    let (stem, extension) = split_name(&sanitized);
    let stem = truncate_at_char_boundary(stem, MAX_STEM_LEN);
    let stem = if stem.is_empty() { FALLBACK_STEM } else { stem };

    format!("{stem}_{timestamp_ms}{extension}")
}

fn truncate_at_char_boundary(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_name_follows_stem_timestamp_extension() {
        assert_eq!(
            resolve_stored_name("backup.zip", 1_700_000_000_123),
            "backup_1700000000123.zip"
        );
        assert_eq!(
            resolve_stored_name("site.tar.gz", 42),
            "site.tar_42.gz"
        );
        assert_eq!(resolve_stored_name("README", 7), "README_7");
    }

    #[test]
    fn test_path_traversal_is_stripped() {
        assert_eq!(resolve_stored_name("../../etc/passwd", 1), "passwd_1");
        assert_eq!(
            resolve_stored_name("..\\..\\windows\\evil.zip", 1),
            "evil_1.zip"
        );
        assert_eq!(resolve_stored_name("/abs/path/data.zip", 1), "data_1.zip");
        assert_eq!(resolve_stored_name("..", 1), "upload_1");
        assert_eq!(resolve_stored_name("dir/", 1), "upload_1");
    }

    #[test]
    fn test_empty_and_hidden_names() {
        assert_eq!(resolve_stored_name("", 5), "upload_5");
        assert_eq!(resolve_stored_name("   ", 5), "upload_5");
        assert_eq!(resolve_stored_name(".zip", 5), "zip_5");
        assert_eq!(resolve_stored_name(".hidden.zip", 5), "hidden_5.zip");
    }

    #[test]
    fn test_reserved_and_control_characters_removed() {
        assert_eq!(
            sanitize_filename("re<po>rt:|?*\"\u{0}\n.zip"),
            "report.zip"
        );
        assert_eq!(sanitize_filename("name. . ."), "name");
    }

    #[test]
    fn test_unicode_names_survive() {
        assert_eq!(resolve_stored_name("文件.zip", 9), "文件_9.zip");
    }

    #[test]
    fn test_long_stems_are_truncated_on_char_boundary() {
        let long = format!("{}.zip", "é".repeat(300));
        let stored = resolve_stored_name(&long, 1);
        assert!(stored.ends_with("_1.zip"));
        assert!(stored.len() <= MAX_STEM_LEN + "_1.zip".len());
        assert!(stored.is_char_boundary(stored.len() - "_1.zip".len()));
    }

    #[test]
    fn test_overlong_suffix_is_not_an_extension() {
        let name = "archive.thisisnotreallyanextension";
        assert_eq!(split_name(name), (name, ""));
    }

    #[test]
    fn test_distinct_timestamps_give_distinct_names() {
        assert_ne!(
            resolve_stored_name("same.zip", 1000),
            resolve_stored_name("same.zip", 1001)
        );
    }
}
