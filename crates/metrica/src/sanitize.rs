//! Helpers for keeping file paths and content hashes out of span fields
//! and user-visible messages in full.

use std::path::Path;

/// Returns only the filename component of a path.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Same as [`redact_path`] for names that arrive as strings, such as
/// upload filenames chosen by the client.
pub fn redact_name(name: &str) -> String {
    redact_path(Path::new(name))
}

/// First 12 hex characters of a content hash, enough for log correlation.
pub fn short_hash(hash: &str) -> &str {
    match hash.char_indices().nth(12) {
        Some((idx, _)) => &hash[..idx],
        None => hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_path_returns_filename() {
        assert_eq!(
            redact_path(Path::new("/home/clerk/scans/baptisms-1911.pdf")),
            "baptisms-1911.pdf"
        );
        assert_eq!(redact_path(Path::new("/")), "<unknown>");
        assert_eq!(redact_name("C/uploads/page 3.png"), "page 3.png");
    }

    #[test]
    fn test_short_hash() {
        let hash = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert_eq!(short_hash(hash), "ba7816bf8f01");
        assert_eq!(short_hash("abc"), "abc");
    }
}
