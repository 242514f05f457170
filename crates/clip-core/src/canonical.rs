//! Source URL canonicalization.

use url::Url;

use crate::error::{ClipError, Result};

/// Canonicalize a source URL so that trivially different spellings of the
/// same source map to one Source row.
///
/// Scheme and host are lowercased and default ports dropped by the parser;
/// on top of that the fragment is removed, query pairs are sorted, an empty
/// query is removed and a trailing slash on a non-root path is trimmed.
pub fn canonicalize_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ClipError::invalid_url(raw, "empty URL"));
    }

    let mut url =
        Url::parse(trimmed).map_err(|e| ClipError::invalid_url(trimmed, e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ClipError::invalid_url(
                trimmed,
                format!("unsupported scheme '{}'", other),
            ))
        }
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ClipError::invalid_url(trimmed, "missing host"));
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let stripped = path.trim_end_matches('/');
        url.set_path(if stripped.is_empty() { "/" } else { stripped });
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_forms_collapse() {
        let a = canonicalize_url("HTTPS://WWW.Example.com:443/watch?v=abc&t=10#frag").unwrap();
        let b = canonicalize_url("  https://www.example.com/watch?t=10&v=abc ").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "https://www.example.com/watch?t=10&v=abc");
    }

    #[test]
    fn test_trailing_slash_and_empty_query() {
        assert_eq!(
            canonicalize_url("http://example.com/videos/1/?").unwrap(),
            "http://example.com/videos/1"
        );
        assert_eq!(
            canonicalize_url("http://example.com").unwrap(),
            "http://example.com/"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(canonicalize_url("").is_err());
        assert!(canonicalize_url("not a url").is_err());
        assert!(canonicalize_url("ftp://example.com/file").is_err());
        assert!(canonicalize_url("file:///tmp/video.mp4").is_err());

        let err = canonicalize_url("mailto:someone@example.com").unwrap_err();
        assert_eq!(err.error_code(), "INVALID_URL");
    }
}
