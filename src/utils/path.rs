//! URL construction helpers shared by the single-backend proxy, the
//! composite handler and the dry-run handler.
//!
//! The one property every caller relies on: joining a backend base URL with
//! a request path never produces a doubled separator, regardless of
//! trailing slashes on the base or leading slashes on the path.

/// Joins `base` (a backend's absolute URL, with or without a trailing slash
/// and with or without its own path component) to `request_path` and
/// `query`, producing a URL with exactly one `/` between every component and
/// none immediately after the host other than the one separating it from the
/// path.
///
/// ```
/// use proxy_core::utils::path::join_backend_url;
///
/// assert_eq!(join_backend_url("http://b/", "/api/v1/test", None), "http://b/api/v1/test");
/// assert_eq!(join_backend_url("http://b", "/api/v1/test", None), "http://b/api/v1/test");
/// assert_eq!(join_backend_url("http://b/", "api/v1/test", None), "http://b/api/v1/test");
/// assert_eq!(join_backend_url("http://b", "", None), "http://b/");
/// assert_eq!(join_backend_url("http://b/svc/", "/x", Some("a=1")), "http://b/svc/x?a=1");
/// ```
pub fn join_backend_url(base: &str, request_path: &str, query: Option<&str>) -> String {
    let base_trimmed = base.trim_end_matches('/');
    let path_trimmed = request_path.trim_start_matches('/');

    let mut url = String::with_capacity(base_trimmed.len() + path_trimmed.len() + 2);
    url.push_str(base_trimmed);
    url.push('/');
    url.push_str(path_trimmed);

    if let Some(q) = query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }
    url
}

/// Joins two path segments (neither of which is a full URL), collapsing any
/// adjacent `/` at the seam. Used when composing a health-check path onto a
/// backend base URL.
///
/// ```
/// use proxy_core::utils::path::join_path_segment;
///
/// assert_eq!(join_path_segment("http://b:9000/", "/health"), "http://b:9000/health");
/// assert_eq!(join_path_segment("http://b:9000", "health"), "http://b:9000/health");
/// ```
pub fn join_path_segment(base: &str, segment: &str) -> String {
    let base_trimmed = base.trim_end_matches('/');
    let segment_trimmed = segment.trim_start_matches('/');
    format!("{base_trimmed}/{segment_trimmed}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_url_joining_never_doubles_separators() {
        let cases = [
            ("http://b/", "/api/v1/test"),
            ("http://b", "/api/v1/test"),
            ("http://b/", "api/v1/test"),
            ("http://b", "api/v1/test"),
        ];
        for (base, path) in cases {
            let joined = join_backend_url(base, path, None);
            assert_eq!(joined, "http://b/api/v1/test", "base={base} path={path}");
            assert!(!joined[8..].contains("//"), "doubled separator in {joined}");
        }
    }

    #[test]
    fn query_string_is_appended_after_a_single_question_mark() {
        let joined = join_backend_url("http://b/", "/x", Some("a=1&b=2"));
        assert_eq!(joined, "http://b/x?a=1&b=2");
    }

    #[test]
    fn empty_query_is_not_appended() {
        let joined = join_backend_url("http://b", "/x", Some(""));
        assert_eq!(joined, "http://b/x");
    }

    #[test]
    fn empty_request_path_joins_to_bare_slash() {
        assert_eq!(join_backend_url("http://b", "", None), "http://b/");
        assert_eq!(join_backend_url("http://b/", "", None), "http://b/");
    }
}
