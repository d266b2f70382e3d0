//! Default User-Agent and cookie header formatting for crawler traffic.

use std::collections::BTreeMap;

/// Project URL for User-Agent identification (RFC 9308).
const PROJECT_UA_URL: &str = "https://github.com/fierce/predator";

/// Default User-Agent sent when the builder configures none.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("predator/{version} (+{PROJECT_UA_URL})")
}

/// Formats a cookie map as a single `Cookie` header value.
///
/// Pairs are emitted in key order so the header is stable across runs.
#[must_use]
pub(crate) fn cookie_header(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_has_version_and_url() {
        let ua = default_user_agent();
        assert!(ua.contains(PROJECT_UA_URL), "UA must contain project URL");
        assert_eq!(
            Some(env!("CARGO_PKG_VERSION")),
            ua.strip_prefix("predator/")
                .and_then(|s| s.split(' ').next()),
            "UA must contain crate version"
        );
    }

    #[test]
    fn test_cookie_header_is_sorted() {
        let cookies = BTreeMap::from([
            ("session".to_string(), "abc".to_string()),
            ("lang".to_string(), "en".to_string()),
        ]);
        assert_eq!(cookie_header(&cookies), "lang=en; session=abc");
        assert_eq!(cookie_header(&BTreeMap::new()), "");
    }
}
