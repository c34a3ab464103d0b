//! Masking of secrets embedded in PhoneTrack URLs.
//!
//! The endpoint URL carries its auth token either as a `token=` query
//! parameter or as a long hex path segment
//! (`.../getlastpositions/<32+ hex chars>`). Any URL that reaches a log line or
//! an error message must go through [`redact_url`] or [`Redacted`] first.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

const MIN_HEX_SEGMENT_LEN: usize = 32;

fn token_param() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)([?&]token=)[^&#]*").expect("token regex is valid"))
}

fn is_secret_segment(segment: &str) -> bool {
    segment.len() >= MIN_HEX_SEGMENT_LEN && segment.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Return `url` with the token query parameter and any long hex path segment
/// replaced by `[REDACTED]`.
pub fn redact_url(url: &str) -> String {
    let split = url.find(|c: char| c == '?' || c == '#').unwrap_or(url.len());
    let (path, tail) = url.split_at(split);

    let path = path
        .split('/')
        .map(|segment| if is_secret_segment(segment) { REDACTED } else { segment })
        .collect::<Vec<_>>()
        .join("/");

    let tail = token_param().replace_all(tail, format!("${{1}}{REDACTED}"));
    format!("{path}{tail}")
}

/// Display adapter for log macros: `debug!("fetching {}", Redacted(&url))`.
#[derive(Debug, Clone, Copy)]
pub struct Redacted<'a>(pub &'a str);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&redact_url(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_TOKEN: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn test_redacts_token_query_param() {
        let url = "https://cloud.example.org/apps/phonetrack/api/getlastpositions?token=s3cr3t&x=1";
        assert_eq!(
            redact_url(url),
            "https://cloud.example.org/apps/phonetrack/api/getlastpositions?token=[REDACTED]&x=1"
        );
    }

    #[test]
    fn test_redacts_token_not_first_param() {
        let url = "https://h/getlastpositions?a=1&token=abc";
        assert_eq!(redact_url(url), "https://h/getlastpositions?a=1&token=[REDACTED]");
    }

    #[test]
    fn test_redacts_hex_path_segment() {
        let url = format!("https://h/apps/phonetrack/api/getlastpositions/{HEX_TOKEN}");
        let out = redact_url(&url);
        assert_eq!(out, "https://h/apps/phonetrack/api/getlastpositions/[REDACTED]");
        assert!(!out.contains(HEX_TOKEN));
    }

    #[test]
    fn test_redacts_consecutive_hex_segments() {
        let url = format!("https://h/getlastpositions/{HEX_TOKEN}/{HEX_TOKEN}?token=t");
        assert_eq!(
            redact_url(&url),
            "https://h/getlastpositions/[REDACTED]/[REDACTED]?token=[REDACTED]"
        );
    }

    #[test]
    fn test_short_hex_and_plain_segments_untouched() {
        let url = "https://h/api/getlastpositions/deadbeef";
        assert_eq!(redact_url(url), url);
    }

    #[test]
    fn test_hex_in_query_value_is_not_a_path_segment() {
        let url = format!("https://h/getlastpositions?session={HEX_TOKEN}");
        assert_eq!(redact_url(&url), url);
    }

    #[test]
    fn test_display_adapter() {
        let url = "http://h/getlastpositions?token=abc";
        assert_eq!(
            format!("{}", Redacted(url)),
            "http://h/getlastpositions?token=[REDACTED]"
        );
    }
}
