//! Cookie jar helpers: `Cookie` header assembly and rotated-cookie merge.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, SET_COOKIE};
use std::collections::BTreeMap;

/// Values servers send to clear a cookie.
const TOMBSTONES: &[&str] = &["delete me", "deleted", "\"\""];

/// Serializes the whole jar as one `Cookie` header value.
pub fn cookie_header(jar: &BTreeMap<String, String>) -> String {
    jar.iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parses the name and value out of one `Set-Cookie` header.
///
/// Returns `None` for malformed headers and for cookies being cleared
/// (empty value, tombstone value, `Max-Age` of zero or less, or an
/// `Expires` date already past).
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    parse_set_cookie_at(raw, Utc::now())
}

fn parse_set_cookie_at(raw: &str, now: DateTime<Utc>) -> Option<(String, String)> {
    let mut parts = raw.split(';');
    let (name, value) = parts.next()?.split_once('=')?;
    let name = name.trim();
    let value = value.trim();

    if name.is_empty() || value.is_empty() || TOMBSTONES.iter().any(|t| *t == value) {
        return None;
    }

    let mut max_age = None;
    let mut expires = None;
    for attr in parts {
        let Some((k, v)) = attr.split_once('=') else {
            continue;
        };
        let (k, v) = (k.trim(), v.trim());
        if k.eq_ignore_ascii_case("max-age") {
            max_age = v.parse::<i64>().ok();
        } else if k.eq_ignore_ascii_case("expires") {
            expires = parse_http_date(v);
        }
    }
    // Max-Age wins over Expires
    let cleared = match (max_age, expires) {
        (Some(seconds), _) => seconds <= 0,
        (None, Some(at)) => at <= now,
        (None, None) => false,
    };
    if cleared {
        return None;
    }
    Some((name.to_string(), value.to_string()))
}

/// Parses an `Expires` value, including the dashed `01-Jan-1970` form.
fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(&raw.replace('-', " "))
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

/// Every cookie set by a response, in header order.
pub fn rotated_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(parse_set_cookie)
        .collect()
}

/// Merges `rotated` into `jar`. Cookies absent from `rotated` are kept.
///
/// Returns true when any value changed.
pub fn merge(jar: &mut BTreeMap<String, String>, rotated: &[(String, String)]) -> bool {
    let mut changed = false;
    for (name, value) in rotated {
        if jar.get(name) != Some(value) {
            jar.insert(name.clone(), value.clone());
            changed = true;
        }
    }
    changed
}
