//! Environment variable helpers.
//!
//! Unset and empty variables are treated the same way: both fall back to the
//! default.

use std::str::FromStr;

/// Variable holding the service name used for log tagging and as the
/// default outbound `User-Agent`.
pub const SERVICE_NAME: &str = "SERVICE_NAME";

/// The value of `key`, or `None` when unset, empty, or not valid unicode.
pub fn get(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

pub fn get_or(key: &str, default: &str) -> String {
    get(key).unwrap_or_else(|| default.to_owned())
}

/// Reads a boolean. `1`, `true`, `yes`, `on` are true and `0`, `false`,
/// `no`, `off` are false, case-insensitively; anything else is `default`.
pub fn get_bool(key: &str, default: bool) -> bool {
    get(key).and_then(|v| parse_bool(&v)).unwrap_or(default)
}

/// Parses `key` as `T`, falling back to `default` when unset or malformed.
pub fn get_parsed<T: FromStr>(key: &str, default: T) -> T {
    match get(key).map(|v| v.trim().parse::<T>()) {
        Some(Ok(v)) => v,
        Some(Err(_)) => {
            tracing::warn!(key, "ignoring malformed environment variable");
            default
        }
        None => default,
    }
}

/// `SERVICE_NAME`, or an empty string.
pub fn service_name() -> String {
    get_or(SERVICE_NAME, "")
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_and_falsy_tokens() {
        for t in ["1", "true", "TRUE", "Yes", "on", " on "] {
            assert_eq!(parse_bool(t), Some(true), "{t}");
        }
        for f in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_bool(f), Some(false), "{f}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn unset_variables_fall_back() {
        let key = "SVCKIT_TEST_SURELY_UNSET_VARIABLE";
        assert_eq!(get(key), None);
        assert_eq!(get_or(key, "dflt"), "dflt");
        assert!(get_bool(key, true));
        assert_eq!(get_parsed(key, 25_u64), 25);
    }
}
