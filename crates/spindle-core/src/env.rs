//! Environment variable utilities
//!
//! Small helpers for reading typed values out of the environment with a
//! default, used by logging and the config registry.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return the default.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get environment variable as boolean.
///
/// "1", "true", "yes", "on" (case-insensitive) count as true; anything
/// else, including unset, returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let v: u64 = env_get("SPINDLE_TEST_UNSET_VAR_XYZ", 7);
        assert_eq!(v, 7);
    }

    #[test]
    fn test_env_get_bool_default() {
        assert!(env_get_bool("SPINDLE_TEST_UNSET_VAR_XYZ", true));
        assert!(!env_get_bool("SPINDLE_TEST_UNSET_VAR_XYZ", false));
    }
}
