//! Cache-Control policy for media responses.

/// Upper bound for stale-while-revalidate (6 hours).
pub const MAX_STALE_WHILE_REVALIDATE_SECS: u64 = 6 * 60 * 60;

/// Header value for responses that must never be cached.
pub const NO_STORE: &str = "no-store";

/// Compute the `Cache-Control` value for a max-age in seconds.
///
/// Zero disables caching entirely. A positive age is shared-cache friendly,
/// with a revalidation window of twice the age capped at six hours.
pub fn cache_control_value(max_age_secs: u64) -> String {
    if max_age_secs == 0 {
        return NO_STORE.to_string();
    }

    let swr = max_age_secs
        .saturating_mul(2)
        .min(MAX_STALE_WHILE_REVALIDATE_SECS);
    format!(
        "public, max-age={max_age_secs}, s-maxage={max_age_secs}, stale-while-revalidate={swr}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_no_store() {
        let value = cache_control_value(0);
        assert!(value.contains("no-store"));
        assert!(!value.contains("public"));
    }

    #[test]
    fn test_one_hour() {
        assert_eq!(
            cache_control_value(3600),
            "public, max-age=3600, s-maxage=3600, stale-while-revalidate=7200"
        );
    }

    #[test]
    fn test_swr_is_capped() {
        let value = cache_control_value(31_536_000);
        assert!(value.contains("s-maxage=31536000"));
        assert!(value.ends_with("stale-while-revalidate=21600"));
    }

    #[test]
    fn test_swr_never_exceeds_cap() {
        for age in [1, 59, 3600, 10_800, 10_801, 86_400, u64::MAX] {
            let value = cache_control_value(age);
            let swr: u64 = value
                .rsplit('=')
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap();
            assert!(swr <= MAX_STALE_WHILE_REVALIDATE_SECS, "age {age} gave {swr}");
            assert!(swr <= age.saturating_mul(2));
        }
    }
}
