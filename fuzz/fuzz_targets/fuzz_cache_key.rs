#![no_main]

use libfuzzer_sys::fuzz_target;

use media_proxy::media::cache_key::CacheKey;

fuzz_target!(|input: (&str, u32, u8)| {
    let (origin, width, quality) = input;
    let key = CacheKey::derive("_variants", origin, width, quality);

    // Deterministic, and never escapes the variant prefix.
    assert_eq!(key, CacheKey::derive("_variants", origin, width, quality));
    assert!(key.as_str().starts_with("_variants/"));
    assert!(!key.as_str().contains(".."));
});
