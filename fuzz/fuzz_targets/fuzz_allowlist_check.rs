#![no_main]

use libfuzzer_sys::fuzz_target;

use media_proxy::media::allowlist::{AllowlistEntry, OriginAllowlist};

fuzz_target!(|data: &str| {
    let mut allowlist = OriginAllowlist::default();
    if let Ok(entry) = AllowlistEntry::parse("https://cdn.example.com") {
        allowlist.push(entry);
    }
    if let Ok(entry) = AllowlistEntry::parse("https://project.storage.example.net") {
        allowlist.push(entry.with_path_prefix("/storage/v1/object/public"));
    }

    // Must never panic, and anything admitted must be on an allowlisted origin.
    if let Ok(url) = allowlist.check(data) {
        let host = url.host_str().unwrap_or_default();
        assert!(host == "cdn.example.com" || host == "project.storage.example.net");
        assert_eq!(url.scheme(), "https");
        assert!(url.username().is_empty() && url.password().is_none());
        if host == "project.storage.example.net" {
            assert!(url.path().starts_with("/storage/v1/object/public/"));
        }
    }
});
