//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary text through `AppConfig::parse()`, which covers TOML
//! decoding, serde defaults and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = coresentry_config::AppConfig::parse(s) {
            // Anything that validates must also resolve its derived values.
            let _ = config.core.process_name();
            let _ = config.auth.resolved_key_dir();
        }
    }
});
