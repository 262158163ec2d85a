//! Fuzz target for request authentication.
//!
//! Run with: cargo +nightly fuzz run fuzz_auth_headers
//!
//! Splits the input into an `X-Timestamp` and an `X-Signature` value and
//! checks them against a fixed trusted key.

#![no_main]

use std::time::{Duration, UNIX_EPOCH};

use coresentry_core::auth::AuthGate;
use ed25519_dalek::SigningKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let split = split as usize % (rest.len() + 1);
    let (ts, sig) = rest.split_at(split);
    let (Ok(ts), Ok(sig)) = (std::str::from_utf8(ts), std::str::from_utf8(sig)) else {
        return;
    };

    let gate = AuthGate::new(std::env::temp_dir(), Duration::from_secs(60));
    gate.install_key(SigningKey::from_bytes(&[42; 32]).verifying_key());

    let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    let _ = gate.authenticate_at(Some(ts), Some(sig), now);
    let _ = gate.verify_signature(ts, sig);
});
