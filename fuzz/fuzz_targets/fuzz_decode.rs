//! Fuzz target for change payload decoding.
//!
//! `maybe_decompress` and `decode_document` must never panic on arbitrary
//! input, with or without an expected hash.

#![no_main]

use feed_replicator::change::{content_hash, decode_document, maybe_decompress};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = maybe_decompress(data);
    let _ = decode_document(data, None);

    // A body always verifies against its own hash when it decompresses
    if let Ok(body) = maybe_decompress(data) {
        let hash = content_hash(&body);
        if let Err(e) = decode_document(data, Some(&hash)) {
            assert!(!e.to_string().contains("hash mismatch"));
        }
    }
});
