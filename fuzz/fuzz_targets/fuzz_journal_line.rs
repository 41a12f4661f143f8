//! Fuzz target: journal line decoder
//!
//! A torn or corrupted journal line must be rejected, never panic, and
//! anything accepted must survive a re-encode unchanged.
//!
//! cargo fuzz run fuzz_journal_line

#![no_main]

use libfuzzer_sys::fuzz_target;
use smartsnack::storage::journal::decode_line;

fuzz_target!(|data: &[u8]| {
    let Ok(line) = core::str::from_utf8(data) else {
        return;
    };
    let Ok(entry) = decode_line(line) else {
        return;
    };

    let encoded = serde_json::to_string(&entry).expect("decoded entry re-encodes");
    let again = decode_line(&encoded).expect("re-encoded entry decodes");
    assert_eq!(entry, again, "journal entry changed across re-encode");
});
