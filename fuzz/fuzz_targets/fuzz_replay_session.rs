//! Fuzz target: recorded session parser
//!
//! Arbitrary text must either parse into a session whose frame times
//! never go backwards, or be rejected with an error.
//!
//! cargo fuzz run fuzz_replay_session

#![no_main]

use libfuzzer_sys::fuzz_target;
use smartsnack::adapters::replay::ReplaySession;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = core::str::from_utf8(data) else {
        return;
    };
    if let Ok(session) = ReplaySession::parse(text) {
        assert!(session.len() <= text.lines().count());
        assert_eq!(session.is_empty(), session.len() == 0);
        let _ = session.duration_ms();
    }
});
