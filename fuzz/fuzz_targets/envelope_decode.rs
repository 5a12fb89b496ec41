//! Fuzz target for envelope decoding
//!
//! Decoding must never panic, and anything it accepts must survive a
//! re-encode unchanged.

#![no_main]

use gametunnel_core::{Destination, Envelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::decode(data) {
        let reencoded = envelope.encode();
        assert_eq!(Envelope::decode(&reencoded).ok(), Some(envelope));
    }

    if let Ok((_, consumed)) = Envelope::decode_prefix(data) {
        assert!(consumed <= data.len());
    }

    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<Destination, _> = s.parse();
    }
});
