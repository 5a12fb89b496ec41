//! Fuzz target for stream reassembly
//!
//! Feeds arbitrary bytes through the frame splitter until it needs more
//! input or reports a fatal error. Must never panic or loop forever.

#![no_main]

use gametunnel_core::Control;
use gametunnel_core::frame::split_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    for control in [Control::Keepalive, Control::KeepaliveAck] {
        let mut buf = data.to_vec();
        loop {
            let before = buf.len();
            match split_frame(&mut buf, control) {
                Ok(Some(_)) => assert!(buf.len() < before),
                Ok(None) => break,
                Err(e) if e.is_recoverable() => assert!(buf.len() < before),
                Err(_) => break,
            }
        }
    }
});
