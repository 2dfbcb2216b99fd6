//! Fuzz target for SSH packet opening and SFTP reply decoding.
//!
//! Random input must never panic the packet opener or the SFTP decoder.
//! Any packet that opens must survive a seal and reopen unchanged.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tern_proto::ssh::packet::{OpeningState, SealingState};
use tern_proto::ssh::sftp::message::Response;

fuzz_target!(|data: &[u8]| {
    let mut opener = OpeningState::plaintext();
    opener.feed(data);
    while let Ok(Some(payload)) = opener.try_open() {
        let mut sealer = SealingState::plaintext();
        let wire = sealer.seal(&payload).expect("sealing a received payload");
        let mut reopener = OpeningState::plaintext();
        reopener.feed(&wire);
        let reopened = reopener
            .try_open()
            .expect("round trip should open")
            .expect("round trip should be complete");
        assert_eq!(payload, reopened);
    }

    let _ = Response::parse(data);
});
