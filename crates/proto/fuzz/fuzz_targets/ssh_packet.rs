//! Fuzz target for SSH packet framing.
//!
//! Feeds random bytes to the standalone parser and to the streaming opener,
//! looking for panics and for frames that parse but do not re-serialize.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tern_proto::ssh::packet::PacketOpener;
use tern_proto::ssh::Packet;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed = Packet::from_bytes(&serialized).expect("re-parse of a valid frame");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    // The opener must either wait for more bytes, yield frames, or fail; never panic.
    let mut opener = PacketOpener::new();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = opener.open(&mut buf) {}
});
