//! Fuzz target for SEC 1 point decoding.
//!
//! Any input accepted by `decode` must encode back to the same bytes.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ec_point -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tern_proto::ssh::ec_point::{decode, encode, Curve};

fuzz_target!(|data: &[u8]| {
    for curve in [Curve::NistP256, Curve::NistP384, Curve::NistP521] {
        if let Ok(point) = decode(data, curve) {
            assert_eq!(encode(&point), data);
            assert_eq!(point.curve(), curve);
        }
    }
});
