//! Fuzz target for wire frame decoding.
//!
//! Arbitrary bytes must never panic the codec; they either decode to a
//! message or return a protocol error.

#![no_main]

use bytes::Bytes;
use event_replication::codec::{decode_stream_in, decode_stream_out};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let frame = Bytes::copy_from_slice(data);
    let _ = decode_stream_in(&frame);
    let _ = decode_stream_out(&frame);
});
