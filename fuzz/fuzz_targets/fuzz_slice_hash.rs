//! Fuzz target for slice assignment.
//!
//! Slice assignment must never panic and must stay inside `[0, 1024)` for
//! arbitrary persistence ids, including non-ASCII and embedded NULs.

#![no_main]

use event_replication::envelope::{slice_for_persistence_id, NUMBER_OF_SLICES};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|pid: &str| {
    let slice = slice_for_persistence_id(pid);
    assert!(slice < NUMBER_OF_SLICES);

    // Determinism
    assert_eq!(slice, slice_for_persistence_id(pid));
});
