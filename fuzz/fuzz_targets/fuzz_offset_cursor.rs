//! Fuzz target for offset cursor bookkeeping.
//!
//! For any observation sequence, the cursor timestamp never regresses and
//! every entry recorded in `seen` is covered.

#![no_main]

use chrono::TimeZone;
use event_replication::envelope::TimestampOffset;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|events: Vec<(i32, u8, i32)>| {
    let mut offset = TimestampOffset::new(chrono::Utc.timestamp_micros(0).unwrap());

    for (micros, pid, seq) in events {
        let ts = chrono::Utc.timestamp_micros(micros as i64).unwrap();
        let pid = format!("pid-{}", pid % 8);
        let before = offset.timestamp;

        offset.observe(ts, &pid, seq as i64);
        assert!(offset.timestamp >= before);
    }

    for (pid, seq) in offset.seen.clone() {
        assert!(offset.covers(offset.timestamp, &pid, seq));
    }
});
