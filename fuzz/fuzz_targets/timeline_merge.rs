#![no_main]

use bisect_types::{sort_and_dedup_timeline, TimelineEvent};
use chrono::{TimeZone, Utc};
use libfuzzer_sys::fuzz_target;

/// Builds a handful of `TimelineEvent`s from raw bytes: few enough distinct
/// names and times that duplicates are likely, which is the case this
/// target is meant to exercise.
fn events_from(data: &[u8]) -> Vec<TimelineEvent> {
    data.chunks(3)
        .map(|chunk| {
            let name = format!("pkg-{}", chunk.first().copied().unwrap_or(0) % 4);
            let version = format!("1.0.{}", chunk.get(1).copied().unwrap_or(0) % 4);
            let seconds = chunk.get(2).copied().unwrap_or(0) as i64 % 8;
            let time = Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now);
            TimelineEvent::new(name, version, time)
        })
        .collect()
}

fuzz_target!(|data: &[u8]| {
    let events = events_from(data);
    let input_len = events.len();
    let merged = sort_and_dedup_timeline(events);

    assert!(merged.len() <= input_len);
    assert!(merged.windows(2).all(|w| w[0] <= w[1]));

    let mut seen = std::collections::HashSet::new();
    for event in &merged {
        assert!(seen.insert((event.package_name.clone(), event.version.clone())));
    }
});
