#![no_main]

use bisect_registry::rewrite;
use bisect_types::{Cutoff, PackageMetadataDocument};
use chrono::{DateTime, Utc};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(mut doc) = serde_json::from_str::<PackageMetadataDocument>(json_str) else {
        return;
    };

    let cutoff = Cutoff::new(DateTime::<Utc>::from_timestamp(0, 0).unwrap());
    rewrite(&mut doc, cutoff);

    // Whatever survived must still serialize, and every version left in
    // `versions` must have a matching `time` entry.
    let reserialized = serde_json::to_string(&doc).expect("rewritten document must serialize");
    let roundtripped: PackageMetadataDocument =
        serde_json::from_str(&reserialized).expect("rewritten document must parse back");
    assert_eq!(doc.versions.len(), roundtripped.versions.len());
});
