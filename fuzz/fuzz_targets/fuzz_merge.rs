#![no_main]
use libfuzzer_sys::fuzz_target;
use xlmerge::{validate, MergeOptions, Merger, Package};

fuzz_target!(|data: &[u8]| {
    let package = match Package::from_bytes(data) {
        Ok(p) => p,
        Err(_) => return,
    };
    let _ = validate(&package);
    let merger = Merger::new().with_options(MergeOptions::default().with_verify(false));
    if let Ok(merged) = merger.merge_packages(&package, &package) {
        // a consistent package merged with itself stays consistent
        if validate(&package).map_or(false, |issues| issues.is_empty()) {
            assert!(validate(&merged).map_or(true, |issues| issues.is_empty()));
        }
    }
});
