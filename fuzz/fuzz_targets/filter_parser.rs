#![no_main]

use libfuzzer_sys::fuzz_target;
use vaiven::filter::TypeNameFilter;

fuzz_target!(|data: &[u8]| {
    // Convert arbitrary bytes to UTF-8 string (lossy conversion)
    if let Ok(input) = std::str::from_utf8(data) {
        // Attempt to parse the filter specification
        // This should not panic regardless of input
        if let Ok(filter) = TypeNameFilter::from_spec(input) {
            // Matching must not panic either
            let _ = filter.matches("app::module::Type");
        }
    }
});
