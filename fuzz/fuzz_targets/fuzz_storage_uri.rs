// SPDX-License-Identifier: PMPL-1.0-or-later
// Fuzz target for storage URI resolution and option parsing

#![no_main]

use coffer_db::{DatabaseOptions, UriRegistry};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        // Resolution either yields kwargs or an error, never a panic.
        let registry = UriRegistry::with_defaults();
        if let Ok((_factory, kwargs)) = registry.resolve_uri(s) {
            let _ = DatabaseOptions::from_kwargs(&kwargs);
        }
    }
});
