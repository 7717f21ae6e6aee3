#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(raw) = std::str::from_utf8(data) {
        let _ = indieauthd::scopes::scope_valid(raw);
        for scope in indieauthd::scopes::split_scope_string(raw) {
            assert!(indieauthd::scopes::scope_valid(&scope));
        }
    }
});
