#![no_main]

use indieauthd::envelope::EnvelopeCodec;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

fn codec() -> &'static EnvelopeCodec {
    static CODEC: OnceLock<EnvelopeCodec> = OnceLock::new();
    CODEC.get_or_init(|| EnvelopeCodec::new("fuzz-secret"))
}

// Unpacking arbitrary input must only ever fail cleanly.
fuzz_target!(|data: &[u8]| {
    if let Ok(sealed) = std::str::from_utf8(data) {
        let _ = codec().unpack::<serde_json::Value>(sealed);
    }
});
