#![no_main]

use libfuzzer_sys::fuzz_target;
use moira::consensus::event::EventHeader;

fuzz_target!(|data: &[u8]| {
    // The canonical event codec parses length-prefixed variable fields
    // (parents, extra, signature). It must never panic on arbitrary bytes,
    // returning a DecodeError for anything malformed or truncated.
    let _ = EventHeader::decode(data);
});
