#![no_main]

libfuzzer_sys::fuzz_target!(|data: &[u8]| {
    let _ = vigil_parser::parse_message(data);
});
