#![no_main]

use libfuzzer_sys::fuzz_target;
use usbipd::wire::cmd::{Command, Reply};

// Decoding tolerates nonzero padding, so raw bytes are not always
// canonical; the invariant is that re-encoding a decoded message decodes
// back to the same message.

fuzz_target!(|data: &[u8]| {
    if let Ok((command, _)) = Command::decode(data) {
        let mut bytes = Vec::new();
        command.encode(&mut bytes);
        let (again, used) = Command::decode(&bytes).expect("re-encoded command must decode");
        assert_eq!(used, bytes.len());
        assert_eq!(again, command);
    }
    if let Ok((reply, _)) = Reply::decode(data) {
        let mut bytes = Vec::new();
        reply.encode(&mut bytes);
        let (again, used) = Reply::decode(&bytes).expect("re-encoded reply must decode");
        assert_eq!(used, bytes.len());
        assert_eq!(again, reply);
    }
});
