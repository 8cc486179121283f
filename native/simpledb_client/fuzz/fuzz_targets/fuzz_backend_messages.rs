#![no_main]
//! Fuzz test for the client's read path
//!
//! Everything the server sends passes through the frame splitter and the
//! backend message decoder. Malformed input must surface as a codec error.
//! The input is fed in two chunks so partial frames are exercised too.

use libfuzzer_sys::fuzz_target;
use simpledb_client::codec::FrameBuffer;
use simpledb_client::message::BackendMessage;

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |b| *b as usize).min(data.len());
    let mut frames = FrameBuffer::new();
    for chunk in [&data[..split], &data[split..]] {
        frames.extend(chunk);
        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => {
                    let _ = BackendMessage::decode(frame);
                }
                Ok(None) => break,
                Err(_) => return,
            }
        }
    }
});
