#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;
use uni_rpc::transport::tcp::FrameCodec;

fuzz_target!(|data: &[u8]| {
    // Feed arbitrary bytes to the TCP framing until it stops yielding frames
    let mut codec = FrameCodec::with_max_frame(64 * 1024);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
});
