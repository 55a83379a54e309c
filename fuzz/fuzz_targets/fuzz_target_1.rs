#![no_main]

use libfuzzer_sys::fuzz_target;
use uni_rpc::core::codec::{FormatCodec, PacketCodec};
use uni_rpc::core::serialization::SerializationFormat;

fuzz_target!(|data: &[u8]| {
    // Fuzz packet decoding in every format - test for panics, crashes, infinite loops
    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        let _ = FormatCodec::new(format).decode(data);
    }
});
