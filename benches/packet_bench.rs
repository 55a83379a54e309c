use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use uni_rpc::core::codec::{FormatCodec, PacketCodec};
use uni_rpc::core::packet::Packet;
use uni_rpc::core::serialization::SerializationFormat;
use uni_rpc::core::value::{Map, Value};

fn request_with_payload(size: usize) -> Packet {
    let mut record = Map::new();
    record.insert("id".into(), Value::Int(42));
    record.insert("blob".into(), Value::Bytes(vec![0xAB; size]));
    Packet::request("storage::put", vec![Value::from("bucket"), Value::Map(record)])
}

#[allow(clippy::unwrap_used)]
fn bench_packet_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536];
    let formats = [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        for format in formats {
            let codec = FormatCodec::new(format);
            let name = format.name().to_lowercase();

            group.bench_function(format!("encode_{name}_{size}b"), |b| {
                b.iter_batched(
                    || request_with_payload(size),
                    |packet| codec.encode(&packet).unwrap(),
                    BatchSize::SmallInput,
                )
            });

            let bytes = codec.encode(&request_with_payload(size)).unwrap();
            group.bench_function(format!("decode_{name}_{size}b"), |b| {
                b.iter(|| {
                    let decoded = codec.decode(&bytes);
                    assert!(decoded.is_ok());
                })
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_packet_encode_decode);
criterion_main!(benches);
