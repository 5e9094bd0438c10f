use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use voice_assistant_client::transport::CryptoStream;

const KEY: [u8; 16] = [0x42; 16];
const NONCE: [u8; 16] = [0x01, 0, 0, 0, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0, 0x11, 0, 0, 0, 0];

pub fn criterion_benchmark(c: &mut Criterion) {
    // Opus frames at 16 kHz / 60 ms land between a few dozen and a few hundred bytes
    for size in [40usize, 160, 960] {
        let payload = vec![0xAB; size];
        let mut group = c.benchmark_group(format!("datagram_{}", size));
        group.throughput(Throughput::Bytes(size as u64));

        let mut sender = CryptoStream::new(KEY, NONCE);
        group.bench_function("seal", |b| {
            b.iter(|| sender.seal(black_box(&payload)).unwrap());
        });

        let mut sender = CryptoStream::new(KEY, NONCE);
        let mut receiver = CryptoStream::new(KEY, NONCE);
        group.bench_function("seal_open", |b| {
            b.iter(|| {
                let datagram = sender.seal(black_box(&payload)).unwrap();
                receiver.open(&datagram).unwrap()
            });
        });

        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
