use criterion::{black_box, criterion_group, criterion_main, Criterion};
use genericio::block::{encode_block, CompressionSettings};
use genericio::crc64::{crc64, crc64_parallel};
use genericio::{CodecId, Endianness, GioConfig, GioWriter, SelfComm, Variable};
use std::sync::Arc;

fn bench_crc(c: &mut Criterion) {
    let data: Vec<u8> = (0..16 * 1024 * 1024u32).map(|i| ((i * 31) >> 3) as u8).collect();

    c.bench_function("crc64_16mb", |b| b.iter(|| crc64(black_box(&data))));
    c.bench_function("crc64_parallel_16mb", |b| b.iter(|| crc64_parallel(black_box(&data))));
}

fn bench_blocks(c: &mut Criterion) {
    let values: Vec<f32> = (0..256 * 1024).map(|i| (i / 16) as f32 * 0.25).collect();
    let bytes: &[u8] = bytemuck::cast_slice(&values);
    let host = Endianness::host();

    for (name, codec) in [("zstd", CodecId::Zstd), ("lz4", CodecId::Lz4)] {
        let settings = CompressionSettings { codec, level: 3, shuffle: true };
        c.bench_function(&format!("encode_block_1mb_{name}"), |b| {
            b.iter(|| encode_block(black_box(bytes), 4, Some(&settings), host).unwrap())
        });
    }
}

fn bench_write(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench.gio").to_string_lossy().into_owned();
    let x: Vec<f64> = (0..128 * 1024).map(|i| i as f64).collect();
    let id: Vec<u64> = (0..128 * 1024).collect();

    c.bench_function("write_2mb_single_rank", |b| {
        b.iter(|| {
            let mut writer = GioWriter::new(Arc::new(SelfComm::default()), &path, GioConfig::default());
            writer.set_num_elems(x.len() as u64);
            writer.write(&mut [Variable::new("x", &x), Variable::new("id", &id)]).unwrap();
        })
    });
}

criterion_group!(benches, bench_crc, bench_blocks, bench_write);
criterion_main!(benches);
