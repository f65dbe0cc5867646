#![allow(clippy::unwrap_used)]

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use session_wire::core::ByteBuffer;
use session_wire::utils::buffer_pool::shared_pool;

const FIELDS: u32 = 1024;

fn write_fields(buffer: &mut ByteBuffer) {
    for i in 0..FIELDS {
        buffer.write(i).unwrap();
        buffer.write(i as f32 * 0.5).unwrap();
        buffer.write(i % 2 == 0).unwrap();
    }
}

fn bench_byte_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("byte_buffer");
    group.throughput(Throughput::Elements(u64::from(FIELDS) * 3));

    group.bench_function("write_fields_growing", |b| {
        b.iter(|| {
            let mut buffer = ByteBuffer::create(0);
            write_fields(&mut buffer);
            buffer
        })
    });
    group.bench_function("write_fields_presized", |b| {
        b.iter(|| {
            let mut buffer = ByteBuffer::create(FIELDS as usize * 9);
            write_fields(&mut buffer);
            buffer
        })
    });
    group.bench_function("read_fields", |b| {
        let mut writer = ByteBuffer::create(0);
        write_fields(&mut writer);
        let bytes = writer.to_bytes();
        b.iter(|| {
            let mut reader = ByteBuffer::reader(bytes.clone());
            for _ in 0..FIELDS {
                reader.read::<u32>().unwrap();
                reader.read::<f32>().unwrap();
                reader.read::<bool>().unwrap();
            }
        })
    });
    group.bench_function("strings", |b| {
        b.iter(|| {
            let mut buffer = ByteBuffer::create(0);
            for _ in 0..64 {
                buffer.write_str(Some("player-name")).unwrap();
            }
            let mut reader = ByteBuffer::reader(buffer.to_bytes());
            for _ in 0..64 {
                reader.read_string().unwrap();
            }
        })
    });

    group.finish();
}

fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");
    group.bench_function("acquire_release_4k", |b| {
        b.iter(|| {
            let mut buffer = shared_pool().acquire(4096);
            buffer.extend_from_slice(&[1u8; 64]);
        })
    });
    group.bench_function("vec_alloc_4k", |b| {
        b.iter(|| {
            let mut buffer: Vec<u8> = Vec::with_capacity(4096);
            buffer.extend_from_slice(&[1u8; 64]);
            buffer
        })
    });
    group.finish();
}

criterion_group!(benches, bench_byte_buffer, bench_buffer_pool);
criterion_main!(benches);
