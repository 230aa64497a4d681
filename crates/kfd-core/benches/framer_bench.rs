//! Criterion benchmarks for the KMM framer and the bit-level tables.
//!
//! Frame assembly happens between the ready response and the first start
//! bit, inside the window where the radio is waiting for a command, so it
//! needs to stay negligible next to a single bit period (250 µs at the
//! default 4 kbaud).
//!
//! Run with:
//! ```bash
//! cargo bench --package kfd-core --bench framer_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use kfd_core::protocol::crc::crc16;
use kfd_core::protocol::framer::{inventory_frame, modify_key_frame, zeroize_frame};
use kfd_core::twi::codec::{bit_reverse, parity_bit};
use kfd_core::KeyItem;

fn aes_key() -> KeyItem {
    KeyItem {
        keyset_id: 1,
        sln: 202,
        key_id: 202,
        algorithm_id: 0x84,
        key: (0x11..=0x30).collect(),
        erase: false,
    }
}

fn bench_crc(c: &mut Criterion) {
    let frame = modify_key_frame(&[aes_key()]);
    let payload = &frame[3..frame.len() - 2];

    c.bench_function("crc16_modify_key_payload", |b| {
        b.iter(|| crc16(black_box(payload)))
    });

    let large = vec![0xA5u8; 512];
    c.bench_function("crc16_512_bytes", |b| b.iter(|| crc16(black_box(&large))));
}

fn bench_builders(c: &mut Criterion) {
    let key = aes_key();
    c.bench_function("build_modify_key_frame", |b| {
        b.iter(|| modify_key_frame(black_box(std::slice::from_ref(&key))))
    });

    let many: Vec<KeyItem> = (0..16)
        .map(|i| KeyItem {
            sln: 100 + i,
            key_id: 100 + i,
            ..aes_key()
        })
        .collect();
    c.bench_function("build_modify_key_frame_16_keys", |b| {
        b.iter(|| modify_key_frame(black_box(&many)))
    });

    c.bench_function("build_zeroize_frame", |b| b.iter(zeroize_frame));
    c.bench_function("build_inventory_frame", |b| {
        b.iter(|| inventory_frame(black_box(0x02)))
    });
}

fn bench_bit_tables(c: &mut Criterion) {
    c.bench_function("bit_reverse_sweep", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for byte in 0..=255u8 {
                acc = acc.wrapping_add(u32::from(bit_reverse(black_box(byte))));
            }
            acc
        })
    });

    c.bench_function("parity_sweep", |b| {
        b.iter(|| {
            let mut acc = 0u32;
            for byte in 0..=255u8 {
                acc += u32::from(parity_bit(black_box(byte)));
            }
            acc
        })
    });
}

criterion_group!(benches, bench_crc, bench_builders, bench_bit_tables);
criterion_main!(benches);
