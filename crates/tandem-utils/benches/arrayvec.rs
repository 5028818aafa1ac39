use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

const N: usize = 1024;

fn bench_push_pop(c: &mut Criterion) {
    c.bench_function("arrayvec_push_pop", |b| {
        b.iter(|| {
            let mut v: tandem_utils::ArrayVec<u32, N> = tandem_utils::ArrayVec::new();
            for i in 0..N as u32 {
                v.push(black_box(i));
            }
            while v.pop().is_some() {}
            black_box(v);
        })
    });
}

fn bench_indexed_access(c: &mut Criterion) {
    c.bench_function("arrayvec_indexed_access", |b| {
        b.iter_batched(
            || {
                let mut v: tandem_utils::ArrayVec<u32, N> = tandem_utils::ArrayVec::new();
                for i in 0..N as u32 {
                    v.push(i);
                }
                v
            },
            |v| {
                let mut acc = 0u32;
                for i in 0..N {
                    acc = acc.wrapping_add(black_box(v[i]));
                }
                black_box(acc);
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_push_pop, bench_indexed_access);
criterion_main!(benches);
