//! Micro-benchmarks for the two hottest paths: the bucket-mark CAS loop and
//! the reservation fast path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sfs_accounting::mark::AtomicBucketMark;
use sfs_accounting::{
    AccountingConfig, DevConfig, DiskReservation, Fs, ReservationFlags,
};
use sfs_types::DataType;

fn bench_mark_cmpxchg(c: &mut Criterion) {
    let mark = AtomicBucketMark::default();

    c.bench_function("mark_cmpxchg_uncontended", |b| {
        b.iter(|| {
            let (old, new) = mark.update(|m| {
                let m = if m.dirty_sectors() >= 16_000 {
                    m.with_dirty_sectors(0)
                } else {
                    m.checked_add_dirty(8).unwrap()
                };
                m.with_data_type(DataType::User)
            });
            black_box((old, new));
        });
    });
}

fn bench_reservation_fast_path(c: &mut Criterion) {
    let fs = Fs::new(AccountingConfig {
        shards: 4,
        btree_node_size: 256,
    });
    fs.dev_buckets_alloc(DevConfig {
        first_bucket: 0,
        nbuckets: 1 << 20,
        bucket_size: 512,
    })
    .unwrap();

    c.bench_function("reservation_add_put", |b| {
        b.iter(|| {
            let mut res = DiskReservation::default();
            fs.reservation_add(&mut res, black_box(8), ReservationFlags::default())
                .unwrap();
            fs.reservation_put(&mut res);
        });
    });
}

criterion_group!(benches, bench_mark_cmpxchg, bench_reservation_fast_path);
criterion_main!(benches);
