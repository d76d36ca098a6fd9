use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use imapvault::archive::{ArchiveStore, StoreOptions};

const MESSAGES: u32 = 500;

fn sample_body(uid: u32) -> Vec<u8> {
    let mut body = format!("From: sender{uid}@example.org\r\nSubject: message {uid}\r\n\r\n")
        .into_bytes();
    body.extend_from_slice(&b"Lorem ipsum dolor sit amet.\r\n".repeat(40));
    body
}

fn fill(store: &ArchiveStore) {
    for uid in 1..=MESSAGES {
        store
            .write_message(uid, sample_body(uid), vec!["Inbox".to_string()])
            .unwrap();
    }
}

fn options() -> StoreOptions {
    StoreOptions {
        sync_writes: false,
        ..StoreOptions::default()
    }
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(u64::from(MESSAGES)));
    group.bench_function("write_message", |b| {
        b.iter_batched(
            || tempfile::tempdir().unwrap(),
            |dir| {
                let store = ArchiveStore::open_with(dir.path().join("b.imapvault"), options())
                    .unwrap();
                fill(&store);
                store.write_close().unwrap();
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

fn bench_reopen(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("b.imapvault");
    let idx_path = dir.path().join("b.imapvault.idx");
    {
        let store = ArchiveStore::open_with(&path, options()).unwrap();
        fill(&store);
        store.write_close().unwrap();
    }

    c.bench_function("reopen_with_index", |b| {
        b.iter(|| ArchiveStore::open_with(&path, options()).unwrap().size())
    });

    c.bench_function("reopen_full_replay", |b| {
        b.iter_batched(
            || std::fs::remove_file(&idx_path).ok(),
            |_| ArchiveStore::open_with(&path, options()).unwrap().size(),
            BatchSize::PerIteration,
        )
    });
}

criterion_group!(benches, bench_append, bench_reopen);
criterion_main!(benches);
