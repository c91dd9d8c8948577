use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gridsync::edit::{apply_edit, CommittedOp, Edit, Operation};
use gridsync::protocol::{ClientFrame, ServerFrame};
use gridsync::query::{Predicate, SubscriptionIndex};
use gridsync::storage::{PersistedStore, StorageConfig};
use gridsync::store::DocumentStore;
use gridsync::transform::{transform_edit, transform_operation};
use gridsync::value::{Collection, DocData};
use uuid::Uuid;

fn records() -> Collection {
    Collection::records("tbl1")
}

fn set(field: &str, value: &str) -> Edit {
    Edit::SetField { field_id: field.into(), value: value.into() }
}

fn submit_frame() -> ClientFrame {
    ClientFrame::SubmitOp {
        request_id: 1,
        collection: records(),
        doc_id: "rec1".into(),
        base_version: 7,
        op_id: Uuid::new_v4(),
        edits: vec![set("f1", "typical cell value")],
    }
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = submit_frame();

    c.bench_function("submit_frame_encode", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode().unwrap());
        })
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = submit_frame().encode().unwrap();

    c.bench_function("submit_frame_decode", |b| {
        b.iter(|| {
            black_box(ClientFrame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_server_frame_roundtrip(c: &mut Criterion) {
    c.bench_function("op_applied_frame_roundtrip", |b| {
        b.iter(|| {
            let frame = ServerFrame::OpApplied {
                collection: records(),
                doc_id: "rec1".into(),
                new_version: 8,
                edits: vec![set("f1", "value")],
            };
            let encoded = frame.encode().unwrap();
            black_box(ServerFrame::decode(&encoded).unwrap());
        })
    });
}

fn bench_apply_edit(c: &mut Criterion) {
    let mut data = DocData::from_pairs((0..50).map(|i| (format!("f{i}"), "value")));
    let edit = set("f25", "updated");

    c.bench_function("apply_set_field_50_fields", |b| {
        b.iter(|| {
            apply_edit(black_box(&mut data), black_box(&edit)).unwrap();
        })
    });
}

fn bench_transform_edit(c: &mut Criterion) {
    let ours = Edit::InsertElement { field_id: "tags".into(), index: 5, value: "x".into() };
    let theirs = Edit::InsertElement { field_id: "tags".into(), index: 2, value: "y".into() };

    c.bench_function("transform_insert_vs_insert", |b| {
        b.iter(|| {
            black_box(transform_edit(black_box(&ours), black_box(&theirs)).unwrap());
        })
    });
}

fn bench_transform_operation_over_missed(c: &mut Criterion) {
    let op = Operation::new(
        records(),
        "rec1",
        0,
        Uuid::new_v4(),
        vec![set("mine", "v"), Edit::InsertElement {
            field_id: "tags".into(),
            index: 3,
            value: "x".into(),
        }],
    );
    // 10 committed ops the submission missed.
    let missed: Vec<CommittedOp> = (1..=10)
        .map(|v| CommittedOp {
            op: Operation::new(
                records(),
                "rec1",
                v - 1,
                Uuid::new_v4(),
                vec![set(&format!("f{v}"), "w")],
            ),
            version: v,
            sequence: v,
        })
        .collect();

    c.bench_function("transform_operation_10_missed", |b| {
        b.iter(|| {
            black_box(transform_operation(black_box(op.clone()), black_box(&missed)).unwrap());
        })
    });
}

fn bench_predicate_match(c: &mut Criterion) {
    let p = Predicate::id_not_in((0..20).map(|i| format!("f{i}")));
    let data = DocData::new();

    c.bench_function("predicate_not_in_20", |b| {
        b.iter(|| {
            black_box(black_box(&p).matches(black_box("f99"), &data));
        })
    });
}

fn bench_notify_100_subscriptions(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let index = SubscriptionIndex::new();
    let collection = records();

    rt.block_on(async {
        for i in 0..100 {
            index
                .subscribe(
                    Uuid::new_v4(),
                    collection.clone(),
                    Predicate::Eq { attr: "bucket".into(), value: format!("b{}", i % 10).into() },
                    &[],
                )
                .await;
        }
    });

    let data = DocData::from_pairs([("bucket", "b3"), ("f1", "value")]);

    c.bench_function("notify_100_subscriptions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let events = index.notify(&collection, "rec1", black_box(&data), 1).await;
                black_box(events);
            });
        })
    });
}

fn bench_store_append(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = DocumentStore::new();
    rt.block_on(async {
        store
            .append(Operation::new(
                records(),
                "rec1",
                0,
                Uuid::new_v4(),
                vec![Edit::Replace { data: DocData::new() }],
            ))
            .await
            .unwrap();
    });

    c.bench_function("store_append_set_field", |b| {
        let mut version = 1u64;
        b.iter(|| {
            rt.block_on(async {
                let op = Operation::new(
                    records(),
                    "rec1",
                    version,
                    Uuid::new_v4(),
                    vec![set("f1", "value")],
                );
                black_box(store.append(op).await.unwrap());
            });
            version += 1;
        })
    });
}

fn bench_persisted_save_document(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("gridsync_bench_save_{}", Uuid::new_v4()));
    let store = PersistedStore::open(StorageConfig::for_testing(&dir)).unwrap();
    let collection = records();
    let data = DocData::from_pairs((0..30).map(|i| (format!("f{i}"), "some cell content")));

    c.bench_function("persisted_save_document_30_fields", |b| {
        let mut version = 1u64;
        b.iter(|| {
            store
                .save_document(&collection, "rec1", black_box(&data), version)
                .unwrap();
            version += 1;
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_persisted_load_snapshot(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("gridsync_bench_load_{}", Uuid::new_v4()));
    let store = PersistedStore::open(StorageConfig::for_testing(&dir)).unwrap();
    let collection = records();
    let data = DocData::from_pairs((0..30).map(|i| (format!("f{i}"), "some cell content")));
    store.save_document(&collection, "rec1", &data, 1).unwrap();

    c.bench_function("persisted_load_snapshot_30_fields", |b| {
        b.iter(|| {
            black_box(store.load_snapshot(&collection, black_box("rec1")).unwrap());
        })
    });

    drop(store);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_server_frame_roundtrip,
    bench_apply_edit,
    bench_transform_edit,
    bench_transform_operation_over_missed,
    bench_predicate_match,
    bench_notify_100_subscriptions,
    bench_store_append,
    bench_persisted_save_document,
    bench_persisted_load_snapshot,
);
criterion_main!(benches);
