#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use parking_lot::Mutex;
use strata::catalog::{
    BatchedWriter, Catalog, Collection, CounterMetrics, LockMode, LockResource,
    MemoryDurableCatalog, OpContext, VersionManager, WriteJob,
};
use strata::{
    CatalogError, CatalogId, CatalogOptions, CollectionId, Namespace, Timestamp,
};

fn ns(text: &str) -> Namespace {
    Namespace::parse(text).expect("namespace")
}

fn collection(raw: u128, namespace: &str) -> Collection {
    Collection::new(
        CollectionId::from_u128(raw),
        ns(namespace),
        CatalogId(raw as u64),
        format!("collection-{raw}").as_str(),
    )
}

fn writer() -> OpContext {
    OpContext::new().with_claim(LockResource::Global, LockMode::Exclusive)
}

fn catalog() -> Catalog {
    Catalog::new(Arc::new(MemoryDurableCatalog::new()), CatalogOptions::default())
}

fn create(catalog: &Catalog, raw: u128, namespace: &str, ts: u64) -> Arc<Collection> {
    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    let handle = catalog
        .register_create(&ctx, collection(raw, namespace), Some(Timestamp(ts)))
        .unwrap();
    unit.commit(Some(Timestamp(ts))).unwrap();
    handle
}

#[test]
fn jobs_in_one_batch_publish_one_version() {
    let manager = VersionManager::default();
    let before = manager.generation();
    let a: WriteJob = Box::new(|version| {
        version.register_collection(Arc::new(collection(1, "db.a")), Some(Timestamp(5)))
    });
    let b: WriteJob = Box::new(|version| {
        version.register_collection(Arc::new(collection(2, "db.b")), Some(Timestamp(5)))
    });
    let results = manager.write_batch(vec![a, b]);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(manager.generation(), before + 1);
    let latest = manager.latest();
    assert!(latest.lookup_by_namespace(&ns("db.a")).is_some());
    assert!(latest.lookup_by_namespace(&ns("db.b")).is_some());
}

#[test]
fn concurrent_writers_never_expose_partial_batches() {
    let catalog = catalog();
    let threads = 8u128;
    let barrier = Arc::new(Barrier::new(threads as usize + 1));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let catalog = catalog.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last_generation = 0;
            let mut last_count = 0;
            while !done.load(Ordering::Acquire) {
                let version = catalog.manager().latest();
                assert!(version.generation() >= last_generation);
                let count = version.registry().len();
                assert!(count >= last_count, "collections disappeared");
                assert_eq!(version.stats().user_collections, count);
                last_generation = version.generation();
                last_count = count;
            }
        })
    };

    let writers: Vec<_> = (1..=threads)
        .map(|raw| {
            let catalog = catalog.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                create(&catalog, raw, &format!("db.c{raw}"), 10 + raw as u64);
            })
        })
        .collect();
    barrier.wait();
    for handle in writers {
        handle.join().unwrap();
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();

    let ctx = OpContext::new();
    assert_eq!(catalog.stats(&ctx).user_collections, threads as usize);
    assert!(catalog.manager().generation() <= threads as u64);
    assert!(catalog.manager().generation() >= 1);
}

#[test]
fn failing_job_only_fails_its_caller() {
    let metrics = Arc::new(CounterMetrics::default());
    let manager = VersionManager::with_metrics(Default::default(), metrics.clone());
    let good: WriteJob = Box::new(|version| {
        version.register_collection(Arc::new(collection(1, "db.a")), None)
    });
    let bad: WriteJob = Box::new(|version| {
        version.register_collection(Arc::new(collection(2, "db.b")), None)?;
        Err(CatalogError::Durable("disk on fire".into()))
    });
    let results = manager.write_batch(vec![good, bad]);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(CatalogError::Durable(_))));
    let latest = manager.latest();
    assert!(latest.lookup_by_namespace(&ns("db.a")).is_some());
    assert!(latest.lookup_by_namespace(&ns("db.b")).is_none());
    assert_eq!(metrics.jobs_failed.load(Ordering::Relaxed), 1);
}

#[test]
fn panicking_job_leaves_latest_untouched() {
    let manager = VersionManager::default();
    let before = manager.generation();
    let result = manager.write(|_| panic!("job exploded"));
    assert!(matches!(result, Err(CatalogError::Invariant(_))));
    assert_eq!(manager.generation(), before);
    manager.write(|_| Ok(())).unwrap();
    assert_eq!(manager.generation(), before + 1);
}

#[test]
fn open_snapshot_keeps_reading_its_version() {
    let catalog = catalog();
    create(&catalog, 1, "db.a", 5);

    let reader = OpContext::new();
    reader.open_snapshot(None);
    let pinned = catalog.current(&reader);
    create(&catalog, 2, "db.b", 6);

    assert!(Arc::ptr_eq(&catalog.current(&reader), &pinned));
    assert!(catalog.lookup_by_namespace(&reader, &ns("db.b")).is_none());
    assert!(catalog.lookup_by_namespace(&reader, &ns("db.a")).is_some());

    reader.close_snapshot();
    assert!(catalog.lookup_by_namespace(&reader, &ns("db.b")).is_some());
}

#[test]
fn rollback_discards_staged_changes_and_runs_handlers_in_reverse() {
    let catalog = catalog();
    create(&catalog, 1, "db.a", 5);
    let order = Arc::new(Mutex::new(Vec::new()));

    let ctx = writer();
    {
        let unit = ctx.begin_unit().unwrap();
        catalog
            .register_create(&ctx, collection(2, "db.b"), Some(Timestamp(6)))
            .unwrap();
        catalog
            .deregister(&ctx, CollectionId::from_u128(1), false, Some(Timestamp(6)))
            .unwrap();
        for step in 1..=3 {
            let order = Arc::clone(&order);
            ctx.on_rollback(move || order.lock().push(step)).unwrap();
        }
        assert!(catalog.lookup_by_namespace(&ctx, &ns("db.a")).is_none());
        assert!(catalog.lookup_by_namespace(&ctx, &ns("db.b")).is_some());
        unit.rollback();
    }
    assert_eq!(*order.lock(), vec![3, 2, 1]);
    assert!(catalog.lookup_by_namespace(&ctx, &ns("db.a")).is_some());
    assert!(catalog.lookup_by_namespace(&ctx, &ns("db.b")).is_none());
}

#[test]
fn commit_handlers_see_the_commit_timestamp_after_publication() {
    let catalog = catalog();
    let seen = Arc::new(Mutex::new(None));
    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    catalog
        .register_create(&ctx, collection(1, "db.a"), Some(Timestamp(9)))
        .unwrap();
    {
        let seen = Arc::clone(&seen);
        let probe = catalog.clone();
        ctx.on_commit(move |ts| {
            let visible = probe
                .lookup_by_namespace(&OpContext::new(), &ns("db.a"))
                .is_some();
            *seen.lock() = Some((ts, visible));
        })
        .unwrap();
    }
    unit.commit(Some(Timestamp(9))).unwrap();
    assert_eq!(*seen.lock(), Some((Some(Timestamp(9)), true)));
}

#[test]
fn namespace_conflicts_are_reported() {
    let catalog = catalog();
    create(&catalog, 1, "db.a", 5);
    create(&catalog, 2, "db.b", 5);

    let ctx = writer();
    let _unit = ctx.begin_unit().unwrap();
    let err = catalog
        .register_create(&ctx, collection(3, "db.a"), None)
        .unwrap_err();
    assert!(matches!(err, CatalogError::NamespaceExists(_)));
    let err = catalog
        .register_create(&ctx, collection(1, "db.z"), None)
        .unwrap_err();
    assert!(matches!(err, CatalogError::CollectionIdExists(_)));
    let err = catalog
        .rename(&ctx, CollectionId::from_u128(1), &ns("db.b"), None)
        .unwrap_err();
    assert!(err.is_conflict());
}

#[test]
fn swap_through_a_vacated_namespace_in_one_unit() {
    let catalog = catalog();
    create(&catalog, 1, "db.a", 5);
    create(&catalog, 2, "db.b", 5);

    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    catalog
        .rename(&ctx, CollectionId::from_u128(1), &ns("db.tmp"), Some(Timestamp(8)))
        .unwrap();
    catalog
        .rename(&ctx, CollectionId::from_u128(2), &ns("db.a"), Some(Timestamp(8)))
        .unwrap();
    unit.commit(Some(Timestamp(8))).unwrap();

    let reader = OpContext::new();
    assert_eq!(
        catalog.lookup_id_by_namespace(&reader, &ns("db.a")),
        Some(CollectionId::from_u128(2))
    );
    assert_eq!(
        catalog.lookup_namespace_by_id(&reader, CollectionId::from_u128(1)),
        Some(ns("db.tmp"))
    );
    assert!(catalog.lookup_by_namespace(&reader, &ns("db.b")).is_none());
}

#[test]
fn batched_writer_folds_units_into_one_version() {
    let catalog = catalog();
    let ctx = writer();
    let before = catalog.manager().generation();
    let batch = BatchedWriter::begin(catalog.manager(), &ctx).unwrap();
    for raw in 1..=4u128 {
        let unit = ctx.begin_unit().unwrap();
        catalog
            .register_create(&ctx, collection(raw, &format!("db.c{raw}")), Some(Timestamp(3)))
            .unwrap();
        unit.commit(Some(Timestamp(3))).unwrap();
    }
    // The owning thread reads the batch; everyone else still sees the base.
    assert_eq!(catalog.stats(&ctx).user_collections, 4);
    assert_eq!(catalog.manager().latest().registry().len(), 0);
    batch.finish().unwrap();
    assert_eq!(catalog.manager().generation(), before + 1);
    assert_eq!(catalog.manager().latest().registry().len(), 4);
}

#[test]
fn batched_writer_requires_global_exclusive_and_detects_interleaving() {
    let catalog = catalog();
    let plain = OpContext::new();
    assert!(BatchedWriter::begin(catalog.manager(), &plain).is_err());

    let ctx = writer();
    let batch = BatchedWriter::begin(catalog.manager(), &ctx).unwrap();
    catalog
        .manager()
        .write(|version| version.register_collection(Arc::new(collection(1, "db.a")), None))
        .unwrap();
    let other = catalog.clone();
    thread::spawn(move || {
        other
            .manager()
            .write(|version| version.register_collection(Arc::new(collection(2, "db.b")), None))
            .unwrap();
    })
    .join()
    .unwrap();
    assert!(matches!(batch.finish(), Err(CatalogError::Invariant(_))));
}

#[test]
fn metadata_writes_require_exclusive_claims() {
    let catalog = catalog();
    create(&catalog, 1, "db.a", 5);
    let ctx = OpContext::new().with_claim(
        LockResource::Collection(ns("db.a")),
        LockMode::IntentExclusive,
    );
    let _unit = ctx.begin_unit().unwrap();
    assert!(catalog
        .with_metadata_write(&ctx, &ns("db.a"), |c| c.set_min_valid(Some(Timestamp(7))))
        .is_err());
    ctx.claim(LockResource::Database(ns("db.a").db().clone()), LockMode::Exclusive);
    catalog
        .with_metadata_write(&ctx, &ns("db.a"), |c| c.set_min_valid(Some(Timestamp(7))))
        .unwrap();
}
