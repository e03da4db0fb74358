#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use strata::catalog::{
    Catalog, Collection, DurableEntry, Existence, LockMode, LockResource, MemoryDurableCatalog,
    OpContext,
};
use strata::{CatalogId, CatalogOptions, CollectionId, Ident, Namespace, Timestamp};

fn ns(text: &str) -> Namespace {
    Namespace::parse(text).expect("namespace")
}

fn record(raw: u128, namespace: &str) -> DurableEntry {
    DurableEntry {
        catalog_id: CatalogId(raw as u64),
        id: CollectionId::from_u128(raw),
        namespace: ns(namespace),
        ident: Ident::new(format!("collection-{raw}")),
        options: Default::default(),
        indexes: Vec::new(),
    }
}

fn writer() -> OpContext {
    OpContext::new().with_claim(LockResource::Global, LockMode::Exclusive)
}

fn setup() -> (Arc<MemoryDurableCatalog>, Catalog) {
    let durable = Arc::new(MemoryDurableCatalog::new());
    let catalog = Catalog::new(durable.clone(), CatalogOptions::default());
    (durable, catalog)
}

fn create(catalog: &Catalog, durable: &MemoryDurableCatalog, entry: &DurableEntry, ts: u64) {
    durable.put(entry.clone(), Timestamp(ts)).unwrap();
    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    catalog
        .register_create(&ctx, Collection::from_durable(entry, None), Some(Timestamp(ts)))
        .unwrap();
    unit.commit(Some(Timestamp(ts))).unwrap();
}

fn drop_collection(catalog: &Catalog, durable: &MemoryDurableCatalog, entry: &DurableEntry, ts: u64) {
    durable.remove(entry.catalog_id, Timestamp(ts)).unwrap();
    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    catalog
        .deregister(&ctx, entry.id, false, Some(Timestamp(ts)))
        .unwrap();
    unit.commit(Some(Timestamp(ts))).unwrap();
}

#[test]
fn closed_catalog_resolves_dropped_ids_through_shadow() {
    let (durable, catalog) = setup();
    let x = record(1, "db.a");
    create(&catalog, &durable, &x, 10);

    let ctx = writer();
    catalog.on_close_catalog(&ctx).unwrap();
    drop_collection(&catalog, &durable, &x, 20);

    let reader = OpContext::new();
    assert!(catalog.lookup_by_id(&reader, x.id).is_none());
    assert_eq!(catalog.lookup_namespace_by_id(&reader, x.id), Some(ns("db.a")));
    assert!(catalog.current(&reader).is_closed());

    catalog.on_open_catalog(&ctx).unwrap();
    assert_eq!(catalog.lookup_namespace_by_id(&reader, x.id), None);
    assert!(!catalog.current(&reader).is_closed());
}

#[test]
fn epoch_advances_by_one_per_close_open_pair() {
    let (durable, catalog) = setup();
    create(&catalog, &durable, &record(1, "db.a"), 10);
    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let catalog = catalog.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let ctx = OpContext::new();
                let mut last = 0;
                while !stop.load(Ordering::Acquire) {
                    let epoch = catalog.epoch();
                    assert!(epoch >= last);
                    last = epoch;
                    assert!(catalog
                        .lookup_namespace_by_id(&ctx, CollectionId::from_u128(1))
                        .is_some());
                }
            })
        })
        .collect();

    let ctx = writer();
    for round in 0..5 {
        let before = catalog.epoch();
        catalog.on_close_catalog(&ctx).unwrap();
        assert_eq!(catalog.epoch(), before, "closing alone does not bump (round {round})");
        catalog.on_open_catalog(&ctx).unwrap();
        assert_eq!(catalog.epoch(), before + 1);
    }
    stop.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn close_and_open_must_pair_and_need_global_exclusive() {
    let (_durable, catalog) = setup();
    let plain = OpContext::new();
    assert!(catalog.on_close_catalog(&plain).is_err());

    let ctx = writer();
    assert!(catalog.on_open_catalog(&ctx).is_err());
    catalog.on_close_catalog(&ctx).unwrap();
    assert!(catalog.on_close_catalog(&ctx).is_err());
    catalog.on_open_catalog(&ctx).unwrap();
    assert_eq!(catalog.epoch(), 1);
}

#[test]
fn reopen_reloads_durable_state_at_stable() {
    let (durable, catalog) = setup();
    let a = record(1, "db.a");
    let b = record(2, "db.b");
    create(&catalog, &durable, &a, 10);
    create(&catalog, &durable, &b, 30);
    let mut moved = a.clone();
    moved.namespace = ns("db.z");
    durable.put(moved, Timestamp(40)).unwrap();
    {
        let ctx = writer();
        let unit = ctx.begin_unit().unwrap();
        catalog
            .rename(&ctx, a.id, &ns("db.z"), Some(Timestamp(40)))
            .unwrap();
        unit.commit(Some(Timestamp(40))).unwrap();
    }

    // Roll back to stable 20: b never existed, a still lives at db.a.
    let ctx = writer();
    let epoch = catalog.epoch();
    catalog.reopen(&ctx, Some(Timestamp(20))).unwrap();
    assert_eq!(catalog.epoch(), epoch + 1);

    let reader = OpContext::new();
    assert!(catalog.lookup_by_namespace(&reader, &ns("db.a")).is_some());
    assert!(catalog.lookup_by_namespace(&reader, &ns("db.z")).is_none());
    assert!(catalog.lookup_by_id(&reader, b.id).is_none());

    let version = catalog.current(&reader);
    assert_eq!(
        version.lookup_history(&ns("db.a").into(), Some(Timestamp(45))),
        Existence::Exists(a.catalog_id)
    );
    assert_eq!(
        version.lookup_history(&ns("db.z").into(), Some(Timestamp(45))),
        Existence::NotExists
    );
    assert_eq!(
        version.lookup_history(&ns("db.a").into(), Some(Timestamp(15))),
        Existence::Exists(a.catalog_id)
    );
}

#[test]
fn reopen_requires_global_exclusive() {
    let (_durable, catalog) = setup();
    let ctx = OpContext::new().with_claim(
        LockResource::Database(ns("db.a").db().clone()),
        LockMode::Exclusive,
    );
    assert!(catalog.reopen(&ctx, None).is_err());
    assert!(catalog.deregister_all(&ctx).is_err());
}

#[test]
fn cleanup_prunes_intervals_no_reader_needs() {
    let (durable, catalog) = setup();
    let a = record(1, "db.a");
    create(&catalog, &durable, &a, 10);
    for (ts, to) in [(20, "db.b"), (30, "db.c")] {
        let mut moved = a.clone();
        moved.namespace = ns(to);
        durable.put(moved, Timestamp(ts)).unwrap();
        let ctx = writer();
        let unit = ctx.begin_unit().unwrap();
        catalog.rename(&ctx, a.id, &ns(to), Some(Timestamp(ts))).unwrap();
        unit.commit(Some(Timestamp(ts))).unwrap();
    }

    assert!(!catalog.needs_cleanup_for_oldest_timestamp(Timestamp(15)));
    assert!(catalog.needs_cleanup_for_oldest_timestamp(Timestamp(25)));
    let pruned = catalog.cleanup_for_oldest_timestamp(Timestamp(25)).unwrap();
    assert!(pruned > 0);
    assert!(!catalog.needs_cleanup_for_oldest_timestamp(Timestamp(25)));
    assert_eq!(catalog.cleanup_for_oldest_timestamp(Timestamp(25)).unwrap(), 0);

    let version = catalog.current(&OpContext::new());
    // db.a's interval ended at 20, before the oldest reader.
    assert!(version.history().namespace_entries(&ns("db.a")).is_none());
    assert_eq!(
        version.lookup_history(&ns("db.b").into(), Some(Timestamp(25))),
        Existence::Exists(a.catalog_id)
    );
    assert_eq!(
        version.lookup_history(&ns("db.c").into(), Some(Timestamp(35))),
        Existence::Exists(a.catalog_id)
    );
}

#[test]
fn deregister_all_empties_the_catalog_but_keeps_history() {
    let (durable, catalog) = setup();
    create(&catalog, &durable, &record(1, "db.a"), 10);
    create(&catalog, &durable, &record(2, "app.b"), 11);

    let ctx = writer();
    catalog.deregister_all(&ctx).unwrap();
    let reader = OpContext::new();
    assert!(catalog.all_database_names(&reader).is_empty());
    assert_eq!(catalog.stats(&reader).user_collections, 0);
    assert_eq!(
        catalog
            .current(&reader)
            .lookup_history(&ns("db.a").into(), Some(Timestamp(12))),
        Existence::Exists(CatalogId(1))
    );
}
