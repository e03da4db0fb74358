#![allow(missing_docs)]

use std::sync::atomic::Ordering;
use std::sync::Arc;

use strata::catalog::{
    Catalog, Collection, CounterMetrics, DurableEntry, DurableIndex, Existence, LockMode,
    LockResource, MemoryDurableCatalog, OpContext,
};
use strata::{CatalogId, CatalogOptions, CollectionId, CollectionRef, Ident, Namespace, Timestamp};

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
        indexes: vec![DurableIndex::new("_id_", format!("index-{raw}").as_str())],
    }
}

fn writer() -> OpContext {
    OpContext::new().with_claim(LockResource::Global, LockMode::Exclusive)
}

fn setup(options: CatalogOptions) -> (Arc<MemoryDurableCatalog>, Catalog) {
    let durable = Arc::new(MemoryDurableCatalog::new());
    let catalog = Catalog::new(durable.clone(), options);
    (durable, catalog)
}

fn create(catalog: &Catalog, durable: &MemoryDurableCatalog, entry: &DurableEntry, ts: u64) -> Arc<Collection> {
    durable.put(entry.clone(), Timestamp(ts)).expect("durable put");
    let ctx = writer();
    let unit = ctx.begin_unit().expect("unit");
    let handle = catalog
        .register_create(&ctx, Collection::from_durable(entry, None), Some(Timestamp(ts)))
        .expect("create");
    unit.commit(Some(Timestamp(ts))).expect("commit");
    handle
}

fn rename(catalog: &Catalog, durable: &MemoryDurableCatalog, entry: &DurableEntry, to: &str, ts: u64) {
    let mut moved = entry.clone();
    moved.namespace = ns(to);
    durable.put(moved, Timestamp(ts)).expect("durable put");
    let ctx = writer();
    let unit = ctx.begin_unit().expect("unit");
    catalog
        .rename(&ctx, entry.id, &ns(to), Some(Timestamp(ts)))
        .expect("rename");
    unit.commit(Some(Timestamp(ts))).expect("commit");
}

fn at(catalog: &Catalog, target: impl Into<CollectionRef>, ts: u64) -> Option<Arc<Collection>> {
    catalog
        .establish_consistent_collection(&OpContext::new(), &target.into(), Some(Timestamp(ts)))
        .expect("resolve")
}

#[test]
fn creation_is_visible_only_from_its_timestamp() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let x = create(&catalog, &durable, &record(1, "db.a"), 10);

    let ctx = OpContext::new();
    let before = catalog.current(&ctx).lookup_history(&ns("db.a").into(), Some(Timestamp(5)));
    assert_eq!(before, Existence::NotExists);
    assert!(at(&catalog, ns("db.a"), 5).is_none());
    assert_eq!(durable.scan_count(), 0);

    let after = catalog.current(&ctx).lookup_history(&ns("db.a").into(), Some(Timestamp(15)));
    assert_eq!(after, Existence::Exists(CatalogId(1)));
    let found = at(&catalog, ns("db.a"), 15).expect("exists at 15");
    assert!(Arc::ptr_eq(&found, &x));
}

#[test]
fn rename_moves_namespace_history() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let entry = record(1, "db.a");
    create(&catalog, &durable, &entry, 10);
    rename(&catalog, &durable, &entry, "db.b", 20);

    let ctx = OpContext::new();
    assert_eq!(
        catalog.current(&ctx).lookup_history(&ns("db.a").into(), Some(Timestamp(25))),
        Existence::NotExists
    );
    assert!(at(&catalog, ns("db.a"), 25).is_none());
    let b = at(&catalog, ns("db.b"), 25).expect("db.b at 25");
    assert_eq!(b.id(), entry.id);

    for (ts, expected) in [(10, "db.a"), (15, "db.a"), (19, "db.a"), (20, "db.b"), (40, "db.b")] {
        let found = at(&catalog, entry.id, ts).expect("id always resolvable");
        assert_eq!(found.namespace(), &ns(expected), "namespace of id at {ts}");
    }

    // The historical handle is a sibling sharing index entries with the latest.
    let latest = catalog.lookup_by_id(&ctx, entry.id).expect("latest");
    let old = at(&catalog, entry.id, 15).expect("old");
    assert!(!Arc::ptr_eq(&latest, &old));
    assert_eq!(old.min_valid(), Some(Timestamp(15)));
    assert!(Arc::ptr_eq(&latest.indexes()[0], &old.indexes()[0]));
}

#[test]
fn lookups_before_creation_never_exist() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let created = [(1u128, "db.a", 10u64), (2, "db.b", 14), (3, "other.c", 30)];
    for (raw, namespace, ts) in created {
        create(&catalog, &durable, &record(raw, namespace), ts);
    }
    let ctx = OpContext::new();
    let version = catalog.current(&ctx);
    for (raw, namespace, created_at) in created {
        for ts in 0..created_at {
            for target in [
                CollectionRef::from(ns(namespace)),
                CollectionRef::from(CollectionId::from_u128(raw)),
            ] {
                let existence = version.lookup_history(&target, Some(Timestamp(ts)));
                assert!(
                    !matches!(existence, Existence::Exists(_)),
                    "{target} reported existing at {ts}"
                );
                assert!(at(&catalog, target, ts).is_none());
            }
        }
    }
}

#[test]
fn reopened_catalog_scans_before_stable_and_caches() {
    let durable = Arc::new(MemoryDurableCatalog::new());
    let entry = record(1, "db.a");
    durable.put(entry.clone(), Timestamp(5)).unwrap();
    let mut moved = entry.clone();
    moved.namespace = ns("db.b");
    durable.put(moved, Timestamp(8)).unwrap();

    let metrics = Arc::new(CounterMetrics::default());
    let catalog = Catalog::open(
        durable.clone(),
        CatalogOptions::new().metrics(metrics.clone()),
        Some(Timestamp(10)),
    )
    .unwrap();

    let ctx = OpContext::new();
    assert!(catalog.lookup_by_namespace(&ctx, &ns("db.b")).is_some());
    assert_eq!(
        catalog.current(&ctx).lookup_history(&ns("db.a").into(), Some(Timestamp(6))),
        Existence::Unknown
    );

    let old = at(&catalog, ns("db.a"), 6).expect("scan finds db.a at 6");
    assert_eq!(old.id(), entry.id);
    assert_eq!(durable.scan_count(), 1);
    assert_eq!(metrics.scans.load(Ordering::Relaxed), 1);

    // Both keys were memoised at exactly ts 6.
    assert!(at(&catalog, ns("db.a"), 6).is_some());
    assert!(at(&catalog, entry.id, 6).is_some());
    assert_eq!(durable.scan_count(), 1);

    // Seeded at the stable timestamp, so no scan is needed at or after it.
    assert_eq!(at(&catalog, ns("db.b"), 12).unwrap().id(), entry.id);
    assert!(at(&catalog, ns("db.a"), 12).is_none());
    assert_eq!(durable.scan_count(), 1);
}

#[test]
fn uncached_scans_hit_durable_every_time() {
    let durable = Arc::new(MemoryDurableCatalog::new());
    durable.put(record(1, "db.a"), Timestamp(5)).unwrap();
    let catalog = Catalog::open(
        durable.clone(),
        CatalogOptions::new().cache_scan_results(false),
        Some(Timestamp(10)),
    )
    .unwrap();
    let generation = catalog.manager().generation();
    for _ in 0..3 {
        assert!(at(&catalog, ns("db.a"), 7).is_some());
    }
    assert_eq!(durable.scan_count(), 3);
    assert_eq!(catalog.manager().generation(), generation);
}

#[test]
fn open_snapshot_memoises_resolved_handles() {
    let durable = Arc::new(MemoryDurableCatalog::new());
    durable.put(record(1, "db.a"), Timestamp(5)).unwrap();
    durable.put(record(1, "db.z"), Timestamp(9)).unwrap();
    let catalog = Catalog::open(
        durable.clone(),
        CatalogOptions::new().cache_scan_results(false),
        Some(Timestamp(10)),
    )
    .unwrap();

    let ctx = OpContext::new();
    ctx.open_snapshot(Some(Timestamp(6)));
    let target = CollectionRef::from(ns("db.a"));
    let first = catalog
        .establish_consistent_collection(&ctx, &target, ctx.read_timestamp())
        .unwrap()
        .unwrap();
    let second = catalog
        .establish_consistent_collection(&ctx, &target, ctx.read_timestamp())
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(durable.scan_count(), 1);

    ctx.close_snapshot();
    let third = catalog
        .establish_consistent_collection(&ctx, &target, Some(Timestamp(6)))
        .unwrap()
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(durable.scan_count(), 2);
}

#[test]
fn latest_lookup_includes_pending_registrations() {
    let (_durable, catalog) = setup(CatalogOptions::default());
    let ctx = OpContext::new().with_claim(
        LockResource::Collection(ns("db.a")),
        LockMode::IntentExclusive,
    );
    let unit = ctx.begin_unit().unwrap();
    let handle = catalog
        .register_create_two_phase(&ctx, Collection::from_durable(&record(1, "db.a"), None), None)
        .unwrap();

    let other = OpContext::new();
    assert!(catalog.lookup_by_namespace(&other, &ns("db.a")).is_none());
    assert!(catalog.is_awaiting_visibility(&other, handle.id()));
    let pending = catalog
        .establish_consistent_collection(&other, &ns("db.a").into(), None)
        .unwrap()
        .expect("pending visible to latest lookups");
    assert!(Arc::ptr_eq(&pending, &handle));

    unit.commit(None).unwrap();
    assert!(!catalog.is_awaiting_visibility(&other, handle.id()));
    let committed = catalog.lookup_by_namespace(&other, &ns("db.a")).unwrap();
    assert!(Arc::ptr_eq(&committed, &handle));
}

#[test]
fn dropped_collection_resolves_until_ident_is_reclaimed() {
    let (durable, catalog) = setup(CatalogOptions::default().reuse_drop_pending(false));
    let entry = record(1, "db.a");
    create(&catalog, &durable, &entry, 10);

    durable.remove(entry.catalog_id, Timestamp(20)).unwrap();
    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    catalog.deregister(&ctx, entry.id, false, Some(Timestamp(20))).unwrap();
    unit.commit(Some(Timestamp(20))).unwrap();

    assert!(at(&catalog, ns("db.a"), 25).is_none());
    let old = at(&catalog, ns("db.a"), 15).expect("still readable at 15");
    assert_eq!(old.min_valid(), Some(Timestamp(15)));

    durable.drop_ident(&entry.ident);
    assert!(at(&catalog, ns("db.a"), 16).is_none());
}
