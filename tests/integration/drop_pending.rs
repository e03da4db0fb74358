#![allow(missing_docs)]

use std::sync::Arc;

use strata::catalog::{
    Catalog, Collection, DurableEntry, DurableIndex, IndexEntry, LockMode, LockResource,
    MemoryDurableCatalog, OpContext,
};
use strata::{CatalogId, CatalogOptions, CollectionId, Ident, Namespace, Timestamp};

fn ns(text: &str) -> Namespace {
    Namespace::parse(text).expect("namespace")
}

fn record(raw: u128, namespace: &str, ident: &str) -> DurableEntry {
    DurableEntry {
        catalog_id: CatalogId(raw as u64),
        id: CollectionId::from_u128(raw),
        namespace: ns(namespace),
        ident: Ident::new(ident),
        options: Default::default(),
        indexes: vec![DurableIndex::new("_id_", format!("{ident}-id").as_str())],
    }
}

fn writer() -> OpContext {
    OpContext::new().with_claim(LockResource::Global, LockMode::Exclusive)
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

fn drop_pending(
    catalog: &Catalog,
    durable: &MemoryDurableCatalog,
    entry: &DurableEntry,
    ts: u64,
) -> Arc<Collection> {
    durable.remove(entry.catalog_id, Timestamp(ts)).unwrap();
    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    let dropped = catalog
        .deregister(&ctx, entry.id, true, Some(Timestamp(ts)))
        .unwrap();
    unit.commit(Some(Timestamp(ts))).unwrap();
    dropped
}

fn setup(options: CatalogOptions) -> (Arc<MemoryDurableCatalog>, Catalog) {
    let durable = Arc::new(MemoryDurableCatalog::new());
    let catalog = Catalog::new(durable.clone(), options);
    (durable, catalog)
}

#[test]
fn dropped_collection_is_findable_until_ident_removal() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let x = record(1, "db.a", "ident-1");
    create(&catalog, &durable, &x, 10);

    let ident = Ident::new("ident-1");
    assert!(catalog.find_drop_pending_collection(&ident).is_none());
    let dropped = drop_pending(&catalog, &durable, &x, 20);

    let found = catalog
        .find_drop_pending_collection(&ident)
        .expect("drop-pending after commit");
    assert!(Arc::ptr_eq(&found, &dropped));

    assert!(catalog.notify_ident_dropped(&ident).unwrap());
    assert!(catalog.find_drop_pending_collection(&ident).is_none());
    assert!(!catalog.notify_ident_dropped(&ident).unwrap());
}

#[test]
fn drop_pending_entries_do_not_keep_handles_alive() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let x = record(1, "db.a", "ident-1");
    create(&catalog, &durable, &x, 10);
    let dropped = drop_pending(&catalog, &durable, &x, 20);
    drop(dropped);
    assert!(catalog
        .find_drop_pending_collection(&Ident::new("ident-1"))
        .is_none());
}

#[test]
fn rolled_back_drop_is_not_tracked() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let x = record(1, "db.a", "ident-1");
    create(&catalog, &durable, &x, 10);

    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    let _handle = catalog.deregister(&ctx, x.id, true, Some(Timestamp(20))).unwrap();
    unit.rollback();
    assert!(catalog
        .find_drop_pending_collection(&Ident::new("ident-1"))
        .is_none());
    assert!(catalog.lookup_by_id(&OpContext::new(), x.id).is_some());
}

#[test]
fn historical_reads_reuse_the_drop_pending_handle() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let x = record(1, "db.a", "ident-1");
    create(&catalog, &durable, &x, 10);
    let dropped = drop_pending(&catalog, &durable, &x, 20);

    let found = catalog
        .establish_consistent_collection(&OpContext::new(), &ns("db.a").into(), Some(Timestamp(15)))
        .unwrap()
        .expect("readable before the drop");
    assert!(Arc::ptr_eq(&found, &dropped));
}

#[test]
fn reuse_can_be_disabled() {
    let (durable, catalog) = setup(CatalogOptions::new().reuse_drop_pending(false));
    let x = record(1, "db.a", "ident-1");
    create(&catalog, &durable, &x, 10);
    let dropped = drop_pending(&catalog, &durable, &x, 20);

    let found = catalog
        .establish_consistent_collection(&OpContext::new(), &x.id.into(), Some(Timestamp(15)))
        .unwrap()
        .expect("rebuilt from durable");
    assert!(!Arc::ptr_eq(&found, &dropped));
    assert_eq!(found.ident(), dropped.ident());
    assert_eq!(found.min_valid(), Some(Timestamp(15)));
}

#[test]
fn dropped_index_is_tracked_by_ident() {
    let (durable, catalog) = setup(CatalogOptions::default());
    let mut x = record(1, "db.a", "ident-1");
    x.indexes.push(DurableIndex::new("x_1", "ident-1-x"));
    create(&catalog, &durable, &x, 10);

    let ctx = writer();
    let unit = ctx.begin_unit().unwrap();
    let index: Arc<IndexEntry> = catalog
        .drop_index(&ctx, &ns("db.a"), "x_1", true, Some(Timestamp(20)))
        .unwrap();
    unit.commit(Some(Timestamp(20))).unwrap();

    let ident = Ident::new("ident-1-x");
    let found = catalog.find_drop_pending_index(&ident).expect("tracked");
    assert!(Arc::ptr_eq(&found, &index));

    let reader = OpContext::new();
    let collection = catalog.lookup_by_namespace(&reader, &ns("db.a")).unwrap();
    assert!(collection.index("x_1").is_none());
    assert_eq!(collection.min_valid(), Some(Timestamp(20)));

    assert!(catalog.notify_ident_dropped(&ident).unwrap());
    assert!(catalog.find_drop_pending_index(&ident).is_none());
}
