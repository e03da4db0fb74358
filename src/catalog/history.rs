//! Timestamped catalog-id history.
//!
//! Every namespace and every collection id keeps an ordered list of
//! `(catalog_id, ts)` entries. An entry is valid from its timestamp until the
//! next entry for the same key; `None` marks "dropped here". The history lets
//! point-in-time readers classify a key as existing, not existing, or unknown
//! without touching the durable catalog, and is pruned once the oldest
//! timestamp any reader may still use advances past an interval.

use std::hash::Hash;

use imbl::{HashMap, HashSet, OrdMap};
use tracing::{debug, trace};

use crate::types::{CatalogError, CatalogId, CollectionId, Namespace, Result, Timestamp};

/// One validity interval start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Durable record location, or `None` when the key was dropped at `ts`.
    pub catalog_id: Option<CatalogId>,
    /// Commit timestamp the entry becomes valid at.
    pub ts: Timestamp,
}

/// Result of a point-in-time classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Existence {
    /// The key resolved to a durable record at the timestamp.
    Exists(CatalogId),
    /// The key did not exist at the timestamp.
    NotExists,
    /// The history does not cover the timestamp; the durable catalog must be
    /// scanned.
    Unknown,
}

impl Existence {
    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Existence::Exists(_) => "exists",
            Existence::NotExists => "not_exists",
            Existence::Unknown => "unknown",
        }
    }

    fn from_catalog_id(catalog_id: Option<CatalogId>) -> Self {
        match catalog_id {
            Some(id) => Existence::Exists(id),
            None => Existence::NotExists,
        }
    }
}

/// Ordered history for one key type, plus the bookkeeping needed to decide
/// cheaply whether any key can be pruned.
#[derive(Clone, Debug)]
pub(crate) struct TimestampedHistory<K>
where
    K: Clone + Hash + Eq,
{
    entries: HashMap<K, Vec<HistoryEntry>>,
    // Durable scan results at exact timestamps the ranges do not cover.
    scans: HashMap<K, OrdMap<Timestamp, Option<CatalogId>>>,
    marked: HashSet<K>,
    lowest_cleanup: Timestamp,
    lowest_scan_cleanup: Timestamp,
}

impl<K> Default for TimestampedHistory<K>
where
    K: Clone + Hash + Eq,
{
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            scans: HashMap::new(),
            marked: HashSet::new(),
            lowest_cleanup: Timestamp::MAX,
            lowest_scan_cleanup: Timestamp::MAX,
        }
    }
}

/// Earliest cleanup timestamp that would remove something from `entries`.
fn prunable_at(entries: &[HistoryEntry]) -> Option<Timestamp> {
    match entries {
        [_, second, ..] => Some(second.ts),
        [only] if only.catalog_id.is_none() => Some(only.ts),
        _ => None,
    }
}

/// Outcome of validating a push before it is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Push {
    Skip,
    Append,
    Replace,
}

impl<K> TimestampedHistory<K>
where
    K: Clone + Hash + Eq + std::fmt::Display,
{
    pub(crate) fn entries(&self, key: &K) -> Option<&[HistoryEntry]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub(crate) fn last(&self, key: &K) -> Option<&HistoryEntry> {
        self.entries.get(key).and_then(|entries| entries.last())
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub(crate) fn key_count(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_marked(&self, key: &K) -> bool {
        self.marked.contains(key)
    }

    fn check(&self, key: &K, catalog_id: Option<CatalogId>, ts: Timestamp) -> Result<Push> {
        match self.last(key) {
            Some(last) if last.ts > ts => Err(CatalogError::invariant(format!(
                "history for {key} pushed at {ts}, before {}",
                last.ts
            ))),
            // Same location again: nothing changed, typically after a reopen.
            Some(last) if last.catalog_id == catalog_id => Ok(Push::Skip),
            // Several changes to one key in a single commit.
            Some(last) if last.ts == ts => Ok(Push::Replace),
            Some(_) => Ok(Push::Append),
            // A drop never opens a history; an untimestamped creation left
            // nothing to close.
            None if catalog_id.is_none() => Ok(Push::Skip),
            None => Ok(Push::Append),
        }
    }

    fn apply(&mut self, key: K, push: Push, entry: HistoryEntry) {
        match push {
            Push::Skip => {}
            Push::Append => self.append(key, entry),
            Push::Replace => self.replace_last(key, entry),
        }
    }

    fn replace_last(&mut self, key: K, entry: HistoryEntry) {
        let Some(mut entries) = self.entries.get(&key).cloned() else {
            return;
        };
        entries.pop();
        let redundant = match entries.last() {
            Some(previous) => previous.catalog_id == entry.catalog_id,
            None => entry.catalog_id.is_none(),
        };
        if !redundant {
            entries.push(entry);
        }
        trace!(key = %key, ts = %entry.ts, collapsed = redundant, "catalog.history.replace");
        if entries.is_empty() {
            self.entries.remove(&key);
            return;
        }
        self.mark_if_needed(&key, &entries);
        self.entries.insert(key, entries);
    }

    fn append(&mut self, key: K, entry: HistoryEntry) {
        let mut entries = self.entries.get(&key).cloned().unwrap_or_default();
        entries.push(entry);
        self.mark_if_needed(&key, &entries);
        trace!(key = %key, ts = %entry.ts, dropped = entry.catalog_id.is_none(), "catalog.history.push");
        self.entries.insert(key, entries);
    }

    /// Appends an entry. `None` timestamps are ignored.
    pub(crate) fn push(
        &mut self,
        key: K,
        catalog_id: Option<CatalogId>,
        ts: Option<Timestamp>,
    ) -> Result<()> {
        let Some(ts) = ts else {
            return Ok(());
        };
        let push = self.check(&key, catalog_id, ts)?;
        self.apply(key, push, HistoryEntry { catalog_id, ts });
        Ok(())
    }

    /// Classifies `key` at `ts`. `oldest_maintained` is the earliest
    /// timestamp the history is complete for; first entries at or below
    /// `seeded_through` may be synthetic and say nothing about earlier times.
    pub(crate) fn lookup(
        &self,
        key: &K,
        ts: Option<Timestamp>,
        oldest_maintained: Timestamp,
        seeded_through: Timestamp,
    ) -> Existence {
        let entries = self.entries.get(key);
        let Some(ts) = ts else {
            return entries
                .and_then(|entries| entries.last())
                .map_or(Existence::NotExists, |last| {
                    Existence::from_catalog_id(last.catalog_id)
                });
        };
        if let Some(entries) = entries {
            let after = entries.partition_point(|entry| entry.ts <= ts);
            if after > 0 {
                return Existence::from_catalog_id(entries[after - 1].catalog_id);
            }
        }
        if let Some(scanned) = self.scans.get(key).and_then(|memo| memo.get(&ts)) {
            return Existence::from_catalog_id(*scanned);
        }
        if ts < oldest_maintained {
            return Existence::Unknown;
        }
        match entries {
            None => Existence::NotExists,
            // Before a real first entry inside the complete window.
            Some(_) if ts >= seeded_through => Existence::NotExists,
            // A reseeded entry stands in for a creation of unknown time.
            Some(_) => Existence::Unknown,
        }
    }

    /// Remembers what the durable catalog reported for `key` at exactly `ts`.
    pub(crate) fn record_scan(&mut self, key: K, ts: Timestamp, catalog_id: Option<CatalogId>) {
        let mut memo = self.scans.get(&key).cloned().unwrap_or_default();
        memo.insert(ts, catalog_id);
        self.scans.insert(key, memo);
        let prunable_at = Timestamp(ts.0.saturating_add(1));
        self.lowest_scan_cleanup = self.lowest_scan_cleanup.min(prunable_at);
    }

    fn mark_if_needed(&mut self, key: &K, entries: &[HistoryEntry]) {
        let Some(prunable_at) = prunable_at(entries) else {
            return;
        };
        self.marked.insert(key.clone());
        self.lowest_cleanup = self.lowest_cleanup.min(prunable_at);
    }

    pub(crate) fn needs_cleanup(&self, oldest: Timestamp) -> bool {
        oldest >= self.lowest_cleanup.min(self.lowest_scan_cleanup)
    }

    /// Removes every interval that ended at or before `oldest`, keeping the
    /// entry that is valid at `oldest`. Returns the number of entries pruned.
    pub(crate) fn cleanup(&mut self, oldest: Timestamp) -> usize {
        let mut pruned = 0;
        let mut next_lowest = Timestamp::MAX;
        let marked: Vec<K> = self.marked.iter().cloned().collect();
        for key in marked {
            let Some(mut entries) = self.entries.get(&key).cloned() else {
                self.marked.remove(&key);
                continue;
            };
            let after = entries.partition_point(|entry| entry.ts <= oldest);
            if after == 0 {
                if let Some(ts) = prunable_at(&entries) {
                    next_lowest = next_lowest.min(ts);
                }
                continue;
            }
            let keep_from = after - 1;
            pruned += keep_from;
            entries.drain(..keep_from);

            if entries.len() > 1 {
                next_lowest = next_lowest.min(entries[1].ts);
                self.entries.insert(key, entries);
                continue;
            }
            self.marked.remove(&key);
            match entries.last() {
                Some(last) if last.catalog_id.is_none() => {
                    pruned += 1;
                    self.entries.remove(&key);
                }
                _ => {
                    self.entries.insert(key, entries);
                }
            }
        }
        self.lowest_cleanup = next_lowest;
        pruned += self.prune_scans(oldest);
        pruned
    }

    fn prune_scans(&mut self, oldest: Timestamp) -> usize {
        let mut pruned = 0;
        let mut next_lowest = Timestamp::MAX;
        let keys: Vec<K> = self.scans.keys().cloned().collect();
        for key in keys {
            let Some(memo) = self.scans.get(&key) else {
                continue;
            };
            let kept: OrdMap<Timestamp, Option<CatalogId>> = memo
                .iter()
                .filter(|(ts, _)| **ts >= oldest)
                .map(|(ts, id)| (*ts, *id))
                .collect();
            pruned += memo.len() - kept.len();
            if let Some((first, _)) = kept.iter().next() {
                next_lowest = next_lowest.min(Timestamp(first.0.saturating_add(1)));
                self.scans.insert(key, kept);
            } else {
                self.scans.remove(&key);
            }
        }
        self.lowest_scan_cleanup = next_lowest;
        pruned
    }

    /// Forgets every entry newer than `stable` and recomputes prunability.
    pub(crate) fn truncate_after(&mut self, stable: Timestamp) {
        self.marked = HashSet::new();
        self.lowest_cleanup = Timestamp::MAX;
        self.scans = HashMap::new();
        self.lowest_scan_cleanup = Timestamp::MAX;
        let keys: Vec<K> = self.entries.keys().cloned().collect();
        for key in keys {
            let Some(mut entries) = self.entries.get(&key).cloned() else {
                continue;
            };
            let keep = entries.partition_point(|entry| entry.ts <= stable);
            entries.truncate(keep);
            if entries.is_empty() {
                self.entries.remove(&key);
                continue;
            }
            self.mark_if_needed(&key, &entries);
            self.entries.insert(key, entries);
        }
    }
}

/// Namespace-keyed and id-keyed histories kept in step.
///
/// Renames only touch the namespace side: a collection id keeps exactly one
/// creation entry and at most one drop entry for its whole life.
#[derive(Clone, Debug)]
pub struct CatalogIdHistory {
    by_namespace: TimestampedHistory<Namespace>,
    by_id: TimestampedHistory<CollectionId>,
    oldest_maintained: Timestamp,
    seeded_through: Timestamp,
}

impl Default for CatalogIdHistory {
    fn default() -> Self {
        Self::new(Timestamp::MIN)
    }
}

impl CatalogIdHistory {
    /// Creates an empty history that is complete from `oldest_maintained` on.
    pub fn new(oldest_maintained: Timestamp) -> Self {
        Self {
            by_namespace: TimestampedHistory::default(),
            by_id: TimestampedHistory::default(),
            oldest_maintained,
            seeded_through: Timestamp::MIN,
        }
    }

    /// Earliest timestamp for which a missing key means "did not exist".
    pub fn oldest_maintained(&self) -> Timestamp {
        self.oldest_maintained
    }

    /// Records a creation at `ts`.
    pub fn push_create(
        &mut self,
        id: CollectionId,
        namespace: &Namespace,
        catalog_id: CatalogId,
        ts: Option<Timestamp>,
    ) -> Result<()> {
        let Some(ts) = ts else {
            return Ok(());
        };
        if self.by_id.entries(&id).is_some() {
            return Err(CatalogError::invariant(format!(
                "collection {id} already has a creation entry"
            )));
        }
        let ns_push = self.by_namespace.check(namespace, Some(catalog_id), ts)?;
        let id_push = self.by_id.check(&id, Some(catalog_id), ts)?;
        let entry = HistoryEntry {
            catalog_id: Some(catalog_id),
            ts,
        };
        self.by_namespace.apply(namespace.clone(), ns_push, entry);
        self.by_id.apply(id, id_push, entry);
        Ok(())
    }

    /// Records a drop at `ts`.
    pub fn push_drop(
        &mut self,
        id: CollectionId,
        namespace: &Namespace,
        ts: Option<Timestamp>,
    ) -> Result<()> {
        let Some(ts) = ts else {
            return Ok(());
        };
        match self.by_id.last(&id) {
            Some(last) if last.catalog_id.is_none() => {
                return Err(CatalogError::invariant(format!(
                    "collection {id} already has a drop entry"
                )));
            }
            _ => {}
        }
        let ns_push = self.by_namespace.check(namespace, None, ts)?;
        let id_push = self.by_id.check(&id, None, ts)?;
        let entry = HistoryEntry {
            catalog_id: None,
            ts,
        };
        self.by_namespace.apply(namespace.clone(), ns_push, entry);
        self.by_id.apply(id, id_push, entry);
        Ok(())
    }

    /// Closes `from` and opens `to` at the same timestamp.
    pub fn push_rename(
        &mut self,
        from: &Namespace,
        to: &Namespace,
        catalog_id: CatalogId,
        ts: Option<Timestamp>,
    ) -> Result<()> {
        let Some(ts) = ts else {
            return Ok(());
        };
        let from_push = self.by_namespace.check(from, None, ts)?;
        let to_push = self.by_namespace.check(to, Some(catalog_id), ts)?;
        self.by_namespace.apply(
            from.clone(),
            from_push,
            HistoryEntry {
                catalog_id: None,
                ts,
            },
        );
        self.by_namespace.apply(
            to.clone(),
            to_push,
            HistoryEntry {
                catalog_id: Some(catalog_id),
                ts,
            },
        );
        Ok(())
    }

    /// Classifies a namespace at `ts` (`None` means "latest").
    pub fn lookup_namespace(&self, namespace: &Namespace, ts: Option<Timestamp>) -> Existence {
        self.by_namespace
            .lookup(namespace, ts, self.oldest_maintained, self.seeded_through)
    }

    /// Classifies a collection id at `ts` (`None` means "latest").
    pub fn lookup_id(&self, id: CollectionId, ts: Option<Timestamp>) -> Existence {
        self.by_id
            .lookup(&id, ts, self.oldest_maintained, self.seeded_through)
    }

    /// Stores a durable scan result for a namespace.
    pub fn record_namespace_scan(
        &mut self,
        namespace: Namespace,
        ts: Timestamp,
        catalog_id: Option<CatalogId>,
    ) {
        self.by_namespace.record_scan(namespace, ts, catalog_id);
    }

    /// Stores a durable scan result for a collection id.
    pub fn record_id_scan(&mut self, id: CollectionId, ts: Timestamp, catalog_id: Option<CatalogId>) {
        self.by_id.record_scan(id, ts, catalog_id);
    }

    /// Entries recorded for a namespace, oldest first.
    pub fn namespace_entries(&self, namespace: &Namespace) -> Option<&[HistoryEntry]> {
        self.by_namespace.entries(namespace)
    }

    /// Entries recorded for a collection id, oldest first.
    pub fn id_entries(&self, id: CollectionId) -> Option<&[HistoryEntry]> {
        self.by_id.entries(&id)
    }

    /// Namespaces with any recorded history.
    pub fn namespaces(&self) -> impl Iterator<Item = &Namespace> {
        self.by_namespace.keys()
    }

    /// Number of namespace and id keys tracked.
    pub fn key_count(&self) -> usize {
        self.by_namespace.key_count() + self.by_id.key_count()
    }

    /// O(1) check whether [`CatalogIdHistory::cleanup`] would prune anything.
    pub fn needs_cleanup(&self, oldest: Timestamp) -> bool {
        self.by_namespace.needs_cleanup(oldest) || self.by_id.needs_cleanup(oldest)
    }

    /// Prunes intervals that ended before `oldest` and advances the
    /// maintained window. Returns the number of entries removed.
    pub fn cleanup(&mut self, oldest: Timestamp) -> usize {
        let pruned = self.by_namespace.cleanup(oldest) + self.by_id.cleanup(oldest);
        self.oldest_maintained = self.oldest_maintained.max(oldest);
        debug!(oldest = %oldest, pruned, "catalog.history.cleanup");
        pruned
    }

    /// Drops history newer than `stable` after the catalog was reopened and
    /// seeds an entry at `stable` for live collections that have none.
    pub fn reseed_for_reopen<'a, I>(&mut self, stable: Timestamp, live: I) -> Result<()>
    where
        I: IntoIterator<Item = (CollectionId, &'a Namespace, CatalogId)>,
    {
        self.oldest_maintained = self.oldest_maintained.min(stable);
        self.seeded_through = self.seeded_through.max(stable);
        self.by_namespace.truncate_after(stable);
        self.by_id.truncate_after(stable);
        let mut seeded = 0usize;
        for (id, namespace, catalog_id) in live {
            let entry = HistoryEntry {
                catalog_id: Some(catalog_id),
                ts: stable,
            };
            let ns_live = self
                .by_namespace
                .last(namespace)
                .is_some_and(|last| last.catalog_id == Some(catalog_id));
            if !ns_live {
                let Ok(push) = self.by_namespace.check(namespace, Some(catalog_id), stable) else {
                    continue;
                };
                self.by_namespace.apply(namespace.clone(), push, entry);
                seeded += 1;
            }
            if self.by_id.entries(&id).is_none() {
                self.by_id.append(id, entry);
            }
        }
        debug!(stable = %stable, seeded, "catalog.history.reseed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_namespace_marked(&self, namespace: &Namespace) -> bool {
        self.by_namespace.is_marked(namespace)
    }
}
