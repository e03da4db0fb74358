#![allow(missing_docs)]

use std::collections::{BTreeMap, HashSet};

use proptest::prelude::*;
use strata::catalog::{CatalogIdHistory, Existence};
use strata::{CatalogId, CollectionId, Namespace, Timestamp};

const NAMESPACES: usize = 4;
const IDS: u8 = 4;

#[derive(Clone, Debug)]
enum Op {
    Create { id: u8, ns: usize },
    Drop { id: u8 },
    Rename { id: u8, ns: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1..=IDS, 0..NAMESPACES).prop_map(|(id, ns)| Op::Create { id, ns }),
        (1..=IDS).prop_map(|id| Op::Drop { id }),
        (1..=IDS, 0..NAMESPACES).prop_map(|(id, ns)| Op::Rename { id, ns }),
    ]
}

fn namespace(index: usize) -> Namespace {
    Namespace::parse(&format!("db.n{index}")).expect("namespace")
}

fn id(raw: u8) -> CollectionId {
    CollectionId::from_u128(u128::from(raw))
}

/// Live collections at one point: namespace index to id.
type State = BTreeMap<usize, u8>;

struct Model {
    state: State,
    created: HashSet<u8>,
    snapshots: BTreeMap<u64, State>,
}

impl Model {
    fn new() -> Self {
        Self {
            state: State::new(),
            created: HashSet::new(),
            snapshots: BTreeMap::new(),
        }
    }

    fn namespace_of(&self, raw: u8) -> Option<usize> {
        self.state
            .iter()
            .find_map(|(ns, live)| (*live == raw).then_some(*ns))
    }

    /// Applies `op` to the model and the history; invalid operations are skipped.
    fn apply(&mut self, history: &mut CatalogIdHistory, op: &Op, ts: u64) {
        let at = Some(Timestamp(ts));
        match *op {
            Op::Create { id: raw, ns } => {
                if self.created.contains(&raw) || self.state.contains_key(&ns) {
                    return;
                }
                history
                    .push_create(id(raw), &namespace(ns), CatalogId(u64::from(raw)), at)
                    .expect("create");
                self.created.insert(raw);
                self.state.insert(ns, raw);
            }
            Op::Drop { id: raw } => {
                let Some(ns) = self.namespace_of(raw) else {
                    return;
                };
                history.push_drop(id(raw), &namespace(ns), at).expect("drop");
                self.state.remove(&ns);
            }
            Op::Rename { id: raw, ns: to } => {
                let Some(from) = self.namespace_of(raw) else {
                    return;
                };
                if self.state.contains_key(&to) {
                    return;
                }
                history
                    .push_rename(&namespace(from), &namespace(to), CatalogId(u64::from(raw)), at)
                    .expect("rename");
                self.state.remove(&from);
                self.state.insert(to, raw);
            }
        }
        self.snapshots.insert(ts, self.state.clone());
    }

    fn at(&self, ts: u64) -> State {
        self.snapshots
            .range(..=ts)
            .next_back()
            .map(|(_, state)| state.clone())
            .unwrap_or_default()
    }
}

fn replay(ops: &[(Op, u64)]) -> (CatalogIdHistory, Model, u64) {
    let mut history = CatalogIdHistory::new(Timestamp::MIN);
    let mut model = Model::new();
    let mut ts = 1;
    for (op, step) in ops {
        ts += step;
        model.apply(&mut history, op, ts);
    }
    (history, model, ts)
}

fn arb_ops() -> impl Strategy<Value = Vec<(Op, u64)>> {
    // A zero step folds the operation into the previous commit.
    prop::collection::vec((arb_op(), 0u64..3), 1..40)
}

proptest! {
    #[test]
    fn namespace_lookups_agree_with_the_model(ops in arb_ops()) {
        let (history, model, last) = replay(&ops);
        for ts in 0..=last + 1 {
            let expected = model.at(ts);
            for ns in 0..NAMESPACES {
                match history.lookup_namespace(&namespace(ns), Some(Timestamp(ts))) {
                    Existence::Exists(catalog_id) => {
                        prop_assert_eq!(expected.get(&ns).map(|raw| u64::from(*raw)), Some(catalog_id.0));
                    }
                    Existence::NotExists => prop_assert!(!expected.contains_key(&ns)),
                    Existence::Unknown => {}
                }
            }
        }
        for ns in 0..NAMESPACES {
            let latest = history.lookup_namespace(&namespace(ns), None);
            let expected = model
                .state
                .get(&ns)
                .map_or(Existence::NotExists, |raw| Existence::Exists(CatalogId(u64::from(*raw))));
            prop_assert_eq!(latest, expected);
        }
    }

    #[test]
    fn ids_have_at_most_one_live_interval(ops in arb_ops()) {
        let (history, _model, last) = replay(&ops);
        for raw in 1..=IDS {
            let Some(entries) = history.id_entries(id(raw)) else {
                continue;
            };
            prop_assert!(entries.len() <= 2, "{} entries for id {}", entries.len(), raw);
            prop_assert!(entries[0].catalog_id.is_some());
            if let Some(second) = entries.get(1) {
                prop_assert!(second.catalog_id.is_none());
                prop_assert!(second.ts > entries[0].ts);
            }
            let live = (0..=last + 1)
                .filter(|ts| matches!(history.lookup_id(id(raw), Some(Timestamp(*ts))), Existence::Exists(_)))
                .collect::<Vec<_>>();
            if let (Some(first), Some(end)) = (live.first(), live.last()) {
                prop_assert_eq!(live.len() as u64, end - first + 1, "gap in the live interval of {}", raw);
            }
        }
    }

    #[test]
    fn lookups_before_creation_never_exist(ops in arb_ops()) {
        let (history, _model, _last) = replay(&ops);
        for raw in 1..=IDS {
            let Some(created) = history.id_entries(id(raw)).map(|entries| entries[0].ts) else {
                continue;
            };
            for ts in 0..created.0 {
                prop_assert!(!matches!(
                    history.lookup_id(id(raw), Some(Timestamp(ts))),
                    Existence::Exists(_)
                ));
            }
        }
    }

    #[test]
    fn cleanup_preserves_lookups_at_or_after_oldest(ops in arb_ops(), cut in 0u64..100) {
        let (mut history, _model, last) = replay(&ops);
        let oldest = cut % (last + 2);
        let before = history.clone();
        history.cleanup(Timestamp(oldest));
        prop_assert!(!history.needs_cleanup(Timestamp(oldest)));
        prop_assert!(history.oldest_maintained() >= Timestamp(oldest));

        for ts in oldest..=last + 1 {
            for ns in 0..NAMESPACES {
                prop_assert_eq!(
                    history.lookup_namespace(&namespace(ns), Some(Timestamp(ts))),
                    before.lookup_namespace(&namespace(ns), Some(Timestamp(ts))),
                    "namespace {} at {} after cleanup at {}", ns, ts, oldest
                );
            }
            for raw in 1..=IDS {
                prop_assert_eq!(
                    history.lookup_id(id(raw), Some(Timestamp(ts))),
                    before.lookup_id(id(raw), Some(Timestamp(ts))),
                    "id {} at {} after cleanup at {}", raw, ts, oldest
                );
            }
        }
    }
}
