//! Stateful property testing for the list cache.
//!
//! Uses proptest-state-machine to drive `TtlListMap` through random puts,
//! single-item edits, reconciles and clock advances. The reference model
//! tracks, per parent:
//!
//! - The ordered item list, newest first
//! - The time the list was stored (edits in place never refresh it)
//! - Expiry strictly after the lifetime has elapsed

use std::collections::HashMap;
use std::time::Duration;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::runtime::{Builder, Runtime};
use uuid::Uuid;

use huddle_sync::Identified;
use huddle_sync::ttl::TtlListMap;

/// List lifetime in seconds.
const TTL_SECS: u64 = 30;
/// Number of distinct parents.
const PARENTS: u8 = 3;
/// Number of distinct item ids.
const ITEMS: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Item {
    id: Uuid,
    rev: u8,
}

impl Identified for Item {
    fn id(&self) -> Uuid {
        self.id
    }
}

fn item_id(n: u8) -> Uuid {
    Uuid::from_u128(n as u128 + 1)
}

fn parent_id(n: u8) -> Uuid {
    Uuid::from_u128(0xFF00 + n as u128)
}

/// Operations that can be performed on the list cache.
#[derive(Debug, Clone)]
pub enum ListOperation {
    /// Store a whole list.
    Put { parent: u8, items: Vec<u8> },
    /// Drop a list.
    Invalidate { parent: u8 },
    /// Prepend or replace an item.
    AppendFront { parent: u8, item: u8, rev: u8 },
    /// Remove an item by id.
    RemoveItem { parent: u8, item: u8 },
    /// Swap a pending item for its authoritative version.
    Reconcile { parent: u8, pending: u8, item: u8, rev: u8 },
    /// Let time pass.
    Advance { secs: u64 },
}

#[derive(Clone, Debug)]
pub struct StoredList {
    items: Vec<(u8, u8)>,
    stored_at: u64,
}

/// Reference model for the list cache.
#[derive(Clone, Debug, Default)]
pub struct ListCacheModel {
    now: u64,
    lists: HashMap<u8, StoredList>,
}

impl ListCacheModel {
    fn live(&self, parent: u8) -> Option<&StoredList> {
        self.lists
            .get(&parent)
            .filter(|list| self.now - list.stored_at <= TTL_SECS)
    }

    fn live_mut(&mut self, parent: u8) -> Option<&mut StoredList> {
        let now = self.now;
        self.lists
            .get_mut(&parent)
            .filter(|list| now - list.stored_at <= TTL_SECS)
    }
}

impl ReferenceStateMachine for ListCacheModel {
    type State = Self;
    type Transition = ListOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let parent = 0..PARENTS;
        let item = 0..ITEMS;
        prop_oneof![
            2 => (parent.clone(), prop::collection::vec(item.clone(), 0..5))
                .prop_map(|(parent, mut items)| {
                    items.dedup();
                    ListOperation::Put { parent, items }
                }),
            1 => parent.clone().prop_map(|parent| ListOperation::Invalidate { parent }),
            4 => (parent.clone(), item.clone(), any::<u8>())
                .prop_map(|(parent, item, rev)| ListOperation::AppendFront { parent, item, rev }),
            2 => (parent.clone(), item.clone())
                .prop_map(|(parent, item)| ListOperation::RemoveItem { parent, item }),
            3 => (parent.clone(), item.clone(), item, any::<u8>()).prop_map(
                |(parent, pending, item, rev)| ListOperation::Reconcile {
                    parent,
                    pending,
                    item,
                    rev,
                }
            ),
            1 => (1u64..20u64).prop_map(|secs| ListOperation::Advance { secs }),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            ListOperation::Put { parent, items } => {
                // Later duplicates would be collapsed by id in any real list; keep the first.
                let mut seen = Vec::new();
                let items = items
                    .iter()
                    .filter(|id| {
                        let fresh = !seen.contains(*id);
                        seen.push(**id);
                        fresh
                    })
                    .map(|id| (*id, 0))
                    .collect();
                state.lists.insert(
                    *parent,
                    StoredList {
                        items,
                        stored_at: state.now,
                    },
                );
            }
            ListOperation::Invalidate { parent } => {
                state.lists.remove(parent);
            }
            ListOperation::AppendFront { parent, item, rev } => {
                if let Some(list) = state.live_mut(*parent) {
                    match list.items.iter().position(|(id, _)| id == item) {
                        Some(pos) => list.items[pos] = (*item, *rev),
                        None => list.items.insert(0, (*item, *rev)),
                    }
                }
            }
            ListOperation::RemoveItem { parent, item } => {
                if let Some(list) = state.live_mut(*parent) {
                    list.items.retain(|(id, _)| id != item);
                }
            }
            ListOperation::Reconcile { parent, pending, item, rev } => {
                if let Some(list) = state.live_mut(*parent) {
                    let pending_pos = list.items.iter().position(|(id, _)| id == pending);
                    let existing_pos = list.items.iter().position(|(id, _)| id == item);
                    match (pending_pos, existing_pos) {
                        (Some(p), Some(e)) if p != e => {
                            list.items[p] = (*item, *rev);
                            list.items.remove(e);
                        }
                        (Some(p), _) => list.items[p] = (*item, *rev),
                        (None, Some(e)) => list.items[e] = (*item, *rev),
                        (None, None) => list.items.insert(0, (*item, *rev)),
                    }
                }
            }
            ListOperation::Advance { secs } => {
                state.now += secs;
            }
        }
        state
    }
}

/// Test harness that wraps the real list cache with a paused-clock runtime.
pub struct ListCacheHarness {
    runtime: Runtime,
    cache: TtlListMap<Uuid, Item>,
}

impl ListCacheHarness {
    fn new() -> Self {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("Failed to create tokio runtime");
        Self {
            runtime,
            cache: TtlListMap::new(),
        }
    }

    fn apply_operation(&self, op: &ListOperation) {
        let ttl = Duration::from_secs(TTL_SECS);
        self.runtime.block_on(async {
            match op {
                ListOperation::Put { parent, items } => {
                    let mut list: Vec<Item> = Vec::new();
                    for id in items {
                        if !list.iter().any(|existing| existing.id == item_id(*id)) {
                            list.push(Item {
                                id: item_id(*id),
                                rev: 0,
                            });
                        }
                    }
                    self.cache.put(parent_id(*parent), list, ttl);
                }
                ListOperation::Invalidate { parent } => {
                    self.cache.invalidate(&parent_id(*parent));
                }
                ListOperation::AppendFront { parent, item, rev } => {
                    self.cache.append_front(
                        &parent_id(*parent),
                        Item {
                            id: item_id(*item),
                            rev: *rev,
                        },
                    );
                }
                ListOperation::RemoveItem { parent, item } => {
                    self.cache.remove_item(&parent_id(*parent), item_id(*item));
                }
                ListOperation::Reconcile { parent, pending, item, rev } => {
                    self.cache.reconcile(
                        &parent_id(*parent),
                        item_id(*pending),
                        Item {
                            id: item_id(*item),
                            rev: *rev,
                        },
                    );
                }
                ListOperation::Advance { secs } => {
                    tokio::time::advance(Duration::from_secs(*secs)).await;
                }
            }
        });
    }

    fn verify_invariants(&self, model: &ListCacheModel) {
        self.runtime.block_on(async {
            for parent in 0..PARENTS {
                let actual = self.cache.get(&parent_id(parent));
                let expected = model.live(parent).map(|list| {
                    list.items
                        .iter()
                        .map(|(id, rev)| Item {
                            id: item_id(*id),
                            rev: *rev,
                        })
                        .collect::<Vec<_>>()
                });

                // Invariant 1: contents and order match the model, including expiry.
                assert_eq!(
                    actual, expected,
                    "List mismatch for parent {} at t={}",
                    parent, model.now
                );

                // Invariant 2: ids within a list are unique.
                if let Some(list) = actual {
                    let mut ids: Vec<Uuid> = list.iter().map(|item| item.id).collect();
                    ids.sort();
                    ids.dedup();
                    assert_eq!(ids.len(), list.len(), "Duplicate id in parent {}", parent);
                }
            }
        });
    }
}

impl StateMachineTest for ListCacheHarness {
    type SystemUnderTest = Self;
    type Reference = ListCacheModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn list_cache_state_machine_test(sequential 1..60 => ListCacheHarness);
}

#[test]
fn test_edit_in_place_keeps_insertion_time() {
    let harness = ListCacheHarness::new();
    let parent = parent_id(0);
    let ttl = Duration::from_secs(TTL_SECS);

    harness.runtime.block_on(async {
        harness.cache.put(parent, Vec::new(), ttl);
        tokio::time::advance(Duration::from_secs(TTL_SECS - 5)).await;
        assert!(harness.cache.append_front(&parent, Item { id: item_id(1), rev: 0 }));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(harness.cache.get(&parent).is_none());
        assert!(!harness.cache.append_front(&parent, Item { id: item_id(2), rev: 0 }));
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn reconcile_never_duplicates(
        existing in prop::collection::btree_set(0u8..ITEMS, 0..6),
        pending in 0u8..ITEMS,
        item in 0u8..ITEMS,
    ) {
        let harness = ListCacheHarness::new();
        let parent = parent_id(0);
        harness.runtime.block_on(async {
            let list: Vec<Item> = existing
                .iter()
                .map(|id| Item { id: item_id(*id), rev: 0 })
                .collect();
            harness.cache.put(parent, list, Duration::from_secs(TTL_SECS));
            harness.cache.reconcile(&parent, item_id(pending), Item { id: item_id(item), rev: 1 });

            let after = harness.cache.get(&parent).unwrap_or_default();
            let copies = after.iter().filter(|i| i.id == item_id(item)).count();
            prop_assert_eq!(copies, 1);
            if pending != item {
                prop_assert!(after.iter().all(|i| i.id != item_id(pending)));
            }
            Ok(())
        })?;
    }
}
