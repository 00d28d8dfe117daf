//! Property-based testing for the query table
//!
//! This module implements state machine testing using
//! proptest-state-machine: random sequences of the operations the sender
//! and receiver perform (send, complete, timeout, rollback) run against
//! both a reference model and the real table, verifying the structural
//! invariants the correlation logic depends on after every transition:
//! the free/outstanding partition, send-time ordering, and id uniqueness
//! among outstanding queries.

use proptest::prelude::*;
use proptest_state_machine::{prop_state_machine, ReferenceStateMachine, StateMachineTest};

use dnsbench::engine::query_table::{QueryTable, ReleaseTo};
use dnsbench::engine::NQIDS;

/// Query table transitions for the state machine
#[derive(Clone, Debug)]
pub enum Transition {
    /// Allocate a slot and commit it with the next timestamp (a send).
    Send,
    /// Complete an arbitrary outstanding query (a matched reply).
    Complete(u8),
    /// Expire the oldest outstanding query.
    TimeoutOldest,
    /// Allocate and immediately roll back to the front of the free list
    /// (no ready socket / build failure).
    Rollback,
}

/// Reference model: the outstanding timestamps newest-first, plus the
/// counters the engine keeps alongside the table.
#[derive(Clone, Debug, Default)]
pub struct QueryTableRefState {
    outstanding: Vec<u64>,
    clock: u64,
    num_sent: u64,
    num_completed: u64,
    num_timedout: u64,
}

impl ReferenceStateMachine for QueryTableRefState {
    type State = Self;
    type Transition = Transition;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let mut strategies: Vec<BoxedStrategy<Transition>> = vec![
            Just(Transition::Send).boxed(),
            Just(Transition::Send).boxed(),
            Just(Transition::Rollback).boxed(),
        ];

        // Operations on outstanding queries
        if !state.outstanding.is_empty() {
            strategies.push(any::<u8>().prop_map(Transition::Complete).boxed());
            strategies.push(Just(Transition::TimeoutOldest).boxed());
        }

        prop::strategy::Union::new(strategies).boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match transition {
            Transition::Send => {
                if state.outstanding.len() < NQIDS {
                    state.clock += 1;
                    state.outstanding.insert(0, state.clock);
                    state.num_sent += 1;
                }
            }
            Transition::Complete(selector) => {
                if !state.outstanding.is_empty() {
                    let index = *selector as usize % state.outstanding.len();
                    state.outstanding.remove(index);
                    state.num_completed += 1;
                }
            }
            Transition::TimeoutOldest => {
                if state.outstanding.pop().is_some() {
                    state.num_timedout += 1;
                }
            }
            Transition::Rollback => {
                // Allocate-then-rollback leaves no trace.
            }
        }
        state
    }
}

/// System under test: the real table plus the send clock.
pub struct QueryTableStateMachineTest {
    table: QueryTable,
    clock: u64,
}

impl StateMachineTest for QueryTableStateMachineTest {
    type SystemUnderTest = Self;
    type Reference = QueryTableRefState;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self {
            table: QueryTable::new(),
            clock: 0,
        }
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        match transition {
            Transition::Send => {
                if let Ok(qid) = state.table.allocate() {
                    state.clock += 1;
                    state.table.commit(qid, state.clock);
                }
            }
            Transition::Complete(selector) => {
                let ids = state.table.outstanding_ids();
                if !ids.is_empty() {
                    let qid = ids[selector as usize % ids.len()];
                    state.table.release(qid, ReleaseTo::FreeBack);
                }
            }
            Transition::TimeoutOldest => {
                if let Some(qid) = state.table.oldest() {
                    state.table.release(qid, ReleaseTo::FreeBack);
                }
            }
            Transition::Rollback => {
                if let Ok(qid) = state.table.allocate() {
                    state.table.release(qid, ReleaseTo::FreeFront);
                }
            }
        }
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        let table = &state.table;

        // Partition: outstanding length tracks the counters, and
        // together the two lists cover every slot.
        assert_eq!(
            table.outstanding_len() as u64,
            ref_state.num_sent - ref_state.num_completed - ref_state.num_timedout
        );
        assert_eq!(table.outstanding_len() + table.free_len(), NQIDS);

        // The outstanding timestamps match the model exactly, newest
        // first; monotone send order follows.
        let ids = table.outstanding_ids();
        let timestamps: Vec<u64> = ids.iter().map(|&qid| table.timestamp(qid)).collect();
        assert_eq!(timestamps, ref_state.outstanding);
        for pair in timestamps.windows(2) {
            assert!(pair[0] >= pair[1], "send order violated: {:?}", timestamps);
        }

        // Id uniqueness among outstanding queries.
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());

        // The tail is the oldest.
        if let Some(oldest) = table.oldest() {
            assert_eq!(*ids.last().unwrap(), oldest);
            let min = *timestamps.iter().min().unwrap();
            assert_eq!(table.timestamp(oldest), min);
        }
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn query_table_operations(
        sequential 1..300 => QueryTableStateMachineTest
    );
}

proptest! {
    #[test]
    fn rollback_keeps_ids_dense(rollbacks in 1usize..50) {
        let mut table = QueryTable::new();
        // Rolling back to the front must hand the same id out again, so
        // two consecutive sends cannot skip ids over failed attempts.
        for _ in 0..rollbacks {
            let qid = table.allocate().unwrap();
            prop_assert_eq!(qid, 0);
            table.release(qid, ReleaseTo::FreeFront);
        }
        let first = table.allocate().unwrap();
        let second = table.allocate().unwrap();
        prop_assert_eq!(first, 0);
        prop_assert_eq!(second, 1);
    }
}
