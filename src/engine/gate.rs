//! One-shot execution gates and the session memo.
//!
//! The first caller to reach an unvalidated key becomes its owner and runs
//! validation (and maybe execution); every other caller blocks on the gate
//! and receives the owner's outcome. Finished keys stay in the memo for the
//! rest of the session.
//!
//! The table also records, for every task currently inside a `require`, the
//! key it is requiring. Following these edges from a running key tells us
//! whether blocking on it would wait for ourselves, which is how a cycle that
//! spans two call lineages is reported instead of deadlocking.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use crate::core::TaskKey;
use crate::error::EngineError;

pub(crate) type Outcome<O> = Result<O, EngineError>;

pub(crate) struct Gate<O> {
    state: Mutex<Option<Outcome<O>>>,
    ready: Condvar,
}

impl<O: Clone> Gate<O> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn release(&self, outcome: Outcome<O>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = Some(outcome);
        self.ready.notify_all();
    }

    /// Blocks until the owner releases the gate.
    pub(crate) fn wait(&self) -> Outcome<O> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(outcome) = state.as_ref() {
                return outcome.clone();
            }

            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

enum Slot<O> {
    Running(Arc<Gate<O>>),
    Done(Outcome<O>),
}

pub(crate) enum Entry<O> {
    /// Already validated in this session.
    Done(Outcome<O>),
    /// The caller owns the gate and must call [`Gates::finish`].
    Owner(Arc<Gate<O>>),
    /// Somebody else owns the gate.
    Wait(Arc<Gate<O>>),
}

struct Table<O> {
    slots: HashMap<TaskKey, Slot<O>>,
    /// requirer -> key it is currently requiring
    active: HashMap<TaskKey, TaskKey>,
}

impl<O> Table<O> {
    /// If `key` is (transitively) requiring `requirer`, returns the cycle.
    fn cycle_through(&self, key: &TaskKey, requirer: &TaskKey) -> Option<Vec<TaskKey>> {
        let mut path = vec![requirer.clone(), key.clone()];
        let mut current = key;

        while let Some(next) = self.active.get(current) {
            path.push(next.clone());
            if next == requirer {
                return Some(path);
            }
            current = next;
        }

        None
    }
}

pub(crate) struct Gates<O> {
    table: Mutex<Table<O>>,
}

impl<O> Default for Gates<O> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table {
                slots: HashMap::new(),
                active: HashMap::new(),
            }),
        }
    }
}

impl<O: Clone> Gates<O> {
    /// Claims `key` on behalf of `requirer`.
    pub(crate) fn enter(&self, key: &TaskKey, requirer: Option<&TaskKey>) -> Result<Entry<O>, EngineError> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);

        let entry = match table.slots.get(key) {
            Some(Slot::Done(outcome)) => return Ok(Entry::Done(outcome.clone())),
            Some(Slot::Running(gate)) => {
                if let Some(requirer) = requirer
                    && let Some(path) = table.cycle_through(key, requirer)
                {
                    return Err(EngineError::Cycle { path });
                }
                Entry::Wait(gate.clone())
            }
            None => {
                let gate = Arc::new(Gate::new());
                table
                    .slots
                    .insert(key.clone(), Slot::Running(gate.clone()));
                Entry::Owner(gate)
            }
        };

        if let Some(requirer) = requirer {
            table.active.insert(requirer.clone(), key.clone());
        }

        Ok(entry)
    }

    /// Drops the active edge of `requirer` once its require returned.
    pub(crate) fn leave(&self, requirer: &TaskKey) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.active.remove(requirer);
    }

    /// Memoizes the outcome of an owned key and wakes every waiter.
    pub(crate) fn finish(&self, key: &TaskKey, gate: &Gate<O>, outcome: Outcome<O>) {
        {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.slots.insert(key.clone(), Slot::Done(outcome.clone()));
        }

        gate.release(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExecContext, Task};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    struct Unit(u32);

    impl Task for Unit {
        type Output = u32;

        fn id(&self) -> &'static str {
            "unit"
        }

        fn execute(&self, _: &mut ExecContext<Self>) -> Result<u32, EngineError> {
            Ok(self.0)
        }
    }

    fn key(n: u32) -> TaskKey {
        TaskKey::of(&Unit(n)).unwrap()
    }

    #[test]
    fn test_first_caller_owns() {
        let gates = Gates::<u32>::default();

        let Ok(Entry::Owner(gate)) = gates.enter(&key(1), None) else {
            panic!("expected ownership");
        };
        assert!(matches!(gates.enter(&key(1), None), Ok(Entry::Wait(_))));

        gates.finish(&key(1), &gate, Ok(7));
        assert!(matches!(gates.enter(&key(1), None), Ok(Entry::Done(Ok(7)))));
        assert_eq!(gate.wait().unwrap(), 7);
    }

    #[test]
    fn test_waiters_see_owner_outcome() {
        let gates = Arc::new(Gates::<u32>::default());
        let Ok(Entry::Owner(gate)) = gates.enter(&key(1), None) else {
            panic!("expected ownership");
        };

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let gates = gates.clone();
                std::thread::spawn(move || match gates.enter(&key(1), None) {
                    Ok(Entry::Wait(gate)) => gate.wait(),
                    Ok(Entry::Done(outcome)) => outcome,
                    _ => panic!("unexpected entry"),
                })
            })
            .collect();

        gates.finish(&key(1), &gate, Ok(42));

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap().unwrap(), 42);
        }
    }

    #[test]
    fn test_cross_lineage_cycle() {
        let gates = Gates::<u32>::default();

        // lineage one owns 1 and is requiring 2
        assert!(matches!(gates.enter(&key(1), None), Ok(Entry::Owner(_))));
        assert!(matches!(gates.enter(&key(2), Some(&key(1))), Ok(Entry::Owner(_))));

        // lineage two owns 3 and now 2 requires 3, 3 requires 1
        assert!(matches!(gates.enter(&key(3), None), Ok(Entry::Owner(_))));
        assert!(matches!(gates.enter(&key(3), Some(&key(2))), Ok(Entry::Wait(_))));

        let err = gates.enter(&key(1), Some(&key(3))).err().unwrap();
        let EngineError::Cycle { path } = err else {
            panic!("expected a cycle");
        };
        assert_eq!(path, vec![key(3), key(1), key(2), key(3)]);
    }

    #[test]
    fn test_leave_clears_edge() {
        let gates = Gates::<u32>::default();

        assert!(matches!(gates.enter(&key(1), None), Ok(Entry::Owner(_))));
        assert!(matches!(gates.enter(&key(2), Some(&key(1))), Ok(Entry::Owner(_))));
        gates.leave(&key(1));

        // 2 requiring 1 is now a plain wait, 1 no longer waits on 2
        assert!(matches!(gates.enter(&key(1), Some(&key(2))), Ok(Entry::Wait(_))));
    }
}
