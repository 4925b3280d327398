//! Manages shared/exclusive locks on buffer slots.
//!
//! Locks are keyed by slot index, not by page id: the buffer pool
//! guarantees that a slot is never re-purposed while any transaction holds
//! a lock on it, so a slot lock is as good as a page lock for the page
//! currently resident there.

use crate::lock_mutex_recover;
use crate::strata_debug_log;
use crate::transaction::TransactionId;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

/// Index of a buffer slot; the unit of locking.
pub type SlotId = usize;

/// The two modes of the reader-writer discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub enum LockError {
    /// The requester would close a wait-for cycle and is chosen as the
    /// victim. Its thread is the one still live and able to unwind.
    Deadlock,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    tid: TransactionId,
    mode: LockMode,
}

/// Lock state of one slot: the granted holders and a FIFO queue of
/// blocked requests.
#[derive(Debug, Default)]
struct SlotLock {
    holders: HashMap<TransactionId, LockMode>,
    waiters: VecDeque<Waiter>,
}

/// The lock manager.
///
/// A single mutex guards the whole table and a single condvar parks every
/// waiter; grants are re-evaluated on each release. The wait-for graph is
/// kept as adjacency sets and checked for a cycle whenever a request is
/// about to block.
pub struct LockManager {
    table: Mutex<Vec<SlotLock>>,
    cvar: Condvar,
    waits_for: Mutex<HashMap<TransactionId, HashSet<TransactionId>>>,
}

impl LockManager {
    pub fn new(num_slots: usize) -> Self {
        let mut table = Vec::with_capacity(num_slots);
        table.resize_with(num_slots, SlotLock::default);
        Self {
            table: Mutex::new(table),
            cvar: Condvar::new(),
            waits_for: Mutex::new(HashMap::new()),
        }
    }

    /// Acquires `mode` on `slot` for `tid`, blocking until granted.
    ///
    /// Re-acquiring a compatible or weaker mode is a no-op. A transaction
    /// that is the sole shared holder upgrades to exclusive in place;
    /// with other shared holders present the upgrade queues until they
    /// release. Fails with [`LockError::Deadlock`] when waiting would
    /// close a cycle in the wait-for graph.
    pub fn acquire(&self, tid: TransactionId, slot: SlotId, mode: LockMode) -> Result<(), LockError> {
        let mut table = lock_mutex_recover(&self.table);
        {
            let state = &mut table[slot];
            if let Some(&held) = state.holders.get(&tid) {
                if held == LockMode::Exclusive || mode == LockMode::Shared {
                    return Ok(());
                }
                if state.holders.len() == 1 {
                    state.holders.insert(tid, LockMode::Exclusive);
                    return Ok(());
                }
            } else if state.waiters.is_empty() && Self::compatible(&state.holders, mode) {
                state.holders.insert(tid, mode);
                return Ok(());
            }
            state.waiters.push_back(Waiter { tid, mode });
        }

        loop {
            Self::grant_waiters(&mut table[slot]);
            if Self::is_granted(&table[slot], tid, mode) {
                self.clear_waits(tid);
                return Ok(());
            }

            self.update_waits_for(tid, &table[slot], mode);
            if self.closes_cycle(tid) {
                strata_debug_log!("[LockManager::acquire] deadlock: {tid} aborted on slot {slot}");
                table[slot].waiters.retain(|w| w.tid != tid);
                self.clear_waits(tid);
                self.cvar.notify_all();
                return Err(LockError::Deadlock);
            }

            table = self
                .cvar
                .wait(table)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Drops `tid`'s interest in `slot` and wakes waiters that now fit.
    /// Releasing a lock that is not held is a no-op.
    pub fn release(&self, tid: TransactionId, slot: SlotId) {
        let mut table = lock_mutex_recover(&self.table);
        let state = &mut table[slot];
        if state.holders.remove(&tid).is_none() {
            return;
        }
        Self::grant_waiters(state);
        self.cvar.notify_all();
    }

    /// Removes `tid` from every slot's holders and waiters.
    pub fn release_all(&self, tid: TransactionId) {
        let mut table = lock_mutex_recover(&self.table);
        for state in table.iter_mut() {
            let was_holding = state.holders.remove(&tid).is_some();
            let waiters_before = state.waiters.len();
            state.waiters.retain(|w| w.tid != tid);
            if was_holding || state.waiters.len() != waiters_before {
                Self::grant_waiters(state);
            }
        }
        self.clear_waits(tid);
        self.cvar.notify_all();
    }

    /// True iff `tid` holds a lock of any mode on `slot`.
    pub fn is_holding(&self, tid: TransactionId, slot: SlotId) -> bool {
        lock_mutex_recover(&self.table)[slot].holders.contains_key(&tid)
    }

    /// True iff any transaction holds a lock on `slot`.
    pub fn is_locked(&self, slot: SlotId) -> bool {
        !lock_mutex_recover(&self.table)[slot].holders.is_empty()
    }

    /// Every slot `tid` currently holds a lock on, in slot order.
    pub fn held_slots(&self, tid: TransactionId) -> Vec<SlotId> {
        lock_mutex_recover(&self.table)
            .iter()
            .enumerate()
            .filter(|(_, state)| state.holders.contains_key(&tid))
            .map(|(slot, _)| slot)
            .collect()
    }

    fn compatible(holders: &HashMap<TransactionId, LockMode>, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !holders.values().any(|&m| m == LockMode::Exclusive),
            LockMode::Exclusive => holders.is_empty(),
        }
    }

    fn is_granted(state: &SlotLock, tid: TransactionId, mode: LockMode) -> bool {
        match (state.holders.get(&tid), mode) {
            (Some(LockMode::Exclusive), _) => true,
            (Some(LockMode::Shared), LockMode::Shared) => true,
            _ => false,
        }
    }

    /// Grants as many queued requests as compatibility allows.
    ///
    /// A pending upgrade (a shared holder queued for exclusive) is served
    /// first, regardless of queue position: it can never be granted behind
    /// its own shared hold, and every other waiter is behind that hold
    /// anyway. After that, requests are granted strictly in FIFO order;
    /// the first incompatible request stops the scan, so an exclusive
    /// waiter at the head shields itself from a stream of later readers.
    fn grant_waiters(state: &mut SlotLock) {
        if state.holders.len() == 1 {
            if let Some(pos) = state
                .waiters
                .iter()
                .position(|w| w.mode == LockMode::Exclusive && state.holders.contains_key(&w.tid))
            {
                if let Some(w) = state.waiters.remove(pos) {
                    state.holders.insert(w.tid, LockMode::Exclusive);
                }
            }
        }

        while let Some(front) = state.waiters.front().copied() {
            if !Self::compatible(&state.holders, front.mode) {
                break;
            }
            state.waiters.pop_front();
            state.holders.insert(front.tid, front.mode);
        }
    }

    /// Rebuilds `tid`'s out-edges: the transactions it is blocked behind
    /// on `slot`, i.e. incompatible holders plus incompatible requests
    /// queued ahead of it.
    fn update_waits_for(&self, tid: TransactionId, state: &SlotLock, mode: LockMode) {
        let mut blocking = HashSet::new();
        for (&holder, &held) in &state.holders {
            if holder == tid {
                continue;
            }
            if mode == LockMode::Exclusive || held == LockMode::Exclusive {
                blocking.insert(holder);
            }
        }
        for waiter in &state.waiters {
            if waiter.tid == tid {
                break;
            }
            if mode == LockMode::Exclusive || waiter.mode == LockMode::Exclusive {
                blocking.insert(waiter.tid);
            }
        }

        let mut waits_for = lock_mutex_recover(&self.waits_for);
        let edges = waits_for.entry(tid).or_default();
        edges.clear();
        edges.extend(blocking);
    }

    fn clear_waits(&self, tid: TransactionId) {
        let mut waits_for = lock_mutex_recover(&self.waits_for);
        waits_for.remove(&tid);
        for edges in waits_for.values_mut() {
            edges.remove(&tid);
        }
    }

    /// True iff blocking would put `start` on a wait-for cycle, i.e. the
    /// chain of transactions it waits behind leads back to `start`
    /// itself. A worklist walk over the adjacency sets; `seen` keeps the
    /// walk finite when chains converge.
    fn closes_cycle(&self, start: TransactionId) -> bool {
        let waits_for = lock_mutex_recover(&self.waits_for);
        let mut pending: Vec<TransactionId> = match waits_for.get(&start) {
            Some(edges) => edges.iter().copied().collect(),
            None => return false,
        };
        let mut seen: HashSet<TransactionId> = HashSet::new();

        while let Some(tid) = pending.pop() {
            if tid == start {
                return true;
            }
            if !seen.insert(tid) {
                continue;
            }
            if let Some(edges) = waits_for.get(&tid) {
                pending.extend(edges.iter().copied());
            }
        }
        false
    }
}
