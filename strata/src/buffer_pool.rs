//! The transactional page cache.
//!
//! A fixed array of slots, each either empty or holding one page. The
//! pool reads pages through the catalog's storage backends on demand,
//! hands out shared references under per-slot locks, and evicts with a
//! NO-STEAL clock: a page dirtied by an uncommitted transaction is never
//! written back, so only clean, unlocked slots are eviction candidates.
//!
//! Commit flushes every slot the transaction locks (WAL record, then log
//! force, then the page write), refreshes before-images and releases the
//! locks. Abort drops the aborter's dirty slots from the cache so the
//! next fetch re-reads pre-transaction bytes.

use crate::catalog::Catalog;
use crate::errors::{Result, StorageError};
use crate::failpoint;
use crate::heap::{RecordId, Tuple};
use crate::lock_manager::{LockManager, LockMode, SlotId};
use crate::lock_mutex_recover;
use crate::page::Page;
use crate::transaction::TransactionId;
use crate::wal::WalManager;
use crate::{strata_debug_log, PageId, TableId};
use parking_lot::RwLock;
use std::sync::{Arc, Mutex};

/// A page as handed out by the pool.
///
/// The reference stays valid for as long as the holder keeps its slot
/// lock; eviction never touches a locked slot. Guards taken from the
/// `RwLock` must be dropped before calling back into the pool, or the
/// caller can deadlock against its own fetch.
pub type SharedPage = Arc<RwLock<Page>>;

#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Capacity of the buffer, fixed at construction.
    pub num_pages: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self { num_pages: 50 }
    }
}

struct Resident {
    pid: PageId,
    page: SharedPage,
}

struct PoolState {
    slots: Vec<Option<Resident>>,
    evict_idx: usize,
}

/// The buffer pool manager.
pub struct BufferPool {
    catalog: Arc<Catalog>,
    wal: Arc<WalManager>,
    pub lock: LockManager,
    state: Mutex<PoolState>,
}

#[derive(Clone, Copy)]
enum Probe {
    Hit(SlotId),
    Fill(SlotId),
}

impl BufferPool {
    pub fn new(catalog: Arc<Catalog>, wal: Arc<WalManager>, config: BufferPoolConfig) -> Self {
        let mut slots = Vec::with_capacity(config.num_pages);
        slots.resize_with(config.num_pages, || None);
        Self {
            catalog,
            wal,
            lock: LockManager::new(config.num_pages),
            state: Mutex::new(PoolState {
                slots,
                evict_idx: 0,
            }),
        }
    }

    pub fn num_slots(&self) -> usize {
        lock_mutex_recover(&self.state).slots.len()
    }

    /// Fetches `pid` under a lock of the requested mode, blocking while an
    /// incompatible holder is in the way.
    ///
    /// A resident page is reused; otherwise the last empty slot from the
    /// scan is locked *before* it is filled from the storage backend, and
    /// a full buffer evicts first. Fails with
    /// [`StorageError::Deadlock`] when waiting would close a wait-for
    /// cycle and with [`StorageError::NoEvictablePage`] when every slot
    /// holds a dirty page.
    pub fn get_page(&self, tid: TransactionId, pid: PageId, mode: LockMode) -> Result<SharedPage> {
        loop {
            let probe = self.probe(pid)?;
            let slot = match probe {
                Probe::Hit(slot) | Probe::Fill(slot) => slot,
            };

            // The slot lock is taken without holding the pool mutex; the
            // world may change while we block, so the outcome is
            // re-checked before it is trusted. A lock acquired for a slot
            // that no longer fits the request is given back, unless the
            // transaction held it already.
            let held_before = self.lock.is_holding(tid, slot);
            self.lock.acquire(tid, slot, mode)?;

            match self.finish_fetch(probe, pid) {
                Ok(Some(page)) => return Ok(page),
                other => {
                    if !held_before {
                        self.lock.release(tid, slot);
                    }
                    if let Err(err) = other {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Second half of a fetch, entered with the slot lock held: confirm
    /// the slot still matches the request, filling it on a miss.
    /// `Ok(None)` means the world shifted while the caller blocked (the
    /// page moved, was evicted, or the empty slot was claimed) and the
    /// fetch must restart from the scan.
    fn finish_fetch(&self, probe: Probe, pid: PageId) -> Result<Option<SharedPage>> {
        let slot = match probe {
            Probe::Hit(slot) | Probe::Fill(slot) => slot,
        };
        let mut state = lock_mutex_recover(&self.state);
        if let Some((found, page)) = Self::find_resident(&state, pid) {
            return Ok((found == slot).then_some(page));
        }
        match probe {
            Probe::Hit(_) => Ok(None),
            Probe::Fill(_) => {
                if state.slots[slot].is_some() {
                    return Ok(None);
                }
                let page = self.catalog.database_file(pid.table_id)?.read_page(pid)?;
                strata_debug_log!("[BufferPool::get_page] filled slot {slot} with {pid}");
                let shared: SharedPage = Arc::new(RwLock::new(page));
                state.slots[slot] = Some(Resident {
                    pid,
                    page: shared.clone(),
                });
                Ok(Some(shared))
            }
        }
    }

    /// Gives back `tid`'s lock on a resident page without completing the
    /// transaction. Only safe for pages the transaction has not modified,
    /// e.g. rejected read-only probes.
    pub fn unsafe_release(&self, tid: TransactionId, pid: PageId) -> Result<()> {
        let slot = {
            let state = lock_mutex_recover(&self.state);
            Self::find_resident(&state, pid).map(|(slot, _)| slot)
        };
        let Some(slot) = slot else {
            return Err(StorageError::Invariant(format!("page {pid} is not resident")));
        };
        if !self.lock.is_holding(tid, slot) {
            return Err(StorageError::Invariant(format!(
                "{tid} holds no lock on page {pid}"
            )));
        }
        self.lock.release(tid, slot);
        Ok(())
    }

    /// True iff `pid` is resident and `tid` holds a lock on its slot.
    pub fn holds_lock(&self, tid: TransactionId, pid: PageId) -> bool {
        let state = lock_mutex_recover(&self.state);
        match Self::find_resident(&state, pid) {
            Some((slot, _)) => self.lock.is_holding(tid, slot),
            None => false,
        }
    }

    /// Stores a tuple through the table's backend and marks every page it
    /// touched dirty by `tid`. The backend acquires its own write locks
    /// via [`BufferPool::get_page`].
    pub fn insert_tuple(
        &self,
        tid: TransactionId,
        table_id: TableId,
        tuple: Tuple,
    ) -> Result<RecordId> {
        let file = self.catalog.database_file(table_id)?;
        let (pages, record_id) = file.insert_tuple(tid, tuple, self)?;
        for page in pages {
            page.write().mark_dirty(tid);
        }
        Ok(record_id)
    }

    /// Removes a tuple through its table's backend; dirtying as for
    /// [`BufferPool::insert_tuple`].
    pub fn delete_tuple(&self, tid: TransactionId, tuple: &Tuple) -> Result<()> {
        let record_id = tuple
            .record_id
            .ok_or_else(|| StorageError::Invariant("tuple has no record id".to_string()))?;
        let file = self.catalog.database_file(record_id.page_id.table_id)?;
        let pages = file.delete_tuple(tid, tuple, self)?;
        for page in pages {
            page.write().mark_dirty(tid);
        }
        Ok(())
    }

    /// Commits or aborts `tid`, then releases every lock it holds.
    ///
    /// Commit flushes each slot the transaction locks and refreshes its
    /// before-image; abort drops the slots it dirtied. A flush failure
    /// propagates *before* any lock is released, leaving the transaction
    /// in doubt for the surrounding engine to resolve.
    pub fn transaction_complete(&self, tid: TransactionId, commit: bool) -> Result<()> {
        strata_debug_log!("[BufferPool::transaction_complete] {tid} commit={commit}");
        if commit {
            self.flush_transaction(tid)?;
            self.wal.log_commit(tid)?;
            self.wal.force()?;
        } else {
            let held = self.lock.held_slots(tid);
            {
                let mut state = lock_mutex_recover(&self.state);
                for slot in held {
                    let dirtied_by_us = state.slots[slot]
                        .as_ref()
                        .map_or(false, |r| r.page.read().dirtied_by() == Some(tid));
                    if dirtied_by_us {
                        state.slots[slot] = None;
                    }
                }
            }
            self.wal.log_abort(tid)?;
            self.wal.force()?;
        }
        self.lock.release_all(tid);
        Ok(())
    }

    /// Writes `pid` through to its backend if dirty: WAL record, log
    /// force, page write, in that order. Locks are left untouched.
    pub fn flush_page(&self, pid: PageId) -> Result<()> {
        let state = lock_mutex_recover(&self.state);
        if let Some((_, page)) = Self::find_resident(&state, pid) {
            self.flush_resident(&page)?;
        }
        Ok(())
    }

    /// Flushes every resident dirty page. Intended for tests and
    /// checkpoints: under NO-STEAL this writes data of transactions that
    /// may yet abort.
    pub fn flush_all_pages(&self) -> Result<()> {
        let state = lock_mutex_recover(&self.state);
        for resident in state.slots.iter().flatten() {
            self.flush_resident(&resident.page)?;
        }
        Ok(())
    }

    /// Forcibly empties the slot holding `pid` without flushing. Used by
    /// recovery to drop rolled-back pages and by index maintenance to
    /// reclaim deleted ones; the caller must ensure no other transaction
    /// still needs the slot, since locks are not consulted.
    pub fn remove_page(&self, pid: PageId) {
        let mut state = lock_mutex_recover(&self.state);
        if let Some((slot, _)) = Self::find_resident(&state, pid) {
            state.slots[slot] = None;
        }
    }

    /// Scans for `pid`; otherwise reports the last empty slot, evicting
    /// to make one when the buffer is full.
    fn probe(&self, pid: PageId) -> Result<Probe> {
        let mut state = lock_mutex_recover(&self.state);
        loop {
            let mut empty = None;
            for (i, slot) in state.slots.iter().enumerate() {
                match slot {
                    Some(resident) if resident.pid == pid => return Ok(Probe::Hit(i)),
                    None => empty = Some(i),
                    Some(_) => {}
                }
            }
            if let Some(i) = empty {
                return Ok(Probe::Fill(i));
            }
            self.evict_slot(&mut state)?;
        }
    }

    /// NO-STEAL clock eviction: advance the cursor past dirty and locked
    /// slots until a victim is found; a fruitless full rotation means the
    /// workload has outgrown the buffer.
    fn evict_slot(&self, state: &mut PoolState) -> Result<()> {
        let num = state.slots.len();
        if num == 0 {
            return Err(StorageError::NoEvictablePage);
        }
        let start = state.evict_idx;
        loop {
            let idx = state.evict_idx;
            let evictable = match &state.slots[idx] {
                None => true,
                Some(resident) => {
                    resident.page.read().dirtied_by().is_none() && !self.lock.is_locked(idx)
                }
            };
            if evictable {
                break;
            }
            state.evict_idx = (idx + 1) % num;
            if state.evict_idx == start {
                return Err(StorageError::NoEvictablePage);
            }
        }

        let idx = state.evict_idx;
        if let Some(resident) = state.slots[idx].take() {
            // a clean page needs no WAL and no write; flush is a no-op
            self.flush_resident(&resident.page)?;
            strata_debug_log!("[BufferPool::evict_slot] evicted {} from slot {idx}", resident.pid);
        }
        state.evict_idx = (idx + 1) % num;
        Ok(())
    }

    /// Flushes the pages `tid` has locked and re-snapshots their
    /// before-images, making the commit's writes the new undo baseline.
    fn flush_transaction(&self, tid: TransactionId) -> Result<()> {
        let held = self.lock.held_slots(tid);
        let state = lock_mutex_recover(&self.state);
        for slot in held {
            if let Some(resident) = &state.slots[slot] {
                self.flush_resident(&resident.page)?;
                resident.page.write().set_before_image();
            }
        }
        Ok(())
    }

    fn flush_resident(&self, shared: &SharedPage) -> Result<()> {
        let mut page = shared.write();
        let Some(dirtier) = page.dirtied_by() else {
            return Ok(());
        };
        let pid = page.id();
        self.wal
            .log_update(dirtier, pid, page.before_image(), &page.data)?;
        self.wal.force()?;
        failpoint::maybe_fail("pool.flush.before_write")?;
        let file = self.catalog.database_file(pid.table_id)?;
        file.write_page(&page)?;
        page.mark_clean();
        strata_debug_log!("[BufferPool::flush_resident] wrote {pid} for {dirtier}");
        Ok(())
    }

    fn find_resident(state: &PoolState, pid: PageId) -> Option<(SlotId, SharedPage)> {
        state
            .slots
            .iter()
            .enumerate()
            .find_map(|(slot, resident)| match resident {
                Some(r) if r.pid == pid => Some((slot, r.page.clone())),
                _ => None,
            })
    }
}
