use std::sync::{Arc, Mutex};
use strata::buffer_pool::{BufferPool, BufferPoolConfig, SharedPage};
use strata::catalog::Catalog;
use strata::errors::Result;
use strata::heap::{DbFile, HeapFile, RecordId, Tuple};
use strata::lock_manager::LockMode;
use strata::wal::{WalManager, WalRecord};
use strata::{Page, PageId, TableId, TransactionId};
use tempfile::tempdir;

mod common;

/// A backend wrapper that, on every `write_page`, checks the WAL already
/// holds an update record with the exact bytes being written. Any page
/// write the log cannot explain trips the assertion.
struct LoggedFile {
    inner: HeapFile,
    wal: Arc<WalManager>,
    writes: Mutex<Vec<PageId>>,
}

impl DbFile for LoggedFile {
    fn table_id(&self) -> TableId {
        self.inner.table_id()
    }

    fn read_page(&self, pid: PageId) -> Result<Page> {
        self.inner.read_page(pid)
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let logged = self.wal.records().unwrap().into_iter().any(|r| match r {
            WalRecord::Update { page_id, after, .. } => {
                page_id == page.id() && after == page.data.to_vec()
            }
            _ => false,
        });
        assert!(
            logged,
            "page {} written before its WAL record was appended",
            page.id()
        );
        self.writes.lock().unwrap().push(page.id());
        self.inner.write_page(page)
    }

    fn num_pages(&self) -> Result<u32> {
        self.inner.num_pages()
    }

    fn insert_tuple(
        &self,
        tid: TransactionId,
        tuple: Tuple,
        pool: &BufferPool,
    ) -> Result<(Vec<SharedPage>, RecordId)> {
        self.inner.insert_tuple(tid, tuple, pool)
    }

    fn delete_tuple(
        &self,
        tid: TransactionId,
        tuple: &Tuple,
        pool: &BufferPool,
    ) -> Result<Vec<SharedPage>> {
        self.inner.delete_tuple(tid, tuple, pool)
    }
}

fn setup_logged() -> (tempfile::TempDir, Arc<LoggedFile>, Arc<WalManager>, BufferPool) {
    let dir = tempdir().unwrap();
    let wal = Arc::new(WalManager::open(dir.path().join("table.wal")).unwrap());
    let inner = HeapFile::new(dir.path().join("table.db"), common::TABLE).unwrap();
    let file = Arc::new(LoggedFile {
        inner,
        wal: wal.clone(),
        writes: Mutex::new(Vec::new()),
    });
    let catalog = Arc::new(Catalog::new());
    catalog.register_table(file.clone());
    let pool = BufferPool::new(catalog, wal.clone(), BufferPoolConfig { num_pages: 4 });
    (dir, file, wal, pool)
}

#[test]
fn commit_logs_before_it_writes() {
    let (_dir, file, wal, pool) = setup_logged();

    let pid = PageId::new(common::TABLE, 0);
    let mut seeded = Page::new(pid);
    seeded.heap_insert(b"seed").unwrap();
    // seed through the inner file so the wrapper's check is not tripped
    file.inner.write_page(&seeded).unwrap();

    let tid = TransactionId::new();
    let page = pool.get_page(tid, pid, LockMode::Exclusive).unwrap();
    {
        let mut guard = page.write();
        guard.data[2000] = 0x11;
        guard.mark_dirty(tid);
    }
    pool.transaction_complete(tid, true).unwrap();

    assert_eq!(*file.writes.lock().unwrap(), vec![pid]);
    let records = wal.records().unwrap();
    assert_eq!(records.len(), 2);
    match &records[0] {
        WalRecord::Update {
            tx_id,
            page_id,
            before,
            after,
        } => {
            assert_eq!(*tx_id, tid);
            assert_eq!(*page_id, pid);
            assert_eq!(before[2000], 0);
            assert_eq!(after[2000], 0x11);
        }
        other => panic!("expected update first, got {other:?}"),
    }
    assert_eq!(records[1], WalRecord::Commit { tx_id: tid });
}

#[test]
fn abort_writes_nothing() {
    let (_dir, file, wal, pool) = setup_logged();

    let pid = PageId::new(common::TABLE, 0);
    file.inner.write_page(&Page::new(pid)).unwrap();

    let tid = TransactionId::new();
    let page = pool.get_page(tid, pid, LockMode::Exclusive).unwrap();
    {
        let mut guard = page.write();
        guard.data[100] = 0x22;
        guard.mark_dirty(tid);
    }
    pool.transaction_complete(tid, false).unwrap();

    assert!(file.writes.lock().unwrap().is_empty());
    assert_eq!(wal.records().unwrap(), vec![WalRecord::Abort { tx_id: tid }]);
}

#[test]
fn before_image_tracks_the_last_commit() {
    let (_dir, file, wal, pool) = setup_logged();

    let pid = PageId::new(common::TABLE, 0);
    file.inner.write_page(&Page::new(pid)).unwrap();

    // first transaction commits 0x33
    let t1 = TransactionId::new();
    let page = pool.get_page(t1, pid, LockMode::Exclusive).unwrap();
    {
        let mut guard = page.write();
        guard.data[500] = 0x33;
        guard.mark_dirty(t1);
    }
    pool.transaction_complete(t1, true).unwrap();

    // second transaction commits 0x44; its undo image must show 0x33
    let t2 = TransactionId::new();
    let page = pool.get_page(t2, pid, LockMode::Exclusive).unwrap();
    {
        let mut guard = page.write();
        guard.data[500] = 0x44;
        guard.mark_dirty(t2);
    }
    pool.transaction_complete(t2, true).unwrap();

    let updates: Vec<(u8, u8)> = wal
        .records()
        .unwrap()
        .into_iter()
        .filter_map(|r| match r {
            WalRecord::Update { before, after, .. } => Some((before[500], after[500])),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![(0, 0x33), (0x33, 0x44)]);
}
