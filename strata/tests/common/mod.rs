#![allow(dead_code)]

use std::sync::Arc;
use strata::catalog::Catalog;
use strata::heap::{DbFile, HeapFile};
use strata::wal::WalManager;
use strata::{BufferPool, BufferPoolConfig, Page, PageId, TableId};
use tempfile::{tempdir, TempDir};

pub const TABLE: TableId = 1;

/// A scratch database: one heap table, a WAL and a pool, all rooted in a
/// temp directory that is cleaned up on drop.
pub struct TestDb {
    pub pool: Arc<BufferPool>,
    pub file: Arc<HeapFile>,
    pub wal: Arc<WalManager>,
    pub catalog: Arc<Catalog>,
    _dir: TempDir,
}

pub fn setup(num_pages: usize) -> TestDb {
    let dir = tempdir().unwrap();
    let file = Arc::new(HeapFile::new(dir.path().join("table.db"), TABLE).unwrap());
    let wal = Arc::new(WalManager::open(dir.path().join("table.wal")).unwrap());
    let catalog = Arc::new(Catalog::new());
    catalog.register_table(file.clone());
    let pool = Arc::new(BufferPool::new(
        catalog.clone(),
        wal.clone(),
        BufferPoolConfig { num_pages },
    ));
    TestDb {
        pool,
        file,
        wal,
        catalog,
        _dir: dir,
    }
}

/// Writes a page holding one record straight to the table file, bypassing
/// the pool.
pub fn seed_page(db: &TestDb, page_no: u32, record: &[u8]) -> PageId {
    let pid = PageId::new(TABLE, page_no);
    let mut page = Page::new(pid);
    page.heap_insert(record).unwrap();
    db.file.write_page(&page).unwrap();
    pid
}
