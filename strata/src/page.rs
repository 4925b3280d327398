use crate::transaction::TransactionId;
use crate::{PageId, PAGE_SIZE};

/// An in-memory copy of one on-disk page.
///
/// Besides the raw bytes, a page carries the identity of the transaction
/// that last modified it (if any) and a before-image: a snapshot of the
/// bytes as of the last moment the page was known clean. The before-image
/// is the undo half of the WAL record written when the page is flushed; it
/// is captured at load time and refreshed only when a commit flushes the
/// page back to its file.
#[derive(Clone)]
pub struct Page {
    id: PageId,
    pub data: [u8; PAGE_SIZE],
    before_image: [u8; PAGE_SIZE],
    dirty_by: Option<TransactionId>,
}

impl Page {
    /// A fresh zeroed page, as handed out for pages past the end of a file.
    pub fn new(id: PageId) -> Self {
        Self {
            id,
            data: [0; PAGE_SIZE],
            before_image: [0; PAGE_SIZE],
            dirty_by: None,
        }
    }

    /// A page loaded from disk; the bytes double as the before-image.
    pub fn from_bytes(id: PageId, data: [u8; PAGE_SIZE]) -> Self {
        Self {
            id,
            data,
            before_image: data,
            dirty_by: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    /// Records `tid` as the transaction responsible for the page's current
    /// contents. Modifiers call this after editing `data` in place.
    pub fn mark_dirty(&mut self, tid: TransactionId) {
        self.dirty_by = Some(tid);
    }

    /// Clears the dirtier after the page has been written through.
    pub fn mark_clean(&mut self) {
        self.dirty_by = None;
    }

    /// The transaction that dirtied this page, or `None` if it is clean.
    pub fn dirtied_by(&self) -> Option<TransactionId> {
        self.dirty_by
    }

    pub fn before_image(&self) -> &[u8] {
        &self.before_image
    }

    /// Re-snapshots the current contents as the before-image. Called once
    /// the page is clean again, at commit time.
    pub fn set_before_image(&mut self) {
        self.before_image.copy_from_slice(&self.data);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("dirty_by", &self.dirty_by)
            .finish_non_exhaustive()
    }
}
