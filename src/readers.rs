//! Active-reader registry for MVCC
//!
//! Tracks the snapshot txid of every live read transaction so the
//! writer knows which pending pages are safe to recycle: everything
//! freed below the oldest registered snapshot.

use crate::error::TxId;
use parking_lot::Mutex;

pub(crate) struct ReaderTable {
    slots: Mutex<Vec<TxId>>,
}

impl ReaderTable {
    pub(crate) fn new() -> Self {
        Self { slots: Mutex::new(Vec::new()) }
    }

    pub(crate) fn acquire(&self, txid: TxId) {
        self.slots.lock().push(txid);
    }

    /// Release one registration of `txid`. Several readers may share a
    /// snapshot; each releases its own slot.
    pub(crate) fn release(&self, txid: TxId) {
        let mut slots = self.slots.lock();
        if let Some(pos) = slots.iter().position(|t| *t == txid) {
            slots.swap_remove(pos);
        }
    }

    /// Oldest live snapshot, the floor for pending-page release.
    pub(crate) fn oldest(&self) -> Option<TxId> {
        self.slots.lock().iter().min().copied()
    }

    pub(crate) fn count(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_release_oldest() {
        let table = ReaderTable::new();
        assert_eq!(table.oldest(), None);

        table.acquire(TxId(9));
        table.acquire(TxId(4));
        table.acquire(TxId(4));
        assert_eq!(table.oldest(), Some(TxId(4)));
        assert_eq!(table.count(), 3);

        table.release(TxId(4));
        assert_eq!(table.oldest(), Some(TxId(4)));
        table.release(TxId(4));
        assert_eq!(table.oldest(), Some(TxId(9)));
        table.release(TxId(9));
        assert_eq!(table.oldest(), None);
    }
}
