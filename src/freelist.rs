//! Free page management and recycling
//!
//! The freelist tracks every page id that can be reused instead of
//! growing the file. Pages freed by a writer stay *pending* under that
//! writer's txid until no read transaction can still observe them, then
//! move to the free set. The whole inventory (free plus pending) is
//! serialized into freelist pages at each commit so a crash between the
//! data fsync and the meta fsync cannot leak pages.

use crate::error::{Error, PageId, Result, TxId};
use crate::page::{self, PageFlags, PageRef, FREELIST_COUNT_OVERFLOW, PAGE_HEADER_SIZE};
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Free page inventory
pub(crate) struct Freelist {
    /// Committed-free page ids, sorted ascending
    ids: Vec<PageId>,
    /// Pages freed per writer txid, not yet reusable
    pending: BTreeMap<TxId, Vec<PageId>>,
    /// Contiguous runs handed out per txid, for rollback
    allocs: HashMap<PageId, (TxId, usize)>,
    /// Membership index over `ids` and `pending`
    cache: HashSet<PageId>,
}

impl Freelist {
    pub(crate) fn new() -> Self {
        Self {
            ids: Vec::new(),
            pending: BTreeMap::new(),
            allocs: HashMap::new(),
            cache: HashSet::new(),
        }
    }

    /// Number of committed-free pages.
    pub(crate) fn free_count(&self) -> usize {
        self.ids.len()
    }

    /// Number of pages pending release.
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Total inventory size.
    pub(crate) fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Whether `pgid` is anywhere in the inventory.
    pub(crate) fn freed(&self, pgid: PageId) -> bool {
        self.cache.contains(&pgid)
    }

    /// All inventory ids (free and pending), sorted.
    pub(crate) fn copyall(&self) -> Vec<PageId> {
        let mut all = self.ids.clone();
        for pages in self.pending.values() {
            all.extend_from_slice(pages);
        }
        all.sort_unstable();
        all
    }

    /// Find a contiguous run of `n` free pages, preferring the
    /// lowest-addressed run. Returns `None` when the caller must extend
    /// the file instead.
    pub(crate) fn allocate(&mut self, txid: TxId, n: usize) -> Option<PageId> {
        debug_assert!(n > 0);
        let mut found = None;
        let mut initial: u64 = 0;
        let mut previd: u64 = 0;
        for (i, id) in self.ids.iter().enumerate() {
            debug_assert!(id.0 > 1, "invalid free page {}", id);
            if previd == 0 || id.0 - previd != 1 {
                initial = id.0;
            }
            if id.0 - initial + 1 == n as u64 {
                found = Some((i, initial));
                break;
            }
            previd = id.0;
        }
        let (end, initial) = found?;
        self.ids.drain(end + 1 - n..=end);
        for p in initial..initial + n as u64 {
            self.cache.remove(&PageId(p));
        }
        self.allocs.insert(PageId(initial), (txid, n));
        Some(PageId(initial))
    }

    /// Move a logical page (first id plus its overflow tail) into the
    /// pending set of the releasing writer.
    pub(crate) fn free(&mut self, txid: TxId, start: PageId, overflow: usize) -> Result<()> {
        if start.0 <= 1 {
            return Err(Error::corruption(
                format!("cannot free meta page {}", start),
                Some(start),
            ));
        }
        let entry = self.pending.entry(txid).or_default();
        for id in start.0..=start.0 + overflow as u64 {
            let pgid = PageId(id);
            if !self.cache.insert(pgid) {
                return Err(Error::corruption(format!("page {} already freed", pgid), Some(pgid)));
            }
            entry.push(pgid);
        }
        Ok(())
    }

    /// Move every pending entry with txid strictly below `before` into
    /// the free set.
    pub(crate) fn release(&mut self, before: TxId) {
        let keep = self.pending.split_off(&before);
        let released = std::mem::replace(&mut self.pending, keep);
        let mut n = 0;
        for (_, pages) in released {
            n += pages.len();
            self.ids.extend(pages);
        }
        if n > 0 {
            self.ids.sort_unstable();
            debug!("freelist released {} pages below txid {}", n, before);
        }
    }

    /// Forget state belonging to a failed writer: its pending frees
    /// never happened, and its allocations return to the free set.
    pub(crate) fn rollback(&mut self, txid: TxId) {
        if let Some(pages) = self.pending.remove(&txid) {
            for pgid in pages {
                self.cache.remove(&pgid);
            }
        }
        let mut restored = Vec::new();
        self.allocs.retain(|start, (owner, n)| {
            if *owner == txid {
                for i in 0..*n as u64 {
                    restored.push(PageId(start.0 + i));
                }
                false
            } else {
                true
            }
        });
        if !restored.is_empty() {
            for pgid in &restored {
                self.cache.insert(*pgid);
            }
            self.ids.extend(restored);
            self.ids.sort_unstable();
        }
    }

    /// Drop allocation bookkeeping for a committed writer.
    pub(crate) fn commit(&mut self, txid: TxId) {
        self.allocs.retain(|_, (owner, _)| *owner != txid);
    }

    /// Bytes required to serialize the inventory.
    pub(crate) fn size(&self) -> usize {
        let n = self.count();
        let header_ids = if n >= FREELIST_COUNT_OVERFLOW as usize { 1 } else { 0 };
        PAGE_HEADER_SIZE + (n + header_ids) * 8
    }

    /// Serialize into a freelist page buffer whose header id and
    /// overflow were set at allocation.
    pub(crate) fn write(&self, buf: &mut [u8]) {
        let id = PageId(page::read_u64(buf, 0));
        let overflow = page::read_u32(buf, 12);
        let all = self.copyall();
        let (count_field, mut offset) = if all.len() >= FREELIST_COUNT_OVERFLOW as usize {
            page::write_u64(buf, PAGE_HEADER_SIZE, all.len() as u64);
            (FREELIST_COUNT_OVERFLOW, PAGE_HEADER_SIZE + 8)
        } else {
            (all.len() as u16, PAGE_HEADER_SIZE)
        };
        page::write_page_header(buf, id, PageFlags::FREELIST, count_field, overflow);
        for pgid in all {
            page::write_u64(buf, offset, pgid.0);
            offset += 8;
        }
    }

    /// Load the inventory from a freelist page. Pending state is not
    /// persisted: after a crash every inventoried page is simply free.
    pub(crate) fn read(&mut self, page: &PageRef<'_>) {
        let mut ids = page.freelist_ids();
        ids.sort_unstable();
        self.cache = ids.iter().copied().collect();
        self.ids = ids;
        self.pending.clear();
        self.allocs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_and_release() {
        let mut fl = Freelist::new();
        fl.free(TxId(8), PageId(10), 0).unwrap();
        fl.free(TxId(8), PageId(12), 1).unwrap();
        fl.free(TxId(9), PageId(20), 0).unwrap();
        assert_eq!(fl.pending_count(), 4);
        assert_eq!(fl.free_count(), 0);
        assert!(fl.freed(PageId(13)));

        // Only txids strictly below the floor release.
        fl.release(TxId(9));
        assert_eq!(fl.free_count(), 3);
        assert_eq!(fl.pending_count(), 1);

        fl.release(TxId(10));
        assert_eq!(fl.free_count(), 4);
        assert_eq!(fl.pending_count(), 0);
    }

    #[test]
    fn test_double_free_detected() {
        let mut fl = Freelist::new();
        fl.free(TxId(3), PageId(5), 0).unwrap();
        assert!(fl.free(TxId(3), PageId(5), 0).is_err());
        assert!(fl.free(TxId(4), PageId(5), 0).is_err());
    }

    #[test]
    fn test_allocate_contiguous_lowest_first() {
        let mut fl = Freelist::new();
        for id in [3u64, 4, 5, 6, 7, 9, 12, 13, 18] {
            fl.free(TxId(1), PageId(id), 0).unwrap();
        }
        fl.release(TxId(2));

        // 3-page run: lowest is 3..5.
        assert_eq!(fl.allocate(TxId(5), 3), Some(PageId(3)));
        assert!(!fl.freed(PageId(4)));
        // Next 2-page run is 6..7.
        assert_eq!(fl.allocate(TxId(5), 2), Some(PageId(6)));
        // No 3-page run remains.
        assert_eq!(fl.allocate(TxId(5), 3), None);
        assert_eq!(fl.allocate(TxId(5), 1), Some(PageId(9)));
        // 12,13 still form a pair.
        assert_eq!(fl.allocate(TxId(5), 2), Some(PageId(12)));
        assert_eq!(fl.free_count(), 1);
    }

    #[test]
    fn test_rollback_restores_state() {
        let mut fl = Freelist::new();
        for id in [3u64, 4, 5] {
            fl.free(TxId(1), PageId(id), 0).unwrap();
        }
        fl.release(TxId(2));

        let got = fl.allocate(TxId(7), 2).unwrap();
        assert_eq!(got, PageId(3));
        fl.free(TxId(7), PageId(30), 0).unwrap();
        assert_eq!(fl.free_count(), 1);

        fl.rollback(TxId(7));
        // The allocation is back and the pending free is forgotten.
        assert_eq!(fl.free_count(), 3);
        assert_eq!(fl.pending_count(), 0);
        assert!(!fl.freed(PageId(30)));
        assert_eq!(fl.allocate(TxId(8), 3), Some(PageId(3)));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut fl = Freelist::new();
        for id in [9u64, 3, 12] {
            fl.free(TxId(1), PageId(id), 0).unwrap();
        }
        fl.free(TxId(2), PageId(40), 1).unwrap();

        let mut buf = vec![0u8; 4096];
        page::write_page_header(&mut buf, PageId(2), PageFlags::FREELIST, 0, 0);
        fl.write(&mut buf);

        let mut loaded = Freelist::new();
        loaded.read(&PageRef::new(&buf));
        // Pending merges into free on reload.
        assert_eq!(loaded.free_count(), 5);
        assert_eq!(loaded.pending_count(), 0);
        assert_eq!(loaded.copyall(), vec![PageId(3), PageId(9), PageId(12), PageId(40), PageId(41)]);
    }

    #[test]
    fn test_write_read_roundtrip_spilled_count() {
        // 0x10000 ids cannot fit the u16 count field: the header holds
        // the sentinel and the first u64 carries the real count.
        let mut fl = Freelist::new();
        fl.free(TxId(1), PageId(2), 0xFFFF).unwrap();

        let mut buf = vec![0u8; fl.size()];
        page::write_page_header(&mut buf, PageId(3), PageFlags::FREELIST, 0, 0);
        fl.write(&mut buf);
        assert_eq!(page::read_u16(&buf, 10), FREELIST_COUNT_OVERFLOW);
        assert_eq!(page::read_u64(&buf, PAGE_HEADER_SIZE), 0x10000);

        let mut loaded = Freelist::new();
        loaded.read(&PageRef::new(&buf));
        assert_eq!(loaded.free_count(), 0x10000);
        assert_eq!(loaded.pending_count(), 0);
        assert!(loaded.freed(PageId(2)));
        assert!(loaded.freed(PageId(0x10001)));
        assert!(!loaded.freed(PageId(0x10002)));
    }

    #[test]
    fn test_size_accounts_for_overflow_count() {
        let fl = Freelist::new();
        assert_eq!(fl.size(), PAGE_HEADER_SIZE);

        let mut fl = Freelist::new();
        fl.free(TxId(1), PageId(2), 0xFFFF).unwrap();
        // 0x10000 ids need the spilled count slot.
        assert_eq!(fl.size(), PAGE_HEADER_SIZE + 8 + 0x10000 * 8);
    }
}
