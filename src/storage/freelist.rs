//! Free page tracking.
//!
//! The freelist holds two populations of page ids: `available`, pages that
//! may be handed out immediately, and `pending`, pages released by a
//! committed writer but possibly still referenced by an open reader's
//! snapshot. A pending page moves to `available` only once every reader
//! that could observe it has closed (`release`).
//!
//! `available` is kept sorted descending. That makes contiguous ascending
//! runs show up as adjacent entries with step −1, so first-fit over the
//! slice finds the lowest-starting run of a given length and allocation
//! stays a single scan.

use hashbrown::HashMap;

use super::{PageId, PageView, TxId};

#[derive(Debug, Default)]
pub(crate) struct Freelist {
    /// Free page ids, sorted descending.
    available: Vec<PageId>,
    /// Pages freed per writer transaction, awaiting reader drain.
    pending: HashMap<TxId, Vec<PageId>>,
}

impl Freelist {
    pub fn new() -> Freelist {
        Freelist::default()
    }

    /// Returns the starting id of a run of `n` contiguous pages, or 0 if
    /// no such run exists. The returned pages are removed from the list.
    pub fn allocate(&mut self, n: usize) -> PageId {
        if n == 0 || n > self.available.len() {
            return 0;
        }
        for start in 0..=self.available.len() - n {
            let run = &self.available[start..start + n];
            // Descending order: contiguity means each id is its
            // predecessor minus one.
            if run.windows(2).all(|w| w[0] == w[1] + 1) {
                let id = run[n - 1];
                assert!(id > 1, "freelist: allocated meta page {}", id);
                self.available.drain(start..start + n);
                return id;
            }
        }
        0
    }

    /// Queues `id..=id + overflow` for release under the given writer
    /// transaction id.
    pub fn free(&mut self, txid: TxId, id: PageId, overflow: u32) {
        assert!(id > 1, "freelist: freeing meta page {}", id);
        let pending = self.pending.entry(txid).or_default();
        pending.extend(id..=id + overflow as PageId);
    }

    /// Moves every page pending under a transaction id `<= txid` into the
    /// available list.
    pub fn release(&mut self, txid: TxId) {
        let drained: Vec<TxId> = self
            .pending
            .keys()
            .copied()
            .filter(|t| *t <= txid)
            .collect();
        for t in drained {
            if let Some(ids) = self.pending.remove(&t) {
                self.available.extend(ids);
            }
        }
        self.available.sort_unstable_by(|a, b| b.cmp(a));
    }

    /// Discards pages pending under exactly this transaction id. Used when
    /// a write transaction rolls back or its commit fails: the pages it
    /// freed are still live in the last committed version.
    pub fn rollback(&mut self, txid: TxId) {
        self.pending.remove(&txid);
    }

    /// Initializes the available list from an on-disk freelist page. The
    /// on-disk form is sorted descending by convention, but re-sort anyway
    /// so a foreign writer cannot break the contiguity scan.
    pub fn read(&mut self, view: &PageView<'_>) {
        let count = view.count();
        let body = view.body();
        self.available = (0..count)
            .map(|i| {
                let off = i * size_of::<PageId>();
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&body[off..off + 8]);
                PageId::from_le_bytes(raw)
            })
            .collect();
        self.available.sort_unstable_by(|a, b| b.cmp(a));
    }

    #[cfg(test)]
    fn with_available(ids: &[PageId]) -> Freelist {
        Freelist {
            available: ids.to_vec(),
            pending: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn available(&self) -> &[PageId] {
        &self.available
    }
}
