use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::util::*;

/// Sent-but-not-retired DATA chunks, keyed by TSN and iterable in TSN
/// order. The occupied window is `(cumulative ack point, next TSN)`, with
/// holes where chunks were cumulatively acked or popped.
///
/// `n_bytes` counts the user data of chunks not yet acked; an acked chunk
/// stops contributing the moment `mark_as_acked` runs.
#[derive(Default, Debug)]
pub(crate) struct InflightQueue {
    /// shared with the public API so `Association` can see the queue drain
    /// without taking the big lock
    length: Arc<AtomicUsize>,
    chunks: HashMap<u32, ChunkPayloadData>,
    sorted: VecDeque<u32>,
    n_bytes: usize,
}

fn compare_tsn(a: u32, b: u32) -> std::cmp::Ordering {
    if sna32lt(a, b) {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

impl InflightQueue {
    pub(crate) fn new(length: Arc<AtomicUsize>) -> Self {
        length.store(0, Ordering::SeqCst);
        InflightQueue {
            length,
            ..Default::default()
        }
    }

    /// Inserts keeping `sorted` in serial-number order. The fast paths
    /// cover the common cases of appending fresh TSNs.
    pub(crate) fn push_no_check(&mut self, p: ChunkPayloadData) {
        let tsn = p.tsn;
        self.n_bytes += p.user_data.len();
        self.chunks.insert(tsn, p);
        self.length.fetch_add(1, Ordering::SeqCst);

        if self.sorted.is_empty() || sna32gt(tsn, *self.sorted.back().unwrap()) {
            self.sorted.push_back(tsn);
        } else if sna32lt(tsn, *self.sorted.front().unwrap()) {
            self.sorted.push_front(tsn);
        } else {
            let pos = match self.sorted.binary_search_by(|e| compare_tsn(*e, tsn)) {
                Ok(pos) => pos,
                Err(pos) => pos,
            };
            self.sorted.insert(pos, tsn);
        }
    }

    /// Removes and returns the chunk at the head of the window, but only if
    /// its TSN matches. Cumulative-ack processing walks the window one TSN
    /// at a time.
    pub(crate) fn pop(&mut self, tsn: u32) -> Option<ChunkPayloadData> {
        if self.sorted.front() == Some(&tsn) {
            self.sorted.pop_front();
            if let Some(c) = self.chunks.remove(&tsn) {
                self.length.fetch_sub(1, Ordering::SeqCst);
                self.n_bytes -= c.user_data.len();
                return Some(c);
            }
        }

        None
    }

    pub(crate) fn get(&self, tsn: u32) -> Option<&ChunkPayloadData> {
        self.chunks.get(&tsn)
    }

    pub(crate) fn get_mut(&mut self, tsn: u32) -> Option<&mut ChunkPayloadData> {
        self.chunks.get_mut(&tsn)
    }

    /// Marks the TSN as acked and returns how many payload bytes that
    /// released. The payload is dropped right away; only the bookkeeping
    /// shell stays for gap accounting.
    pub(crate) fn mark_as_acked(&mut self, tsn: u32) -> usize {
        if let Some(c) = self.chunks.get_mut(&tsn) {
            c.acked = true;
            c.retransmit = false;
            let n = c.user_data.len();
            self.n_bytes -= n;
            c.user_data.clear();
            n
        } else {
            0
        }
    }

    pub(crate) fn mark_all_to_retransmit(&mut self) {
        for c in self.chunks.values_mut() {
            if c.acked || c.abandoned() {
                continue;
            }
            c.retransmit = true;
        }
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.chunks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
