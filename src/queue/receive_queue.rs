use std::collections::VecDeque;

use crate::chunk::chunk_selective_ack::GapAckBlock;
use crate::util::*;

/// Average DATA chunk size assumed when sizing the TSN admission window.
const AVG_CHUNK_SIZE: u32 = 500;
const MIN_TSN_OFFSET: u32 = 2000;
const MAX_TSN_OFFSET: u32 = 40000;

/// How far above the cumulative ack point a TSN may be and still be
/// admitted. Bounds the TSN set even when a hostile peer sprays arbitrary
/// sequence numbers.
pub(crate) fn get_max_tsn_offset(max_receive_buffer_size: u32) -> u32 {
    (max_receive_buffer_size * 4 / AVG_CHUNK_SIZE).clamp(MIN_TSN_OFFSET, MAX_TSN_OFFSET)
}

/// The set of TSNs received ahead of the peer's cumulative point, plus the
/// duplicates seen since the last SACK. Payloads are not held here; they go
/// straight to the owning stream's reassembly queue.
#[derive(Default, Debug)]
pub(crate) struct ReceiveQueue {
    tsns: VecDeque<u32>,
    dup_tsn: Vec<u32>,
    max_tsn_offset: u32,
}

fn compare_tsn(a: u32, b: u32) -> std::cmp::Ordering {
    if sna32lt(a, b) {
        std::cmp::Ordering::Less
    } else {
        std::cmp::Ordering::Greater
    }
}

impl ReceiveQueue {
    pub(crate) fn new(max_tsn_offset: u32) -> Self {
        ReceiveQueue {
            max_tsn_offset,
            ..Default::default()
        }
    }

    fn contains(&self, tsn: u32) -> bool {
        self.tsns
            .binary_search_by(|e| {
                if *e == tsn {
                    std::cmp::Ordering::Equal
                } else {
                    compare_tsn(*e, tsn)
                }
            })
            .is_ok()
    }

    fn in_window(&self, tsn: u32, cumulative_tsn: u32) -> bool {
        sna32gt(tsn, cumulative_tsn)
            && sna32lt(tsn, cumulative_tsn.wrapping_add(self.max_tsn_offset))
    }

    /// True when the TSN is neither a duplicate nor outside the admission
    /// window.
    pub(crate) fn can_push(&self, tsn: u32, cumulative_tsn: u32) -> bool {
        self.in_window(tsn, cumulative_tsn) && !self.contains(tsn)
    }

    /// Records the TSN. A duplicate (already present, or at/below the
    /// cumulative point) goes to the duplicate list instead and yields
    /// false; a TSN beyond the window is dropped silently.
    pub(crate) fn push(&mut self, tsn: u32, cumulative_tsn: u32) -> bool {
        if sna32lte(tsn, cumulative_tsn) || self.contains(tsn) {
            self.dup_tsn.push(tsn);
            return false;
        }
        if !self.in_window(tsn, cumulative_tsn) {
            return false;
        }

        if self.tsns.is_empty() || sna32gt(tsn, *self.tsns.back().unwrap()) {
            self.tsns.push_back(tsn);
        } else if sna32lt(tsn, *self.tsns.front().unwrap()) {
            self.tsns.push_front(tsn);
        } else {
            let pos = match self.tsns.binary_search_by(|e| compare_tsn(*e, tsn)) {
                Ok(pos) => pos,
                Err(pos) => pos,
            };
            self.tsns.insert(pos, tsn);
        }
        true
    }

    /// Removes the given TSN if it sits at the front of the set. Returns
    /// whether it was present; callers performing a forced advance (forward
    /// TSN) ignore the result.
    pub(crate) fn pop(&mut self, tsn: u32) -> bool {
        if self.tsns.front() == Some(&tsn) {
            self.tsns.pop_front();
            true
        } else {
            false
        }
    }

    pub(crate) fn pop_duplicates(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.dup_tsn)
    }

    pub(crate) fn get_gap_ack_blocks(&self, cumulative_tsn: u32) -> Vec<GapAckBlock> {
        if self.tsns.is_empty() {
            return vec![];
        }

        let mut blocks = vec![];
        let mut b = GapAckBlock::default();
        for (i, tsn) in self.tsns.iter().enumerate() {
            let offset = tsn.wrapping_sub(cumulative_tsn) as u16;
            if i == 0 {
                b.start = offset;
                b.end = offset;
            } else if b.end + 1 == offset {
                b.end = offset;
            } else {
                blocks.push(b);
                b.start = offset;
                b.end = offset;
            }
        }
        blocks.push(b);

        blocks
    }

    pub(crate) fn get_gap_ack_blocks_string(&self, cumulative_tsn: u32) -> String {
        let mut s = format!("cumTSN={cumulative_tsn}");
        for b in self.get_gap_ack_blocks(cumulative_tsn) {
            s += format!(",{}-{}", b.start, b.end).as_str();
        }
        s
    }

    pub(crate) fn last_tsn_received(&self) -> Option<&u32> {
        self.tsns.back()
    }

    pub(crate) fn len(&self) -> usize {
        self.tsns.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tsns.is_empty()
    }
}
