use std::cmp::Ordering;

use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};
use crate::util::*;

fn sort_chunks_by_tsn(c: &mut [ChunkPayloadData]) {
    c.sort_by(|a, b| {
        if sna32lt(a.tsn, b.tsn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

fn sort_chunk_sets_by_ssn(c: &mut [ChunkSet]) {
    c.sort_by(|a, b| {
        if sna16lt(a.ssn, b.ssn) {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    });
}

/// The fragments of one user message: same SSN (for ordered delivery),
/// strictly sequential TSNs from the B-flagged fragment to the E-flagged
/// one.
#[derive(Debug, Clone)]
pub(crate) struct ChunkSet {
    pub(crate) ssn: u16,
    pub(crate) ppi: PayloadProtocolIdentifier,
    pub(crate) chunks: Vec<ChunkPayloadData>,
}

impl ChunkSet {
    pub(crate) fn new(ssn: u16, ppi: PayloadProtocolIdentifier) -> Self {
        ChunkSet {
            ssn,
            ppi,
            chunks: vec![],
        }
    }

    /// Adds the fragment (deduplicating by TSN) and reports whether the set
    /// became complete.
    pub(crate) fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        for c in &self.chunks {
            if c.tsn == chunk.tsn {
                return false;
            }
        }

        self.chunks.push(chunk);
        sort_chunks_by_tsn(&mut self.chunks);

        self.is_complete()
    }

    pub(crate) fn is_complete(&self) -> bool {
        let n = self.chunks.len();
        if n == 0 {
            return false;
        }
        if !self.chunks[0].beginning_fragment {
            return false;
        }
        if !self.chunks[n - 1].ending_fragment {
            return false;
        }

        // Fragment TSNs must be strictly sequential (RFC 4960 sec 3.3.1);
        // a hole means a middle or end fragment is still missing.
        let mut last_tsn = self.chunks[0].tsn;
        for c in self.chunks.iter().skip(1) {
            if c.tsn != last_tsn.wrapping_add(1) {
                return false;
            }
            last_tsn = c.tsn;
        }

        true
    }
}

/// Per-stream reassembly. Ordered fragments collect in SSN-sorted sets and
/// are released in SSN order; unordered fragments are matched purely by TSN
/// contiguity and released as soon as a complete run exists.
#[derive(Default, Debug)]
pub(crate) struct ReassemblyQueue {
    pub(crate) si: u16,
    /// SSN expected by the next ordered read; starts at 0 per RFC 4960
    /// sec 6.5 and wraps at 65535.
    pub(crate) next_ssn: u16,
    pub(crate) ordered: Vec<ChunkSet>,
    pub(crate) unordered: Vec<ChunkSet>,
    pub(crate) unordered_chunks: Vec<ChunkPayloadData>,
    pub(crate) n_bytes: usize,
}

impl ReassemblyQueue {
    pub(crate) fn new(si: u16) -> Self {
        ReassemblyQueue {
            si,
            ..Default::default()
        }
    }

    /// Accepts a fragment and reports whether a complete message became
    /// available.
    pub(crate) fn push(&mut self, chunk: ChunkPayloadData) -> bool {
        if chunk.stream_identifier != self.si {
            return false;
        }

        if chunk.unordered {
            self.n_bytes += chunk.user_data.len();
            self.unordered_chunks.push(chunk);
            sort_chunks_by_tsn(&mut self.unordered_chunks);

            if let Some(cset) = self.extract_complete_unordered_run() {
                self.unordered.push(cset);
                return true;
            }
            return false;
        }

        // Ordered: anything older than the read cursor was already
        // delivered or forwarded past.
        if sna16lt(chunk.stream_sequence_number, self.next_ssn) {
            return false;
        }

        self.n_bytes += chunk.user_data.len();

        for set in &mut self.ordered {
            if set.ssn == chunk.stream_sequence_number {
                return set.push(chunk);
            }
        }

        let mut cset = ChunkSet::new(chunk.stream_sequence_number, chunk.payload_type);
        let complete = cset.push(chunk);
        self.ordered.push(cset);
        sort_chunk_sets_by_ssn(&mut self.ordered);

        complete
    }

    /// Scans the unordered fragment pool for a TSN-contiguous B..E run and
    /// extracts it as a complete set.
    fn extract_complete_unordered_run(&mut self) -> Option<ChunkSet> {
        let mut start_idx: Option<usize> = None;
        let mut n_chunks = 0usize;
        let mut last_tsn = 0u32;
        let mut found = false;

        for (i, c) in self.unordered_chunks.iter().enumerate() {
            if c.beginning_fragment {
                start_idx = Some(i);
                n_chunks = 1;
                last_tsn = c.tsn;
                if c.ending_fragment {
                    found = true;
                    break;
                }
                continue;
            }

            if start_idx.is_none() {
                continue;
            }

            if c.tsn != last_tsn.wrapping_add(1) {
                start_idx = None;
                continue;
            }

            last_tsn = c.tsn;
            n_chunks += 1;
            if c.ending_fragment {
                found = true;
                break;
            }
        }

        if !found {
            return None;
        }

        let start = start_idx.unwrap();
        let chunks: Vec<ChunkPayloadData> = self
            .unordered_chunks
            .drain(start..start + n_chunks)
            .collect();

        let mut cset = ChunkSet::new(0, chunks[0].payload_type);
        cset.chunks = chunks;
        Some(cset)
    }

    pub(crate) fn is_readable(&self) -> bool {
        // Unordered sets are complete by construction.
        if !self.unordered.is_empty() {
            return true;
        }

        if let Some(cset) = self.ordered.first() {
            if cset.is_complete() && sna16lte(cset.ssn, self.next_ssn) {
                return true;
            }
        }
        false
    }

    /// Copies the next complete message into `buf`. `ErrTryAgain` when no
    /// message is ready; `ErrShortBuffer` consumes the message but reports
    /// the caller's buffer was too small.
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<(usize, PayloadProtocolIdentifier)> {
        let cset = if !self.unordered.is_empty() {
            self.unordered.remove(0)
        } else if !self.ordered.is_empty() {
            let cset = &self.ordered[0];
            if !cset.is_complete() {
                return Err(Error::ErrTryAgain);
            }
            if sna16gt(cset.ssn, self.next_ssn) {
                return Err(Error::ErrTryAgain);
            }
            if cset.ssn == self.next_ssn {
                self.next_ssn = self.next_ssn.wrapping_add(1);
            }
            self.ordered.remove(0)
        } else {
            return Err(Error::ErrTryAgain);
        };

        let mut n_written = 0;
        let mut err = None;
        for c in &cset.chunks {
            let to_copy = c.user_data.len();
            self.subtract_num_bytes(to_copy);
            if err.is_none() {
                let n = std::cmp::min(to_copy, buf.len() - n_written);
                buf[n_written..n_written + n].copy_from_slice(&c.user_data[..n]);
                n_written += n;
                if n < to_copy {
                    err = Some(Error::ErrShortBuffer { size: buf.len() });
                }
            }
        }

        match err {
            Some(err) => Err(err),
            None => Ok((n_written, cset.ppi)),
        }
    }

    /// Drops incomplete ordered sets at or below `last_ssn` and advances
    /// the read cursor past them (forward-TSN on an ordered stream).
    pub(crate) fn forward_tsn_for_ordered(&mut self, last_ssn: u16) {
        let dropped_bytes = self
            .ordered
            .iter()
            .filter(|s| sna16lte(s.ssn, last_ssn) && !s.is_complete())
            .fold(0, |n, s| {
                n + s.chunks.iter().fold(0, |acc, c| acc + c.user_data.len())
            });
        self.subtract_num_bytes(dropped_bytes);

        self.ordered
            .retain(|s| !sna16lte(s.ssn, last_ssn) || s.is_complete());

        if sna16lte(self.next_ssn, last_ssn) {
            self.next_ssn = last_ssn.wrapping_add(1);
        }
    }

    /// Drops unordered fragments at or below the new cumulative TSN
    /// (forward-TSN; unordered streams are not listed per stream, so every
    /// stream gets this call).
    pub(crate) fn forward_tsn_for_unordered(&mut self, new_cumulative_tsn: u32) {
        let mut keep_from = 0;
        for (i, c) in self.unordered_chunks.iter().enumerate() {
            if sna32gt(c.tsn, new_cumulative_tsn) {
                break;
            }
            keep_from = i + 1;
        }
        let dropped_bytes = self.unordered_chunks[..keep_from]
            .iter()
            .fold(0, |acc, c| acc + c.user_data.len());
        self.subtract_num_bytes(dropped_bytes);
        self.unordered_chunks.drain(..keep_from);
    }

    fn subtract_num_bytes(&mut self, n_bytes: usize) {
        self.n_bytes = self.n_bytes.saturating_sub(n_bytes);
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }
}
