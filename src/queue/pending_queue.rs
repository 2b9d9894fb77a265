use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::chunk::chunk_payload_data::ChunkPayloadData;

pub(crate) type PendingBaseQueue = VecDeque<ChunkPayloadData>;

/// Unsent DATA chunks, split into ordered and unordered FIFOs. Submission
/// order is preserved within each FIFO, and once the first fragment of a
/// message has been popped the same FIFO stays selected until its ending
/// fragment leaves, so fragments of one message are never interleaved with
/// another message's.
///
/// Shared between the association (pop side, under the association lock)
/// and streams (push side, without it), hence the internal locking.
#[derive(Debug, Default)]
pub(crate) struct PendingQueue {
    unordered_queue: Mutex<PendingBaseQueue>,
    ordered_queue: Mutex<PendingBaseQueue>,
    queue_len: AtomicUsize,
    n_bytes: AtomicUsize,
    selected: AtomicBool,
    unordered_is_selected: AtomicBool,
    drained: Notify,
}

impl PendingQueue {
    pub(crate) fn new() -> Self {
        PendingQueue::default()
    }

    pub(crate) async fn push(&self, c: ChunkPayloadData) {
        let user_data_len = c.user_data.len();

        if c.unordered {
            self.unordered_queue.lock().await.push_back(c);
        } else {
            self.ordered_queue.lock().await.push_back(c);
        }

        self.n_bytes.fetch_add(user_data_len, Ordering::SeqCst);
        self.queue_len.fetch_add(1, Ordering::SeqCst);
    }

    /// Appends a whole fragment run at once so no other writer can slip a
    /// chunk between two fragments of the same message.
    ///
    /// # Panics
    ///
    /// If the chunks mix ordered and unordered.
    pub(crate) async fn append(&self, chunks: Vec<ChunkPayloadData>) {
        if chunks.is_empty() {
            return;
        }

        let total_user_data_len = chunks.iter().fold(0, |acc, c| acc + c.user_data.len());
        let chunks_len = chunks.len();

        let unordered = chunks[0].unordered;
        if unordered {
            let mut unordered_queue = self.unordered_queue.lock().await;
            for c in chunks {
                assert!(c.unordered, "expected all chunks to be unordered");
                unordered_queue.push_back(c);
            }
        } else {
            let mut ordered_queue = self.ordered_queue.lock().await;
            for c in chunks {
                assert!(!c.unordered, "expected all chunks to be ordered");
                ordered_queue.push_back(c);
            }
        }

        self.n_bytes
            .fetch_add(total_user_data_len, Ordering::SeqCst);
        self.queue_len.fetch_add(chunks_len, Ordering::SeqCst);
    }

    pub(crate) async fn peek(&self) -> Option<ChunkPayloadData> {
        if self.selected.load(Ordering::SeqCst) {
            return if self.unordered_is_selected.load(Ordering::SeqCst) {
                self.unordered_queue.lock().await.front().cloned()
            } else {
                self.ordered_queue.lock().await.front().cloned()
            };
        }

        // Unordered chunks are given priority.
        let c = self.unordered_queue.lock().await.front().cloned();
        if c.is_some() {
            return c;
        }
        self.ordered_queue.lock().await.front().cloned()
    }

    pub(crate) async fn pop(
        &self,
        beginning_fragment: bool,
        unordered: bool,
    ) -> Option<ChunkPayloadData> {
        let popped = if self.selected.load(Ordering::SeqCst) {
            let popped = if self.unordered_is_selected.load(Ordering::SeqCst) {
                self.unordered_queue.lock().await.pop_front()
            } else {
                self.ordered_queue.lock().await.pop_front()
            };
            if let Some(p) = &popped {
                if p.ending_fragment {
                    self.selected.store(false, Ordering::SeqCst);
                }
            }
            popped
        } else {
            if !beginning_fragment {
                return None;
            }
            let popped = if unordered {
                self.unordered_queue.lock().await.pop_front()
            } else {
                self.ordered_queue.lock().await.pop_front()
            };
            if let Some(p) = &popped {
                if !p.ending_fragment {
                    self.selected.store(true, Ordering::SeqCst);
                    self.unordered_is_selected
                        .store(unordered, Ordering::SeqCst);
                }
            }
            popped
        };

        if let Some(p) = &popped {
            self.n_bytes.fetch_sub(p.user_data.len(), Ordering::SeqCst);
            if self.queue_len.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.drained.notify_waiters();
            }
        }

        popped
    }

    /// Resolves once the queue has been emptied by the write loop. Used by
    /// blocking writes to wait for the previous batch.
    pub(crate) async fn wait_until_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
