use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use bytes::Bytes;

use super::inflight_queue::InflightQueue;
use super::pending_queue::PendingQueue;
use super::reassembly_queue::ReassemblyQueue;
use super::receive_queue::{get_max_tsn_offset, ReceiveQueue};
use crate::chunk::chunk_payload_data::{ChunkPayloadData, PayloadProtocolIdentifier};
use crate::error::{Error, Result};

fn make_data_chunk(tsn: u32, user_data: &'static [u8]) -> ChunkPayloadData {
    ChunkPayloadData {
        tsn,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::from_static(user_data),
        ..Default::default()
    }
}

///////////////////////////////////////////////////////////////////
// inflight_queue
///////////////////////////////////////////////////////////////////

mod test_inflight_queue {
    use super::*;

    #[test]
    fn test_push_and_pop_in_order() {
        let mut q = InflightQueue::new(Arc::new(AtomicUsize::new(0)));
        assert!(q.is_empty());

        q.push_no_check(make_data_chunk(10, b"aaa"));
        q.push_no_check(make_data_chunk(11, b"bb"));
        q.push_no_check(make_data_chunk(12, b"c"));

        assert_eq!(q.len(), 3);
        assert_eq!(q.get_num_bytes(), 6);

        // Only the head TSN pops.
        assert!(q.pop(11).is_none());
        let c = q.pop(10).expect("head should pop");
        assert_eq!(c.tsn, 10);
        assert_eq!(q.get_num_bytes(), 3);

        assert!(q.pop(11).is_some());
        assert!(q.pop(12).is_some());
        assert!(q.is_empty());
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[test]
    fn test_out_of_order_insert_keeps_tsn_order() {
        let mut q = InflightQueue::new(Arc::new(AtomicUsize::new(0)));
        q.push_no_check(make_data_chunk(12, b"c"));
        q.push_no_check(make_data_chunk(10, b"a"));
        q.push_no_check(make_data_chunk(11, b"b"));

        assert!(q.pop(10).is_some());
        assert!(q.pop(11).is_some());
        assert!(q.pop(12).is_some());
    }

    #[test]
    fn test_mark_as_acked_releases_bytes() {
        let mut q = InflightQueue::new(Arc::new(AtomicUsize::new(0)));
        q.push_no_check(make_data_chunk(1, b"hello"));
        q.push_no_check(make_data_chunk(2, b"world"));
        assert_eq!(q.get_num_bytes(), 10);

        let released = q.mark_as_acked(1);
        assert_eq!(released, 5);
        assert_eq!(q.get_num_bytes(), 5);
        assert!(q.get(1).unwrap().acked);
        assert!(q.get(1).unwrap().user_data.is_empty());

        // Acked entries stay in the queue for gap accounting.
        assert_eq!(q.len(), 2);

        // Marking again releases nothing... the chunk map entry is kept.
        assert_eq!(q.mark_as_acked(1), 0);
        assert_eq!(q.mark_as_acked(99), 0);
    }

    #[test]
    fn test_mark_all_to_retransmit_skips_acked_chunks() {
        let mut q = InflightQueue::new(Arc::new(AtomicUsize::new(0)));
        q.push_no_check(make_data_chunk(1, b"a"));
        q.push_no_check(make_data_chunk(2, b"b"));
        q.mark_as_acked(2);

        q.mark_all_to_retransmit();
        assert!(q.get(1).unwrap().retransmit);
        assert!(!q.get(2).unwrap().retransmit);
    }

    #[test]
    fn test_shared_length_counter() {
        let length = Arc::new(AtomicUsize::new(0));
        let mut q = InflightQueue::new(Arc::clone(&length));
        q.push_no_check(make_data_chunk(1, b"a"));
        q.push_no_check(make_data_chunk(2, b"b"));
        assert_eq!(length.load(std::sync::atomic::Ordering::SeqCst), 2);
        q.pop(1);
        assert_eq!(length.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

///////////////////////////////////////////////////////////////////
// receive_queue
///////////////////////////////////////////////////////////////////

mod test_receive_queue {
    use super::*;

    #[test]
    fn test_max_tsn_offset_bounds() {
        assert_eq!(get_max_tsn_offset(0), 2000);
        assert_eq!(get_max_tsn_offset(1024 * 1024), 8388);
        assert_eq!(get_max_tsn_offset(u32::MAX / 8), 40000);
    }

    #[test]
    fn test_push_and_duplicate_tracking() {
        let mut q = ReceiveQueue::new(2000);
        let cumulative = 9;

        assert!(q.can_push(10, cumulative));
        assert!(q.push(10, cumulative));

        // Same TSN again: duplicate.
        assert!(!q.can_push(10, cumulative));
        assert!(!q.push(10, cumulative));

        // At or below the cumulative point: duplicate too.
        assert!(!q.push(9, cumulative));

        let dups = q.pop_duplicates();
        assert_eq!(dups, vec![10, 9]);
        assert!(q.pop_duplicates().is_empty());
    }

    #[test]
    fn test_admission_window() {
        let mut q = ReceiveQueue::new(2000);
        let cumulative = 100;

        assert!(q.can_push(101, cumulative));
        assert!(q.can_push(2099, cumulative));
        // At the window edge and beyond: rejected, and not a duplicate.
        assert!(!q.can_push(2100, cumulative));
        assert!(!q.push(2100, cumulative));
        assert!(q.pop_duplicates().is_empty());
    }

    #[test]
    fn test_pop_advances_only_at_front() {
        let mut q = ReceiveQueue::new(2000);
        q.push(10, 9);
        q.push(12, 9);

        assert!(q.pop(10));
        assert!(!q.pop(11), "missing TSN should not pop");
        assert!(q.pop(12));
        assert!(q.is_empty());
    }

    #[test]
    fn test_gap_ack_blocks() {
        let mut q = ReceiveQueue::new(2000);
        let cumulative = 9;
        for tsn in [10u32, 11, 12, 14, 15, 20] {
            q.push(tsn, cumulative);
        }

        let blocks = q.get_gap_ack_blocks(cumulative);
        assert_eq!(blocks.len(), 3);
        assert_eq!((blocks[0].start, blocks[0].end), (1, 3));
        assert_eq!((blocks[1].start, blocks[1].end), (5, 6));
        assert_eq!((blocks[2].start, blocks[2].end), (11, 11));

        assert_eq!(q.last_tsn_received(), Some(&20));
    }

    #[test]
    fn test_gap_ack_blocks_after_wraparound() {
        let mut q = ReceiveQueue::new(2000);
        let cumulative = u32::MAX - 1;
        q.push(u32::MAX, cumulative);
        q.push(1, cumulative); // wraps over 0
        q.push(2, cumulative);

        let blocks = q.get_gap_ack_blocks(cumulative);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[0].start, blocks[0].end), (1, 1));
        assert_eq!((blocks[1].start, blocks[1].end), (3, 4));
    }
}

///////////////////////////////////////////////////////////////////
// pending_queue
///////////////////////////////////////////////////////////////////

mod test_pending_queue {
    use super::*;

    fn make_fragments(
        unordered: bool,
        payloads: &[&'static [u8]],
    ) -> Vec<ChunkPayloadData> {
        let n = payloads.len();
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| ChunkPayloadData {
                unordered,
                beginning_fragment: i == 0,
                ending_fragment: i == n - 1,
                user_data: Bytes::from_static(p),
                ..Default::default()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_push_and_pop() {
        let q = PendingQueue::new();
        assert!(q.is_empty());

        for c in make_fragments(false, &[b"ABC", b"DEFG"]) {
            q.push(c).await;
        }
        assert_eq!(q.len(), 2);
        assert_eq!(q.get_num_bytes(), 7);

        let head = q.peek().await.expect("peek should see the first fragment");
        assert!(head.beginning_fragment);

        let c = q.pop(true, false).await.expect("first fragment pops");
        assert_eq!(&c.user_data[..], b"ABC");
        let c = q.pop(false, false).await.expect("selected run continues");
        assert_eq!(&c.user_data[..], b"DEFG");
        assert!(q.is_empty());
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[tokio::test]
    async fn test_fragment_run_stays_selected() {
        let q = PendingQueue::new();
        // A two-fragment ordered message, then an unordered one.
        for c in make_fragments(false, &[b"one", b"two"]) {
            q.push(c).await;
        }
        for c in make_fragments(true, &[b"late"]) {
            q.push(c).await;
        }

        // Once the ordered run is open, the unordered queue must wait even
        // though it normally has priority.
        let c = q.pop(true, false).await.unwrap();
        assert!(!c.unordered);
        let c = q.pop(false, false).await.unwrap();
        assert!(!c.unordered);
        assert!(c.ending_fragment);

        let c = q.pop(true, true).await.unwrap();
        assert!(c.unordered);
    }

    #[tokio::test]
    async fn test_unordered_has_priority() {
        let q = PendingQueue::new();
        q.append(make_fragments(false, &[b"ordered"])).await;
        q.append(make_fragments(true, &[b"unordered"])).await;

        let head = q.peek().await.unwrap();
        assert!(head.unordered, "unordered chunks go first");
    }

    #[tokio::test]
    async fn test_wait_until_drained() {
        let q = Arc::new(PendingQueue::new());
        q.append(make_fragments(false, &[b"x"])).await;

        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move {
                q.wait_until_drained().await;
            })
        };

        tokio::task::yield_now().await;
        let _ = q.pop(true, false).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released when the queue drains")
            .unwrap();
    }
}

///////////////////////////////////////////////////////////////////
// reassembly_queue
///////////////////////////////////////////////////////////////////

mod test_reassembly_queue {
    use super::*;

    #[test]
    fn test_ordered_single_chunk() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        let complete = q.push(ChunkPayloadData {
            stream_identifier: 0,
            beginning_fragment: true,
            ending_fragment: true,
            tsn: 1,
            stream_sequence_number: 0,
            payload_type: PayloadProtocolIdentifier::String,
            user_data: Bytes::from_static(b"hello"),
            ..Default::default()
        });
        assert!(complete);
        assert!(q.is_readable());
        assert_eq!(q.get_num_bytes(), 5);

        let mut buf = [0u8; 16];
        let (n, ppi) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(ppi, PayloadProtocolIdentifier::String);
        assert_eq!(q.get_num_bytes(), 0);
        Ok(())
    }

    #[test]
    fn test_ordered_fragmented_message() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        assert!(!q.push(ChunkPayloadData {
            beginning_fragment: true,
            tsn: 1,
            user_data: Bytes::from_static(b"frag1 "),
            ..Default::default()
        }));
        assert!(q.push(ChunkPayloadData {
            ending_fragment: true,
            tsn: 2,
            user_data: Bytes::from_static(b"frag2"),
            ..Default::default()
        }));

        let mut buf = [0u8; 16];
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"frag1 frag2");
        Ok(())
    }

    #[test]
    fn test_ordered_delivery_respects_ssn() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        // SSN 1 arrives before SSN 0; nothing is readable yet.
        q.push(ChunkPayloadData {
            beginning_fragment: true,
            ending_fragment: true,
            tsn: 2,
            stream_sequence_number: 1,
            user_data: Bytes::from_static(b"second"),
            ..Default::default()
        });
        assert!(!q.is_readable());

        let mut buf = [0u8; 16];
        assert_eq!(q.read(&mut buf), Err(Error::ErrTryAgain));

        q.push(ChunkPayloadData {
            beginning_fragment: true,
            ending_fragment: true,
            tsn: 1,
            stream_sequence_number: 0,
            user_data: Bytes::from_static(b"first"),
            ..Default::default()
        });
        assert!(q.is_readable());

        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"first");
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"second");
        Ok(())
    }

    #[test]
    fn test_unordered_delivery_by_tsn_contiguity() -> Result<()> {
        let mut q = ReassemblyQueue::new(0);

        q.push(ChunkPayloadData {
            unordered: true,
            ending_fragment: true,
            tsn: 11,
            user_data: Bytes::from_static(b"B"),
            ..Default::default()
        });
        assert!(!q.is_readable());

        let complete = q.push(ChunkPayloadData {
            unordered: true,
            beginning_fragment: true,
            tsn: 10,
            user_data: Bytes::from_static(b"A"),
            ..Default::default()
        });
        assert!(complete);
        assert!(q.is_readable());

        let mut buf = [0u8; 4];
        let (n, _) = q.read(&mut buf)?;
        assert_eq!(&buf[..n], b"AB");
        Ok(())
    }

    #[test]
    fn test_read_short_buffer() {
        let mut q = ReassemblyQueue::new(0);
        q.push(ChunkPayloadData {
            beginning_fragment: true,
            ending_fragment: true,
            tsn: 1,
            user_data: Bytes::from_static(b"0123456789"),
            ..Default::default()
        });

        let mut buf = [0u8; 4];
        assert_eq!(q.read(&mut buf), Err(Error::ErrShortBuffer { size: 4 }));
        // The message is consumed either way.
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[test]
    fn test_forward_tsn_for_ordered_drops_incomplete_sets() {
        let mut q = ReassemblyQueue::new(0);

        // SSN 0: incomplete (missing its end fragment).
        q.push(ChunkPayloadData {
            beginning_fragment: true,
            tsn: 1,
            stream_sequence_number: 0,
            user_data: Bytes::from_static(b"zzz"),
            ..Default::default()
        });
        // SSN 1: complete.
        q.push(ChunkPayloadData {
            beginning_fragment: true,
            ending_fragment: true,
            tsn: 3,
            stream_sequence_number: 1,
            user_data: Bytes::from_static(b"keep"),
            ..Default::default()
        });

        q.forward_tsn_for_ordered(0);

        assert!(q.is_readable(), "the complete set at SSN 1 must survive");
        let mut buf = [0u8; 8];
        let (n, _) = q.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"keep");
    }

    #[test]
    fn test_forward_tsn_for_unordered_drops_stale_fragments() {
        let mut q = ReassemblyQueue::new(0);

        q.push(ChunkPayloadData {
            unordered: true,
            beginning_fragment: true,
            tsn: 10,
            user_data: Bytes::from_static(b"stale"),
            ..Default::default()
        });
        q.push(ChunkPayloadData {
            unordered: true,
            beginning_fragment: true,
            tsn: 13,
            user_data: Bytes::from_static(b"newer"),
            ..Default::default()
        });

        q.forward_tsn_for_unordered(11);
        assert_eq!(q.get_num_bytes(), 5, "only the newer fragment remains");
    }
}
