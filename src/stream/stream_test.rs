use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::*;
use crate::association::AssociationState;
use crate::error::Result;

fn make_stream(max_payload_size: u32) -> (Arc<Stream>, mpsc::Receiver<()>) {
    let (awake_tx, awake_rx) = mpsc::channel(1);
    let s = Arc::new(Stream::new(
        "stream:test".to_owned(),
        7,
        max_payload_size,
        Arc::new(AtomicU32::new(65536)),
        Arc::new(AtomicU8::new(AssociationState::Established as u8)),
        Arc::new(awake_tx),
        Arc::new(PendingQueue::new()),
        false,
    ));
    (s, awake_rx)
}

#[tokio::test]
async fn test_write_queues_single_chunk() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);
    s.set_default_payload_type(PayloadProtocolIdentifier::Binary);

    let n = s.write(&Bytes::from_static(b"a small message")).await?;
    assert_eq!(n, 15);
    assert_eq!(s.buffered_amount(), 15);
    assert_eq!(s.pending_queue.len(), 1);

    let c = s.pending_queue.pop(true, false).await.expect("one chunk");
    assert!(c.beginning_fragment);
    assert!(c.ending_fragment);
    assert!(!c.unordered);
    assert_eq!(c.stream_identifier, 7);
    assert_eq!(c.payload_type, PayloadProtocolIdentifier::Binary);
    assert_eq!(&c.user_data[..], b"a small message");
    Ok(())
}

#[tokio::test]
async fn test_write_fragments_large_message() -> Result<()> {
    let (s, _awake_rx) = make_stream(4);

    s.write_sctp(
        &Bytes::from_static(b"0123456789"),
        PayloadProtocolIdentifier::Binary,
    )
    .await?;

    assert_eq!(s.pending_queue.len(), 3);

    let c1 = s.pending_queue.pop(true, false).await.unwrap();
    let c2 = s.pending_queue.pop(false, false).await.unwrap();
    let c3 = s.pending_queue.pop(false, false).await.unwrap();

    assert!(c1.beginning_fragment && !c1.ending_fragment);
    assert!(!c2.beginning_fragment && !c2.ending_fragment);
    assert!(!c3.beginning_fragment && c3.ending_fragment);

    // All fragments carry the same SSN and re-concatenate to the message.
    assert_eq!(c1.stream_sequence_number, c2.stream_sequence_number);
    assert_eq!(c2.stream_sequence_number, c3.stream_sequence_number);
    let mut whole = Vec::new();
    whole.extend_from_slice(&c1.user_data);
    whole.extend_from_slice(&c2.user_data);
    whole.extend_from_slice(&c3.user_data);
    assert_eq!(whole, b"0123456789");
    Ok(())
}

#[tokio::test]
async fn test_ordered_writes_advance_ssn() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);

    s.write(&Bytes::from_static(b"one")).await?;
    s.write(&Bytes::from_static(b"two")).await?;

    let c1 = s.pending_queue.pop(true, false).await.unwrap();
    let c2 = s.pending_queue.pop(true, false).await.unwrap();
    assert_eq!(c1.stream_sequence_number, 0);
    assert_eq!(c2.stream_sequence_number, 1);
    Ok(())
}

#[tokio::test]
async fn test_unordered_writes_do_not_advance_ssn() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);
    s.set_reliability_params(true, ReliabilityType::Reliable, 0);

    s.write(&Bytes::from_static(b"one")).await?;
    s.write(&Bytes::from_static(b"two")).await?;

    let c1 = s.pending_queue.pop(true, true).await.unwrap();
    let c2 = s.pending_queue.pop(true, true).await.unwrap();
    assert!(c1.unordered);
    assert_eq!(c1.stream_sequence_number, 0);
    assert_eq!(c2.stream_sequence_number, 0);
    Ok(())
}

#[tokio::test]
async fn test_dcep_is_always_ordered() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);
    s.set_reliability_params(true, ReliabilityType::Rexmit, 1);

    s.write_sctp(&Bytes::from_static(b"dcep"), PayloadProtocolIdentifier::Dcep)
        .await?;

    let c = s.pending_queue.pop(true, false).await.unwrap();
    assert!(!c.unordered, "DCEP must be sent ordered");
    Ok(())
}

#[tokio::test]
async fn test_write_too_large_message() {
    let (s, _awake_rx) = make_stream(1200);
    s.max_message_size.store(8, Ordering::SeqCst);

    let result = s.write(&Bytes::from_static(b"way too large")).await;
    assert_eq!(result, Err(Error::ErrOutboundPacketTooLarge));
}

#[tokio::test]
async fn test_write_fails_when_not_established() {
    let (s, _awake_rx) = make_stream(1200);
    s.state
        .store(AssociationState::ShutdownSent as u8, Ordering::SeqCst);

    let result = s.write(&Bytes::from_static(b"nope")).await;
    assert_eq!(result, Err(Error::ErrStreamClosed));
}

#[tokio::test]
async fn test_handle_data_then_read() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);

    s.handle_data(ChunkPayloadData {
        stream_identifier: 7,
        beginning_fragment: true,
        ending_fragment: true,
        tsn: 1,
        payload_type: PayloadProtocolIdentifier::String,
        user_data: Bytes::from_static(b"hello"),
        ..Default::default()
    })
    .await;

    let mut buf = [0u8; 32];
    let (n, ppi) = s.read_sctp(&mut buf).await?;
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(ppi, PayloadProtocolIdentifier::String);
    Ok(())
}

#[tokio::test]
async fn test_read_returns_zero_after_shutdown() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);
    s.read_shutdown.store(true, Ordering::SeqCst);

    let mut buf = [0u8; 8];
    let (n, ppi) = s.read_sctp(&mut buf).await?;
    assert_eq!(n, 0);
    assert_eq!(ppi, PayloadProtocolIdentifier::Unknown);
    Ok(())
}

#[tokio::test]
async fn test_buffered_amount_low_callback() -> Result<()> {
    let (s, _awake_rx) = make_stream(1200);
    s.set_buffered_amount_low_threshold(4);

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        s.on_buffered_amount_low(Box::new(move || {
            let fired = Arc::clone(&fired);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }) as Pin<Box<dyn Future<Output = ()> + Send + 'static>>
        }));
    }

    s.write(&Bytes::from_static(b"0123456789")).await?;
    assert_eq!(s.buffered_amount(), 10);

    // Still above the threshold: no callback.
    s.on_buffer_released(2).await;
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // Crossing the threshold fires exactly once.
    s.on_buffer_released(5).await;
    assert_eq!(s.buffered_amount(), 3);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // Below the threshold already: no second call.
    s.on_buffer_released(1).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    Ok(())
}
