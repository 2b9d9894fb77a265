use std::io;
use std::net::SocketAddr;

use super::*;

type UtilResult<T> = std::result::Result<T, util::Error>;

struct DumbConn;

#[async_trait]
impl Conn for DumbConn {
    async fn connect(&self, _addr: SocketAddr) -> UtilResult<()> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    async fn recv(&self, _b: &mut [u8]) -> UtilResult<usize> {
        Ok(0)
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> UtilResult<(usize, SocketAddr)> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    async fn send(&self, _b: &[u8]) -> UtilResult<usize> {
        Ok(0)
    }

    async fn send_to(&self, _buf: &[u8], _target: SocketAddr) -> UtilResult<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "Not applicable").into())
    }

    async fn local_addr(&self) -> UtilResult<SocketAddr> {
        Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "Addr Not Available").into())
    }

    async fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn close(&self) -> UtilResult<()> {
        Ok(())
    }
}

/// Keeps the receiving halves alive for the duration of a test so channel
/// sends inside the association do not fail.
struct TestReceivers {
    accept_rx: mpsc::Receiver<Arc<Stream>>,
    handshake_rx: mpsc::Receiver<Option<Error>>,
    awake_rx: mpsc::Receiver<()>,
}

fn create_association_internal(config: Config) -> (AssociationInternal, TestReceivers) {
    let (close_loop_ch_tx, _close_loop_ch_rx) = broadcast::channel(1);
    let (accept_ch_tx, accept_rx) = mpsc::channel(16);
    let (handshake_completed_ch_tx, handshake_rx) = mpsc::channel(1);
    let (awake_write_loop_ch_tx, awake_rx) = mpsc::channel(1);
    let a = AssociationInternal::new(
        config,
        close_loop_ch_tx,
        accept_ch_tx,
        handshake_completed_ch_tx,
        Arc::new(awake_write_loop_ch_tx),
    );
    (
        a,
        TestReceivers {
            accept_rx,
            handshake_rx,
            awake_rx,
        },
    )
}

fn default_config() -> Config {
    Config::new(Arc::new(DumbConn {}), "test".to_owned())
}

fn inflight_chunk(tsn: u32, si: u16, ssn: u16, data: &'static [u8]) -> ChunkPayloadData {
    ChunkPayloadData {
        beginning_fragment: true,
        ending_fragment: true,
        tsn,
        stream_identifier: si,
        stream_sequence_number: ssn,
        user_data: Bytes::from_static(data),
        nsent: 1,
        all_inflight: Arc::new(AtomicBool::new(true)),
        ..Default::default()
    }
}

///////////////////////////////////////////////////////////////////
// construction
///////////////////////////////////////////////////////////////////

#[test]
fn test_initial_cwnd_and_ack_points() {
    let (a, _rx) = create_association_internal(default_config());

    assert_eq!(
        a.cwnd(),
        std::cmp::min(4 * a.mtu, std::cmp::max(2 * a.mtu, 4380)),
        "initial cwnd should follow RFC 4960 sec 7.2.1"
    );
    assert_eq!(a.cumulative_tsn_ack_point, a.my_next_tsn.wrapping_sub(1));
    assert_eq!(a.advanced_peer_tsn_ack_point, a.cumulative_tsn_ack_point);
    assert_ne!(a.my_verification_tag, 0, "verification tag should be set");
}

#[test]
fn test_min_cwnd_floor_is_enforced() {
    let mut config = default_config();
    config.min_cwnd = 9999;
    let (a, _rx) = create_association_internal(config);

    a.set_cwnd(1);
    assert_eq!(a.cwnd(), 9999, "cwnd must be clamped at min_cwnd");
}

///////////////////////////////////////////////////////////////////
// forward TSN generation
///////////////////////////////////////////////////////////////////

#[test]
fn test_create_forward_tsn_with_one_abandoned() {
    let mut a = AssociationInternal {
        cumulative_tsn_ack_point: 9,
        advanced_peer_tsn_ack_point: 10,
        ..Default::default()
    };

    let mut c = inflight_chunk(10, 1, 2, b"ABC");
    c.abandoned = Arc::new(AtomicBool::new(true));
    a.inflight_queue.push_no_check(c);

    let fwdtsn = a.create_forward_tsn();

    assert_eq!(fwdtsn.new_cumulative_tsn, 10);
    assert_eq!(fwdtsn.streams.len(), 1);
    assert_eq!(fwdtsn.streams[0].identifier, 1);
    assert_eq!(fwdtsn.streams[0].sequence, 2);
}

#[test]
fn test_create_forward_tsn_reports_highest_ssn_per_stream() {
    let mut a = AssociationInternal {
        cumulative_tsn_ack_point: 9,
        advanced_peer_tsn_ack_point: 12,
        ..Default::default()
    };

    for (tsn, si, ssn) in [(10u32, 1u16, 4u16), (11, 1, 5), (12, 2, 1)] {
        let mut c = inflight_chunk(tsn, si, ssn, b"QWE");
        c.abandoned = Arc::new(AtomicBool::new(true));
        a.inflight_queue.push_no_check(c);
    }

    let fwdtsn = a.create_forward_tsn();

    assert_eq!(fwdtsn.new_cumulative_tsn, 12);
    assert_eq!(fwdtsn.streams.len(), 2);
    for s in &fwdtsn.streams {
        match s.identifier {
            1 => assert_eq!(s.sequence, 5, "stream 1 should report its highest SSN"),
            2 => assert_eq!(s.sequence, 1),
            _ => panic!("unexpected stream id {}", s.identifier),
        }
    }
}

///////////////////////////////////////////////////////////////////
// SACK processing
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_sack_older_than_ack_point_is_dropped() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.cumulative_tsn_ack_point = 100;
    a.my_next_tsn = 101;

    let sack = ChunkSelectiveAck {
        cumulative_tsn_ack: 90,
        advertised_receiver_window_credit: 100_000,
        ..Default::default()
    };

    let cwnd_before = a.cwnd();
    a.handle_sack(&sack).await?;

    assert_eq!(a.cumulative_tsn_ack_point, 100, "ack point must not move");
    assert_eq!(a.cwnd(), cwnd_before, "cwnd must not change");
    Ok(())
}

#[tokio::test]
async fn test_sack_cumulative_advance_pops_inflight() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.cumulative_tsn_ack_point = 9;
    a.my_next_tsn = 12;
    a.min_tsn2measure_rtt = 12;

    a.inflight_queue.push_no_check(inflight_chunk(10, 0, 0, b"ABC"));
    a.inflight_queue.push_no_check(inflight_chunk(11, 0, 1, b"DEF"));

    let sack = ChunkSelectiveAck {
        cumulative_tsn_ack: 11,
        advertised_receiver_window_credit: 100_000,
        ..Default::default()
    };
    a.handle_sack(&sack).await?;

    assert_eq!(a.cumulative_tsn_ack_point, 11);
    assert!(a.inflight_queue.is_empty());
    assert_eq!(a.rwnd(), 100_000);
    Ok(())
}

#[tokio::test]
async fn test_three_gap_reports_enter_fast_recovery() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.cumulative_tsn_ack_point = 9;
    a.my_next_tsn = 14;
    a.min_tsn2measure_rtt = 14;

    for tsn in 10u32..=13 {
        a.inflight_queue
            .push_no_check(inflight_chunk(tsn, 0, 0, b"12345678"));
    }

    let old_cwnd = a.cwnd();

    // TSN 10 never arrives; the gap report grows as 11, 12, 13 land, so
    // every SACK newly acks one TSN and bumps the miss count of 10.
    for gap_end in 2u16..=4 {
        let sack = ChunkSelectiveAck {
            cumulative_tsn_ack: 9,
            advertised_receiver_window_credit: 100_000,
            gap_ack_blocks: vec![crate::chunk::chunk_selective_ack::GapAckBlock {
                start: 2,
                end: gap_end,
            }],
            ..Default::default()
        };
        a.handle_sack(&sack).await?;
    }

    assert!(a.in_fast_recovery, "should be in fast recovery");
    assert_eq!(
        a.ssthresh,
        std::cmp::max(old_cwnd / 2, 4 * a.mtu),
        "ssthresh should collapse per RFC 4960 sec 7.2.3"
    );
    assert_eq!(a.cwnd(), a.ssthresh, "cwnd should equal ssthresh");
    assert_eq!(a.fast_recover_exit_point, 13, "exit at the highest acked");
    assert!(a.will_retransmit_fast);
    assert_eq!(
        a.inflight_queue.get(10).unwrap().miss_indicator,
        3,
        "miss indicator saturates at 3"
    );
    Ok(())
}

#[tokio::test]
async fn test_fast_retransmit_gather_resends_lowest_eligible() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.cumulative_tsn_ack_point = 9;
    a.my_next_tsn = 12;

    let mut lost = inflight_chunk(10, 0, 0, b"lost");
    lost.miss_indicator = 3;
    a.inflight_queue.push_no_check(lost);

    let mut acked = inflight_chunk(11, 0, 1, b"fine");
    acked.acked = true;
    a.inflight_queue.push_no_check(acked);

    a.will_retransmit_fast = true;
    let packets = a.gather_outbound_fast_retransmission_packets(vec![]);

    assert_eq!(packets.len(), 1, "one bundled fast-retransmit packet");
    assert_eq!(packets[0].chunks.len(), 1);
    assert_eq!(a.inflight_queue.get(10).unwrap().nsent, 2);
    assert_eq!(a.inflight_queue.get(11).unwrap().nsent, 1);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// T3-rtx expiry
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_t3_expiry_collapses_cwnd() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.cumulative_tsn_ack_point = 9;
    a.my_next_tsn = 12;

    a.inflight_queue.push_no_check(inflight_chunk(10, 0, 0, b"abc"));
    a.inflight_queue.push_no_check(inflight_chunk(11, 0, 1, b"def"));

    let old_cwnd = a.cwnd();
    a.on_retransmission_timeout(RtxTimerId::T3RTX, 1).await;

    assert_eq!(a.cwnd(), a.mtu, "cwnd collapses to one MTU");
    assert_eq!(a.ssthresh, std::cmp::max(old_cwnd / 2, 4 * a.mtu));
    assert!(a.inflight_queue.get(10).unwrap().retransmit);
    assert!(a.inflight_queue.get(11).unwrap().retransmit);
    assert_eq!(a.stats.get_num_t3timeouts(), 1);
    Ok(())
}

#[tokio::test]
async fn test_t3_expiry_retransmit_selection_clears_flag() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.cumulative_tsn_ack_point = 9;
    a.my_next_tsn = 11;
    a.set_rwnd(100_000);

    a.inflight_queue.push_no_check(inflight_chunk(10, 0, 0, b"xyz"));
    a.on_retransmission_timeout(RtxTimerId::T3RTX, 1).await;

    let packets = a.get_data_packets_to_retransmit();
    assert_eq!(packets.len(), 1);
    let c = a.inflight_queue.get(10).unwrap();
    assert!(!c.retransmit, "flag cleared after selection");
    assert_eq!(c.nsent, 2);

    // A second pass has nothing marked and sends nothing.
    assert!(a.get_data_packets_to_retransmit().is_empty());
    Ok(())
}

///////////////////////////////////////////////////////////////////
// data reception
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_handle_data_accepts_and_acks() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.peer_last_tsn = 9;

    let reply = a
        .handle_data(&ChunkPayloadData {
            tsn: 10,
            stream_identifier: 3,
            beginning_fragment: true,
            ending_fragment: true,
            user_data: Bytes::from_static(b"hi"),
            ..Default::default()
        })
        .await?;

    assert!(reply.is_empty());
    assert_eq!(a.peer_last_tsn, 10, "cumulative point advances");
    assert!(a.delayed_ack_triggered, "in-order data arms the ack timer");
    assert!(!a.immediate_ack_triggered);
    assert!(a.streams.contains_key(&3), "stream created on demand");

    let sack = a.create_selective_ack_chunk().await;
    assert_eq!(sack.cumulative_tsn_ack, 10);
    assert!(sack.gap_ack_blocks.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_handle_data_gap_triggers_immediate_ack() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.peer_last_tsn = 9;

    // TSN 11 arrives while 10 is missing.
    a.handle_data(&ChunkPayloadData {
        tsn: 11,
        stream_identifier: 3,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::from_static(b"hi"),
        ..Default::default()
    })
    .await?;

    assert_eq!(a.peer_last_tsn, 9, "cumulative point must not move");
    assert!(a.immediate_ack_triggered, "a gap demands an immediate SACK");

    let sack = a.create_selective_ack_chunk().await;
    assert_eq!(sack.cumulative_tsn_ack, 9);
    assert_eq!(sack.gap_ack_blocks.len(), 1);
    assert_eq!(sack.gap_ack_blocks[0].start, 2);
    assert_eq!(sack.gap_ack_blocks[0].end, 2);
    Ok(())
}

#[tokio::test]
async fn test_handle_data_duplicate_is_reported() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.peer_last_tsn = 9;

    let d = ChunkPayloadData {
        tsn: 10,
        stream_identifier: 3,
        beginning_fragment: true,
        ending_fragment: true,
        user_data: Bytes::from_static(b"hi"),
        ..Default::default()
    };
    a.handle_data(&d).await?;
    a.handle_data(&d).await?;

    let sack = a.create_selective_ack_chunk().await;
    assert_eq!(sack.duplicate_tsn, vec![10]);
    Ok(())
}

///////////////////////////////////////////////////////////////////
// stream reconfiguration
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_reset_request_performed_when_caught_up() {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.peer_last_tsn = 30;
    let _ = a.open_stream(5, PayloadProtocolIdentifier::Binary);
    assert!(a.streams.contains_key(&5));

    let req = ParamOutgoingResetRequest {
        reconfig_request_sequence_number: 7,
        sender_last_tsn: 30,
        stream_identifiers: vec![5],
        ..Default::default()
    };
    let reply = a.reset_streams_if_any(&req);

    let reconfig = reply.chunks[0]
        .as_any()
        .downcast_ref::<ChunkReconfig>()
        .expect("reply should be a RECONFIG");
    let resp = reconfig
        .param_a
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<ParamReconfigResponse>()
        .expect("param A should be a response");
    assert_eq!(resp.reconfig_response_sequence_number, 7);
    assert_eq!(resp.result, ReconfigResult::SuccessPerformed);
    assert!(!a.streams.contains_key(&5), "stream must be torn down");
}

#[tokio::test]
async fn test_reset_request_deferred_until_caught_up() {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);
    a.peer_last_tsn = 10;
    let _ = a.open_stream(5, PayloadProtocolIdentifier::Binary);

    a.reconfig_requests.insert(
        7,
        ParamOutgoingResetRequest {
            reconfig_request_sequence_number: 7,
            sender_last_tsn: 12,
            stream_identifiers: vec![5],
            ..Default::default()
        },
    );

    let req = a.reconfig_requests.get(&7).cloned().unwrap();
    let reply = a.reset_streams_if_any(&req);

    let reconfig = reply.chunks[0]
        .as_any()
        .downcast_ref::<ChunkReconfig>()
        .unwrap();
    let resp = reconfig
        .param_a
        .as_ref()
        .unwrap()
        .as_any()
        .downcast_ref::<ParamReconfigResponse>()
        .unwrap();
    assert_eq!(resp.result, ReconfigResult::InProgress);
    assert!(a.streams.contains_key(&5), "stream must stay until caught up");
    assert!(
        a.reconfig_requests.contains_key(&7),
        "request stays deferred"
    );
}

#[tokio::test]
async fn test_too_many_reconfig_requests_are_rejected() {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);

    for rsn in 0..MAX_RECONFIG_REQUESTS as u32 {
        a.reconfig_requests.insert(
            rsn,
            ParamOutgoingResetRequest {
                reconfig_request_sequence_number: rsn,
                sender_last_tsn: u32::MAX, // keeps them all deferred
                stream_identifiers: vec![1],
                ..Default::default()
            },
        );
    }

    let one_more: Box<dyn Param + Send + Sync> = Box::new(ParamOutgoingResetRequest {
        reconfig_request_sequence_number: MAX_RECONFIG_REQUESTS as u32 + 1,
        sender_last_tsn: u32::MAX,
        stream_identifiers: vec![1],
        ..Default::default()
    });
    let result = a.handle_reconfig_param(&one_more).await;
    assert_eq!(result, Err(Error::ErrTooManyReconfigRequests));
}

///////////////////////////////////////////////////////////////////
// handshake details
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_handle_init_builds_init_ack_with_cookie() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());

    let mut init = ChunkInit {
        initiate_tag: 1234,
        advertised_receiver_window_credit: 100_000,
        num_outbound_streams: 10,
        num_inbound_streams: 10,
        initial_tsn: 5678,
        ..Default::default()
    };
    init.set_supported_extensions();

    let p = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0,
        chunks: vec![],
    };
    let reply = a.handle_init(&p, &init).await?;

    assert_eq!(a.peer_verification_tag, 1234);
    assert_eq!(a.peer_last_tsn, 5677);
    assert!(a.use_forward_tsn);

    assert_eq!(reply.len(), 1);
    let init_ack = reply[0].chunks[0]
        .as_any()
        .downcast_ref::<ChunkInit>()
        .expect("reply should be INIT-ACK");
    assert!(init_ack.is_ack);
    let has_cookie = init_ack
        .params
        .iter()
        .any(|p| p.as_any().downcast_ref::<ParamStateCookie>().is_some());
    assert!(has_cookie, "INIT-ACK must carry a state cookie");
    Ok(())
}

#[tokio::test]
async fn test_handle_init_rejected_in_established() {
    let (mut a, _rx) = create_association_internal(default_config());
    a.set_state(AssociationState::Established);

    let init = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 1500,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 1,
        ..Default::default()
    };
    let p = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0,
        chunks: vec![],
    };
    let result = a.handle_init(&p, &init).await;
    assert_eq!(result.err(), Some(Error::ErrHandleInitState));
}

#[tokio::test]
async fn test_zero_checksum_negotiated_on_init() -> Result<()> {
    let mut config = default_config();
    config.enable_zero_checksum = true;
    let (mut a, _rx) = create_association_internal(config);

    let mut init = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 100_000,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 1,
        ..Default::default()
    };
    init.set_zero_checksum_acceptable();

    let p = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0,
        chunks: vec![],
    };
    let reply = a.handle_init(&p, &init).await?;

    assert!(a.send_zero_checksum.load(Ordering::SeqCst));
    let init_ack = reply[0].chunks[0]
        .as_any()
        .downcast_ref::<ChunkInit>()
        .unwrap();
    let advertises = init_ack.params.iter().any(|p| {
        p.as_any()
            .downcast_ref::<ParamZeroChecksumAcceptable>()
            .is_some()
    });
    assert!(advertises, "INIT-ACK must advertise zero checksum back");
    Ok(())
}

#[tokio::test]
async fn test_zero_checksum_not_sent_when_disabled_locally() -> Result<()> {
    let (mut a, _rx) = create_association_internal(default_config());

    let mut init = ChunkInit {
        initiate_tag: 1,
        advertised_receiver_window_credit: 100_000,
        num_outbound_streams: 1,
        num_inbound_streams: 1,
        initial_tsn: 1,
        ..Default::default()
    };
    init.set_zero_checksum_acceptable();

    let p = Packet {
        source_port: 5000,
        destination_port: 5000,
        verification_tag: 0,
        chunks: vec![],
    };
    a.handle_init(&p, &init).await?;

    assert!(!a.send_zero_checksum.load(Ordering::SeqCst));
    Ok(())
}

///////////////////////////////////////////////////////////////////
// misc
///////////////////////////////////////////////////////////////////

#[tokio::test]
async fn test_open_stream_twice_fails() {
    let (mut a, _rx) = create_association_internal(default_config());
    assert!(a.open_stream(1, PayloadProtocolIdentifier::Binary).is_ok());
    assert_eq!(
        a.open_stream(1, PayloadProtocolIdentifier::Binary).err(),
        Some(Error::ErrStreamAlreadyExist)
    );
}

#[tokio::test]
async fn test_buffered_amount_counts_pending_and_inflight() {
    let (mut a, _rx) = create_association_internal(default_config());
    assert_eq!(a.buffered_amount(), 0);
    a.inflight_queue.push_no_check(inflight_chunk(1, 0, 0, b"12345"));
    assert_eq!(a.buffered_amount(), 5);
}
