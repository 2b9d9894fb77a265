#[cfg(test)]
mod association_internal_test;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rand::random;
use tokio::sync::{broadcast, mpsc};

use super::association_stats::AssociationStats;
use super::*;
use crate::chunk::chunk_abort::ChunkAbort;
use crate::chunk::chunk_cookie_ack::ChunkCookieAck;
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_error::ChunkError;
use crate::chunk::chunk_forward_tsn::{ChunkForwardTsn, ChunkForwardTsnStream};
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_heartbeat_ack::ChunkHeartbeatAck;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_reconfig::ChunkReconfig;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_shutdown::ChunkShutdown;
use crate::chunk::chunk_shutdown_ack::ChunkShutdownAck;
use crate::chunk::chunk_shutdown_complete::ChunkShutdownComplete;
use crate::chunk::chunk_type::*;
use crate::chunk::Chunk;
use crate::error_cause::*;
use crate::packet::Packet;
use crate::param::param_heartbeat_info::ParamHeartbeatInfo;
use crate::param::param_outgoing_reset_request::ParamOutgoingResetRequest;
use crate::param::param_reconfig_response::{ParamReconfigResponse, ReconfigResult};
use crate::param::param_state_cookie::ParamStateCookie;
use crate::param::param_supported_extensions::ParamSupportedExtensions;
use crate::param::param_type::ParamType;
use crate::param::param_unrecognized::ParamUnrecognized;
use crate::param::param_zero_checksum::ParamZeroChecksumAcceptable;
use crate::param::Param;
use crate::queue::control_queue::ControlQueue;
use crate::queue::inflight_queue::InflightQueue;
use crate::queue::pending_queue::PendingQueue;
use crate::queue::receive_queue::{get_max_tsn_offset, ReceiveQueue};
use crate::stream::{ReliabilityType, Stream};
use crate::timer::ack_timer::{AckTimer, AckTimerObserver};
use crate::timer::rtx_timer::{RtoManager, RtxTimer, RtxTimerId, RtxTimerObserver};
use crate::util::*;

/// Deferred inbound reset requests are capped; a peer that floods more than
/// this many outstanding RSNs gets its requests rejected.
pub(crate) const MAX_RECONFIG_REQUESTS: usize = 1000;

/// The association proper: every piece of protocol state, guarded by one
/// `tokio::sync::Mutex` at the `Association` level. Chunk handlers, the
/// outbound gather path and timer callbacks all run under that lock;
/// anything shared outside it is an atomic.
pub struct AssociationInternal {
    pub(crate) name: String,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) max_message_size: Arc<AtomicU32>,
    pub(crate) inflight_queue_length: Arc<AtomicUsize>,
    pub(crate) will_send_shutdown: Arc<AtomicBool>,
    awake_write_loop_ch: Option<Arc<mpsc::Sender<()>>>,

    peer_verification_tag: u32,
    pub(crate) my_verification_tag: u32,

    pub(crate) my_next_tsn: u32,
    pub(crate) peer_last_tsn: u32,
    /// Enforces at most one RTT sample per round trip (Karn).
    min_tsn2measure_rtt: u32,
    will_send_forward_tsn: bool,
    will_retransmit_fast: bool,
    will_retransmit_reconfig: bool,

    will_send_shutdown_ack: bool,
    will_send_shutdown_complete: bool,
    pub(crate) will_send_abort: Option<String>,

    // Reconfig
    my_next_rsn: u32,
    pub(crate) reconfigs: HashMap<u32, ChunkReconfig>,
    pub(crate) reconfig_requests: HashMap<u32, ParamOutgoingResetRequest>,

    source_port: u16,
    destination_port: u16,
    pub(crate) my_max_num_inbound_streams: u16,
    pub(crate) my_max_num_outbound_streams: u16,
    my_cookie: Option<ParamStateCookie>,
    pub(crate) payload_queue: ReceiveQueue,
    pub(crate) inflight_queue: InflightQueue,
    pub(crate) pending_queue: Arc<PendingQueue>,
    control_queue: ControlQueue,
    pub(crate) mtu: u32,
    /// Largest DATA payload that fits one packet.
    max_payload_size: u32,
    pub(crate) cumulative_tsn_ack_point: u32,
    pub(crate) advanced_peer_tsn_ack_point: u32,
    pub(crate) use_forward_tsn: bool,

    // Congestion control
    pub(crate) max_receive_buffer_size: u32,
    pub(crate) cwnd: Arc<AtomicU32>,
    pub(crate) rwnd: Arc<AtomicU32>,
    pub(crate) srtt: Arc<AtomicU64>,
    min_cwnd: u32,
    fast_rtx_wnd: u32,
    cwnd_ca_step: u32,
    pub(crate) ssthresh: u32,
    partial_bytes_acked: u32,
    pub(crate) in_fast_recovery: bool,
    fast_recover_exit_point: u32,

    // Zero checksum (RFC 9653)
    pub(crate) send_zero_checksum: Arc<AtomicBool>,
    recv_zero_checksum: bool,
    zero_checksum_negotiated: bool,
    toggle_checksum_on_rtx: bool,

    block_write: bool,

    // Timers
    pub(crate) rto_mgr: RtoManager,
    pub(crate) t1init: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t1cookie: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t2shutdown: Option<RtxTimer<AssociationInternal>>,
    pub(crate) t3rtx: Option<RtxTimer<AssociationInternal>>,
    pub(crate) treconfig: Option<RtxTimer<AssociationInternal>>,
    pub(crate) ack_timer: Option<AckTimer<AssociationInternal>>,

    // Handshake chunks kept for retransmission
    pub(crate) stored_init: Option<ChunkInit>,
    pub(crate) stored_cookie_echo: Option<ChunkCookieEcho>,

    streams: HashMap<u16, Arc<Stream>>,

    close_loop_ch_tx: Option<broadcast::Sender<()>>,
    accept_ch_tx: Option<mpsc::Sender<Arc<Stream>>>,
    handshake_completed_ch_tx: Option<mpsc::Sender<Option<Error>>>,

    // Per-inbound-packet ack triggers, reset by handle_chunks_start.
    delayed_ack_triggered: bool,
    immediate_ack_triggered: bool,

    pub(crate) stats: Arc<AssociationStats>,
    ack_state: AckState,
    pub(crate) ack_mode: AckMode, // for testing
    n_t3_expirations: u64,
}

impl Default for AssociationInternal {
    fn default() -> Self {
        AssociationInternal {
            name: String::new(),
            state: Arc::new(AtomicU8::new(AssociationState::Closed as u8)),
            max_message_size: Arc::new(AtomicU32::new(DEFAULT_MAX_MESSAGE_SIZE)),
            inflight_queue_length: Arc::new(AtomicUsize::new(0)),
            will_send_shutdown: Arc::new(AtomicBool::new(false)),
            awake_write_loop_ch: None,
            peer_verification_tag: 0,
            my_verification_tag: 0,
            my_next_tsn: 0,
            peer_last_tsn: 0,
            min_tsn2measure_rtt: 0,
            will_send_forward_tsn: false,
            will_retransmit_fast: false,
            will_retransmit_reconfig: false,
            will_send_shutdown_ack: false,
            will_send_shutdown_complete: false,
            will_send_abort: None,
            my_next_rsn: 0,
            reconfigs: HashMap::new(),
            reconfig_requests: HashMap::new(),
            source_port: 0,
            destination_port: 0,
            my_max_num_inbound_streams: u16::MAX,
            my_max_num_outbound_streams: u16::MAX,
            my_cookie: None,
            payload_queue: ReceiveQueue::new(get_max_tsn_offset(INITIAL_RECV_BUF_SIZE)),
            inflight_queue: InflightQueue::default(),
            pending_queue: Arc::new(PendingQueue::new()),
            control_queue: ControlQueue::new(),
            mtu: INITIAL_MTU,
            max_payload_size: INITIAL_MTU - (COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE),
            cumulative_tsn_ack_point: 0,
            advanced_peer_tsn_ack_point: 0,
            use_forward_tsn: false,
            max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
            cwnd: Arc::new(AtomicU32::new(0)),
            rwnd: Arc::new(AtomicU32::new(0)),
            srtt: Arc::new(AtomicU64::new(0)),
            min_cwnd: 0,
            fast_rtx_wnd: 0,
            cwnd_ca_step: 0,
            ssthresh: 0,
            partial_bytes_acked: 0,
            in_fast_recovery: false,
            fast_recover_exit_point: 0,
            send_zero_checksum: Arc::new(AtomicBool::new(false)),
            recv_zero_checksum: false,
            zero_checksum_negotiated: false,
            toggle_checksum_on_rtx: false,
            block_write: false,
            rto_mgr: RtoManager::default(),
            t1init: None,
            t1cookie: None,
            t2shutdown: None,
            t3rtx: None,
            treconfig: None,
            ack_timer: None,
            stored_init: None,
            stored_cookie_echo: None,
            streams: HashMap::new(),
            close_loop_ch_tx: None,
            accept_ch_tx: None,
            handshake_completed_ch_tx: None,
            delayed_ack_triggered: false,
            immediate_ack_triggered: false,
            stats: Arc::new(AssociationStats::default()),
            ack_state: AckState::default(),
            ack_mode: AckMode::default(),
            n_t3_expirations: 0,
        }
    }
}

impl AssociationInternal {
    pub(crate) fn new(
        config: Config,
        close_loop_ch_tx: broadcast::Sender<()>,
        accept_ch_tx: mpsc::Sender<Arc<Stream>>,
        handshake_completed_ch_tx: mpsc::Sender<Option<Error>>,
        awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    ) -> Self {
        let max_receive_buffer_size = if config.max_receive_buffer_size == 0 {
            INITIAL_RECV_BUF_SIZE
        } else {
            config.max_receive_buffer_size
        };

        let max_message_size = if config.max_message_size == 0 {
            DEFAULT_MAX_MESSAGE_SIZE
        } else {
            config.max_message_size
        };

        let mtu = if config.mtu == 0 {
            INITIAL_MTU
        } else {
            config.mtu
        };

        let tsn = random::<u32>().max(1);
        let mut a = AssociationInternal {
            name: config.name,
            max_receive_buffer_size,
            max_message_size: Arc::new(AtomicU32::new(max_message_size)),

            payload_queue: ReceiveQueue::new(get_max_tsn_offset(max_receive_buffer_size)),
            mtu,
            max_payload_size: mtu - (COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE),
            my_verification_tag: random::<u32>(),
            my_next_tsn: tsn,
            my_next_rsn: tsn,
            min_tsn2measure_rtt: tsn,
            cumulative_tsn_ack_point: tsn.wrapping_sub(1),
            advanced_peer_tsn_ack_point: tsn.wrapping_sub(1),
            rto_mgr: RtoManager::new(config.rto_max),
            min_cwnd: config.min_cwnd,
            fast_rtx_wnd: config.fast_rtx_wnd,
            cwnd_ca_step: config.cwnd_ca_step,
            recv_zero_checksum: config.enable_zero_checksum,
            toggle_checksum_on_rtx: config.toggle_checksum_on_rtx,
            block_write: config.block_write,
            accept_ch_tx: Some(accept_ch_tx),
            close_loop_ch_tx: Some(close_loop_ch_tx),
            handshake_completed_ch_tx: Some(handshake_completed_ch_tx),
            awake_write_loop_ch: Some(awake_write_loop_ch),
            ..Default::default()
        };

        let inflight_queue_length = Arc::clone(&a.inflight_queue_length);
        a.inflight_queue = InflightQueue::new(inflight_queue_length);

        // RFC 4960 sec 7.2.1: initial cwnd = min(4*MTU, max(2*MTU, 4380)).
        a.set_cwnd(std::cmp::min(4 * a.mtu, std::cmp::max(2 * a.mtu, 4380)));
        log::trace!(
            "[{}] updated cwnd={} ssthresh={} inflight={} (INI)",
            a.name,
            a.cwnd(),
            a.ssthresh,
            a.inflight_queue.get_num_bytes()
        );

        a
    }

    pub(crate) fn cwnd(&self) -> u32 {
        self.cwnd.load(Ordering::SeqCst)
    }

    /// The single funnel for congestion-window updates; keeps the window at
    /// or above the configured floor.
    pub(crate) fn set_cwnd(&self, cwnd: u32) {
        self.cwnd
            .store(std::cmp::max(cwnd, self.min_cwnd), Ordering::SeqCst);
    }

    pub(crate) fn rwnd(&self) -> u32 {
        self.rwnd.load(Ordering::SeqCst)
    }

    pub(crate) fn set_rwnd(&self, rwnd: u32) {
        self.rwnd.store(rwnd, Ordering::SeqCst);
    }

    /// Builds the INIT chunk this endpoint will (re)send until answered.
    pub(crate) fn store_init(&mut self) {
        let mut init = ChunkInit {
            initial_tsn: self.my_next_tsn,
            num_outbound_streams: self.my_max_num_outbound_streams,
            num_inbound_streams: self.my_max_num_inbound_streams,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.max_receive_buffer_size,
            ..Default::default()
        };
        init.set_supported_extensions();
        if self.recv_zero_checksum {
            init.set_zero_checksum_acceptable();
        }
        self.stored_init = Some(init);
    }

    pub(crate) fn send_init(&mut self) -> Result<()> {
        if let Some(stored_init) = self.stored_init.clone() {
            log::debug!("[{}] sending INIT", self.name);

            self.source_port = DEFAULT_SCTP_PORT;
            self.destination_port = DEFAULT_SCTP_PORT;

            let outbound = Packet {
                source_port: self.source_port,
                destination_port: self.destination_port,
                verification_tag: 0,
                chunks: vec![Box::new(stored_init)],
            };

            self.control_queue.push_back(outbound);
            self.awake_write_loop();

            Ok(())
        } else {
            Err(Error::ErrInitNotStoredToSend)
        }
    }

    fn send_cookie_echo(&mut self) -> Result<()> {
        if let Some(stored_cookie_echo) = &self.stored_cookie_echo {
            log::debug!("[{}] sending COOKIE-ECHO", self.name);

            let outbound = Packet {
                source_port: self.source_port,
                destination_port: self.destination_port,
                verification_tag: self.peer_verification_tag,
                chunks: vec![Box::new(stored_cookie_echo.clone())],
            };

            self.control_queue.push_back(outbound);
            self.awake_write_loop();
            Ok(())
        } else {
            Err(Error::ErrCookieEchoNotStoredToSend)
        }
    }

    pub(crate) async fn close(&mut self) -> Result<()> {
        if self.get_state() != AssociationState::Closed {
            self.set_state(AssociationState::Closed);

            log::debug!("[{}] closing association..", self.name);

            self.close_all_timers().await;

            // Dropping the senders unblocks both loops and makes
            // accept_stream yield None.
            self.close_loop_ch_tx.take();
            self.accept_ch_tx.take();

            for si in self.streams.keys().cloned().collect::<Vec<u16>>() {
                self.unregister_stream(si);
            }

            log::debug!("[{}] association closed", self.name);
            log::debug!(
                "[{}] stats nDATAs (in) : {}",
                self.name,
                self.stats.get_num_datas()
            );
            log::debug!(
                "[{}] stats nSACKs (in) : {}",
                self.name,
                self.stats.get_num_sacks()
            );
            log::debug!(
                "[{}] stats nT3Timeouts : {}",
                self.name,
                self.stats.get_num_t3timeouts()
            );
            log::debug!(
                "[{}] stats nAckTimeouts: {}",
                self.name,
                self.stats.get_num_ack_timeouts()
            );
            log::debug!(
                "[{}] stats nFastRetrans: {}",
                self.name,
                self.stats.get_num_fast_retrans()
            );
        }

        Ok(())
    }

    async fn close_all_timers(&mut self) {
        if let Some(t1init) = &self.t1init {
            t1init.stop().await;
        }
        if let Some(t1cookie) = &self.t1cookie {
            t1cookie.stop().await;
        }
        if let Some(t2shutdown) = &self.t2shutdown {
            t2shutdown.stop().await;
        }
        if let Some(t3rtx) = &self.t3rtx {
            t3rtx.stop().await;
        }
        if let Some(treconfig) = &self.treconfig {
            treconfig.stop().await;
        }
        if let Some(ack_timer) = &mut self.ack_timer {
            ack_timer.stop();
        }
    }

    fn awake_write_loop(&self) {
        if let Some(awake_write_loop_ch) = &self.awake_write_loop_ch {
            // Capacity 1: wake-ups collapse.
            let _ = awake_write_loop_ch.try_send(());
        }
    }

    fn unregister_stream(&mut self, stream_identifier: u16) {
        if let Some(s) = self.streams.remove(&stream_identifier) {
            // Not stream.shutdown(); that would queue a reset of our own.
            if !s.read_shutdown.swap(true, Ordering::SeqCst) {
                s.read_notifier.notify_waiters();
            }
            s.write_shutdown.store(true, Ordering::SeqCst);
        }
    }

    /// Entry point of the read loop: parse, validate, dispatch.
    pub(crate) async fn handle_inbound(&mut self, raw: &Bytes) -> Result<()> {
        let p = match Packet::unmarshal(raw, self.recv_zero_checksum) {
            Ok(p) => p,
            Err(err) => {
                log::warn!("[{}] unable to parse SCTP packet {}", self.name, err);
                return Ok(());
            }
        };

        if let Err(err) = p.check_packet() {
            log::warn!("[{}] failed validating packet {}", self.name, err);
            return Ok(());
        }

        // Every packet except an out-of-the-blue INIT must carry our tag.
        let carries_init = p
            .chunks
            .first()
            .map(|c| c.header().typ == CT_INIT)
            .unwrap_or(false);
        if !carries_init && p.verification_tag != self.my_verification_tag {
            log::warn!(
                "[{}] discarding packet with unknown verification tag {}",
                self.name,
                p.verification_tag
            );
            return Ok(());
        }

        self.handle_chunks_start();

        for c in &p.chunks {
            self.handle_chunk(&p, c).await?;
        }

        self.handle_chunks_end();
        Ok(())
    }

    fn gather_data_packets_to_retransmit(&mut self, mut raw_packets: Vec<Packet>) -> Vec<Packet> {
        for p in self.get_data_packets_to_retransmit() {
            raw_packets.push(p);
        }

        raw_packets
    }

    async fn gather_outbound_data_and_reconfig_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> Vec<Packet> {
        // New DATA, as much as cwnd and rwnd allow.
        let (chunks, sis_to_reset) = self.pop_pending_data_chunks_to_send().await;
        if !chunks.is_empty() {
            // No-op if already running.
            log::trace!("[{}] T3-rtx timer start (pt1)", self.name);
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.start(self.rto_mgr.get_rto()).await;
            }
            for p in self.bundle_data_chunks_into_packets(chunks) {
                raw_packets.push(p);
            }
        }

        if !sis_to_reset.is_empty() || self.will_retransmit_reconfig {
            if self.will_retransmit_reconfig {
                self.will_retransmit_reconfig = false;
                log::debug!(
                    "[{}] retransmit {} RECONFIG chunk(s)",
                    self.name,
                    self.reconfigs.len()
                );
                for c in self.reconfigs.values() {
                    let p = self.create_packet(vec![Box::new(c.clone())]);
                    raw_packets.push(p);
                }
            }

            if !sis_to_reset.is_empty() {
                let rsn = self.generate_next_rsn();
                let tsn = self.my_next_tsn.wrapping_sub(1);
                log::debug!(
                    "[{}] sending RECONFIG: rsn={} tsn={} streams={:?}",
                    self.name,
                    rsn,
                    tsn,
                    sis_to_reset
                );

                let c = ChunkReconfig {
                    param_a: Some(Box::new(ParamOutgoingResetRequest {
                        reconfig_request_sequence_number: rsn,
                        sender_last_tsn: tsn,
                        stream_identifiers: sis_to_reset,
                        ..Default::default()
                    })),
                    ..Default::default()
                };
                // Kept around until the peer responds.
                self.reconfigs.insert(rsn, c.clone());

                let p = self.create_packet(vec![Box::new(c)]);
                raw_packets.push(p);
            }

            if !self.reconfigs.is_empty() {
                if let Some(treconfig) = &self.treconfig {
                    treconfig.start(self.rto_mgr.get_rto()).await;
                }
            }
        }

        raw_packets
    }

    fn gather_outbound_fast_retransmission_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> Vec<Packet> {
        if !self.will_retransmit_fast {
            return raw_packets;
        }
        self.will_retransmit_fast = false;

        // RFC 4960 sec 7.2.4: bundle the earliest eligible chunks into a
        // single burst and send it ignoring cwnd. The burst budget is one
        // MTU unless configured larger.
        let budget = std::cmp::max(self.mtu, self.fast_rtx_wnd);
        let mut to_fast_retrans: Vec<Box<dyn Chunk + Send + Sync>> = vec![];
        let mut fast_retrans_size = COMMON_HEADER_SIZE;

        let mut i = 0;
        loop {
            let tsn = self.cumulative_tsn_ack_point.wrapping_add(i + 1);
            let c = match self.inflight_queue.get_mut(tsn) {
                Some(c) => c,
                None => break, // end of the inflight window
            };

            if c.acked || c.abandoned() || c.nsent > 1 || c.miss_indicator < 3 {
                i += 1;
                continue;
            }

            let data_chunk_size = DATA_CHUNK_HEADER_SIZE + c.user_data.len() as u32;
            if budget < fast_retrans_size + data_chunk_size {
                break;
            }

            fast_retrans_size += data_chunk_size;
            self.stats.inc_fast_retrans();
            c.nsent += 1;

            if let Some(c) = self.inflight_queue.get(tsn) {
                self.check_partial_reliability_status(c);
                to_fast_retrans.push(Box::new(c.clone()));
                log::trace!(
                    "[{}] fast-retransmit: tsn={} sent={} htna={}",
                    self.name,
                    c.tsn,
                    c.nsent,
                    self.fast_recover_exit_point
                );
            }
            i += 1;
        }

        if !to_fast_retrans.is_empty() {
            let p = self.create_packet(to_fast_retrans);
            raw_packets.push(p);
        }

        raw_packets
    }

    async fn gather_outbound_sack_packets(&mut self, mut raw_packets: Vec<Packet>) -> Vec<Packet> {
        if self.ack_state == AckState::Immediate {
            self.ack_state = AckState::Idle;
            let sack = self.create_selective_ack_chunk().await;
            log::debug!("[{}] sending SACK: {}", self.name, sack);
            let p = self.create_packet(vec![Box::new(sack)]);
            raw_packets.push(p);
        }

        raw_packets
    }

    fn gather_outbound_forward_tsn_packets(&mut self, mut raw_packets: Vec<Packet>) -> Vec<Packet> {
        if self.will_send_forward_tsn {
            self.will_send_forward_tsn = false;
            if sna32gt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            ) {
                let fwd_tsn = self.create_forward_tsn();
                let p = self.create_packet(vec![Box::new(fwd_tsn)]);
                raw_packets.push(p);
            }
        }

        raw_packets
    }

    async fn gather_outbound_shutdown_packets(
        &mut self,
        mut raw_packets: Vec<Packet>,
    ) -> (Vec<Packet>, bool) {
        let mut ok = true;

        if self.will_send_shutdown.load(Ordering::SeqCst) {
            self.will_send_shutdown.store(false, Ordering::SeqCst);

            let shutdown = ChunkShutdown {
                cumulative_tsn_ack: self.cumulative_tsn_ack_point,
            };

            let p = self.create_packet(vec![Box::new(shutdown)]);
            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.start(self.rto_mgr.get_rto()).await;
            }
            raw_packets.push(p);
        } else if self.will_send_shutdown_ack {
            self.will_send_shutdown_ack = false;

            let p = self.create_packet(vec![Box::new(ChunkShutdownAck {})]);
            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.start(self.rto_mgr.get_rto()).await;
            }
            raw_packets.push(p);
        } else if self.will_send_shutdown_complete {
            self.will_send_shutdown_complete = false;

            // Final packet; the write loop winds down after sending it.
            ok = false;
            let p = self.create_packet(vec![Box::new(ChunkShutdownComplete {})]);
            raw_packets.push(p);
        }

        (raw_packets, ok)
    }

    fn gather_outbound_abort_packet(&mut self, reason: String) -> Packet {
        let cause = ErrorCause {
            code: USER_INITIATED_ABORT,
            raw: Bytes::from(reason.into_bytes()),
        };
        let abort = ChunkAbort {
            error_causes: vec![cause],
        };
        self.create_packet(vec![Box::new(abort)])
    }

    /// Collects everything due for transmission, in the fixed order:
    /// control, retransmits, new DATA + reconfig, fast retransmit, SACK,
    /// forward TSN, shutdown. A false second value tells the write loop to
    /// stop after this batch.
    pub(crate) async fn gather_outbound(&mut self) -> (Vec<Packet>, bool) {
        let mut raw_packets = Vec::with_capacity(16);

        // A pending abort preempts everything else.
        if let Some(reason) = self.will_send_abort.take() {
            let p = self.gather_outbound_abort_packet(reason);
            return (vec![p], false);
        }

        if !self.control_queue.is_empty() {
            for p in self.control_queue.drain(..) {
                raw_packets.push(p);
            }
        }

        let state = self.get_state();
        match state {
            AssociationState::Established => {
                raw_packets = self.gather_data_packets_to_retransmit(raw_packets);
                raw_packets = self
                    .gather_outbound_data_and_reconfig_packets(raw_packets)
                    .await;
                raw_packets = self.gather_outbound_fast_retransmission_packets(raw_packets);
                raw_packets = self.gather_outbound_sack_packets(raw_packets).await;
                raw_packets = self.gather_outbound_forward_tsn_packets(raw_packets);
                (raw_packets, true)
            }
            AssociationState::ShutdownPending
            | AssociationState::ShutdownSent
            | AssociationState::ShutdownReceived => {
                raw_packets = self.gather_data_packets_to_retransmit(raw_packets);
                raw_packets = self.gather_outbound_fast_retransmission_packets(raw_packets);
                raw_packets = self.gather_outbound_sack_packets(raw_packets).await;
                self.gather_outbound_shutdown_packets(raw_packets).await
            }
            AssociationState::ShutdownAckSent => {
                self.gather_outbound_shutdown_packets(raw_packets).await
            }
            _ => (raw_packets, true),
        }
    }

    pub(crate) fn set_state(&self, new_state: AssociationState) {
        let old_state = AssociationState::from(self.state.swap(new_state as u8, Ordering::SeqCst));
        if new_state != old_state {
            log::debug!(
                "[{}] state change: '{}' => '{}'",
                self.name,
                old_state,
                new_state,
            );
        }
    }

    pub(crate) fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }

    async fn handle_init(&mut self, p: &Packet, i: &ChunkInit) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] INIT received in state '{}'", self.name, state);

        // RFC 4960 sec 5.2.2: an INIT in any later state would be a
        // restart, which a single-homed WebRTC association does not do.
        if state != AssociationState::Closed
            && state != AssociationState::CookieWait
            && state != AssociationState::CookieEchoed
        {
            return Err(Error::ErrHandleInitState);
        }

        // The TCB is (knowingly) primed here rather than on COOKIE-ECHO.
        self.my_max_num_inbound_streams =
            std::cmp::min(i.num_inbound_streams, self.my_max_num_inbound_streams);
        self.my_max_num_outbound_streams =
            std::cmp::min(i.num_outbound_streams, self.my_max_num_outbound_streams);
        self.peer_verification_tag = i.initiate_tag;
        self.source_port = p.destination_port;
        self.destination_port = p.source_port;

        // peer_last_tsn starts one below the peer's initial TSN.
        self.peer_last_tsn = i.initial_tsn.wrapping_sub(1);

        for param in &i.params {
            if let Some(v) = param.as_any().downcast_ref::<ParamSupportedExtensions>() {
                for t in &v.chunk_types {
                    if *t == CT_FORWARD_TSN {
                        log::debug!("[{}] use ForwardTSN (on init)", self.name);
                        self.use_forward_tsn = true;
                    }
                }
            } else if param
                .as_any()
                .downcast_ref::<ParamZeroChecksumAcceptable>()
                .is_some()
            {
                self.zero_checksum_negotiated = true;
                if self.recv_zero_checksum {
                    log::debug!("[{}] zero checksum negotiated (on init)", self.name);
                    self.send_zero_checksum.store(true, Ordering::SeqCst);
                }
            }
        }
        if !self.use_forward_tsn {
            log::warn!("[{}] not using ForwardTSN (on init)", self.name);
        }

        // Parameters with the report bit go back in the INIT-ACK.
        let unrecognized_params_from_init: Vec<Box<dyn Param + Send + Sync>> = i
            .params
            .iter()
            .filter_map(|param| {
                if let ParamType::Unknown { param_type } = param.header().typ {
                    if (param_type >> 14) & 0x01 == 1 {
                        let wrapped: Box<dyn Param + Send + Sync> =
                            Box::new(ParamUnrecognized::wrap(param.clone()));
                        return Some(wrapped);
                    }
                }
                None
            })
            .collect();

        let mut init_ack = ChunkInit {
            is_ack: true,
            initial_tsn: self.my_next_tsn,
            num_outbound_streams: self.my_max_num_outbound_streams,
            num_inbound_streams: self.my_max_num_inbound_streams,
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.max_receive_buffer_size,
            params: unrecognized_params_from_init,
        };

        if self.my_cookie.is_none() {
            self.my_cookie = Some(ParamStateCookie::new());
        }
        if let Some(my_cookie) = &self.my_cookie {
            init_ack.params.push(Box::new(my_cookie.clone()));
        }

        init_ack.set_supported_extensions();
        if self.recv_zero_checksum {
            init_ack.set_zero_checksum_acceptable();
        }

        let outbound = Packet {
            verification_tag: self.peer_verification_tag,
            source_port: self.source_port,
            destination_port: self.destination_port,
            chunks: vec![Box::new(init_ack)],
        };

        Ok(vec![outbound])
    }

    async fn handle_init_ack(&mut self, p: &Packet, i: &ChunkInit) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] INIT-ACK received in state '{}'", self.name, state);
        if state != AssociationState::CookieWait {
            // RFC 4960 sec 5.2.3: discard; this is an old or duplicated
            // INIT being answered.
            return Ok(vec![]);
        }

        self.my_max_num_inbound_streams =
            std::cmp::min(i.num_inbound_streams, self.my_max_num_inbound_streams);
        self.my_max_num_outbound_streams =
            std::cmp::min(i.num_outbound_streams, self.my_max_num_outbound_streams);
        self.peer_verification_tag = i.initiate_tag;
        self.peer_last_tsn = i.initial_tsn.wrapping_sub(1);
        if self.source_port != p.destination_port || self.destination_port != p.source_port {
            log::warn!("[{}] handle_init_ack: port mismatch", self.name);
            return Ok(vec![]);
        }

        self.set_rwnd(i.advertised_receiver_window_credit);
        log::debug!("[{}] initial rwnd={}", self.name, self.rwnd());

        // RFC 4960 sec 7.2.1: the initial ssthresh may be arbitrarily high;
        // use the peer's advertised window.
        self.ssthresh = self.rwnd();
        log::trace!(
            "[{}] updated cwnd={} ssthresh={} inflight={} (INI)",
            self.name,
            self.cwnd(),
            self.ssthresh,
            self.inflight_queue.get_num_bytes()
        );

        if let Some(t1init) = &self.t1init {
            t1init.stop().await;
        }
        self.stored_init = None;

        let mut cookie_param = None;
        for param in &i.params {
            if let Some(v) = param.as_any().downcast_ref::<ParamStateCookie>() {
                cookie_param = Some(v);
            } else if let Some(v) = param.as_any().downcast_ref::<ParamSupportedExtensions>() {
                for t in &v.chunk_types {
                    if *t == CT_FORWARD_TSN {
                        log::debug!("[{}] use ForwardTSN (on initAck)", self.name);
                        self.use_forward_tsn = true;
                    }
                }
            } else if param
                .as_any()
                .downcast_ref::<ParamZeroChecksumAcceptable>()
                .is_some()
            {
                self.zero_checksum_negotiated = true;
                if self.recv_zero_checksum {
                    log::debug!("[{}] zero checksum negotiated (on initAck)", self.name);
                    self.send_zero_checksum.store(true, Ordering::SeqCst);
                }
            }
        }
        if !self.use_forward_tsn {
            log::warn!("[{}] not using ForwardTSN (on initAck)", self.name);
        }

        let cookie = match cookie_param {
            Some(v) => v.cookie.clone(),
            None => return Err(Error::ErrInitAckNoCookie),
        };

        self.stored_cookie_echo = Some(ChunkCookieEcho { cookie });
        self.send_cookie_echo()?;

        if let Some(t1cookie) = &self.t1cookie {
            t1cookie.start(self.rto_mgr.get_rto()).await;
        }

        self.set_state(AssociationState::CookieEchoed);

        Ok(vec![])
    }

    async fn handle_heartbeat(&self, c: &ChunkHeartbeat) -> Result<Vec<Packet>> {
        log::trace!("[{}] HEARTBEAT received", self.name);
        if let Some(p) = c.params.first() {
            if let Some(hbi) = p.as_any().downcast_ref::<ParamHeartbeatInfo>() {
                return Ok(vec![self.create_packet(vec![Box::new(ChunkHeartbeatAck {
                    params: vec![Box::new(ParamHeartbeatInfo {
                        heartbeat_information: hbi.heartbeat_information.clone(),
                    })],
                })])]);
            }
            log::warn!(
                "[{}] failed to handle Heartbeat, no ParamHeartbeatInfo",
                self.name,
            );
        }

        Ok(vec![])
    }

    async fn handle_cookie_echo(&mut self, c: &ChunkCookieEcho) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE-ECHO received in state '{}'", self.name, state);

        match &self.my_cookie {
            Some(my_cookie) => {
                // A cookie that does not match ours is stale or forged.
                if my_cookie.cookie != c.cookie {
                    return Ok(vec![]);
                }

                match state {
                    AssociationState::Established => {
                        // Duplicate; just re-ack.
                    }
                    AssociationState::Closed
                    | AssociationState::CookieWait
                    | AssociationState::CookieEchoed => {
                        if let Some(t1init) = &self.t1init {
                            t1init.stop().await;
                        }
                        self.stored_init = None;

                        if let Some(t1cookie) = &self.t1cookie {
                            t1cookie.stop().await;
                        }
                        self.stored_cookie_echo = None;

                        self.set_state(AssociationState::Established);
                        if let Some(handshake_completed_ch) = &self.handshake_completed_ch_tx {
                            let _ = handshake_completed_ch.send(None).await;
                        }
                    }
                    _ => return Ok(vec![]),
                }
            }
            None => {
                log::debug!("[{}] COOKIE-ECHO received before initialization", self.name);
                return Ok(vec![]);
            }
        }

        Ok(vec![
            self.create_packet(vec![Box::new(ChunkCookieAck {})])
        ])
    }

    async fn handle_cookie_ack(&mut self) -> Result<Vec<Packet>> {
        let state = self.get_state();
        log::debug!("[{}] COOKIE-ACK received in state '{}'", self.name, state);
        if state != AssociationState::CookieEchoed {
            // RFC 4960 sec 5.2.5: silently discard.
            return Ok(vec![]);
        }

        if let Some(t1cookie) = &self.t1cookie {
            t1cookie.stop().await;
        }
        self.stored_cookie_echo = None;

        self.set_state(AssociationState::Established);
        if let Some(handshake_completed_ch) = &self.handshake_completed_ch_tx {
            let _ = handshake_completed_ch.send(None).await;
        }

        Ok(vec![])
    }

    async fn handle_data(&mut self, d: &ChunkPayloadData) -> Result<Vec<Packet>> {
        log::trace!(
            "[{}] DATA: tsn={} immediateSack={} len={}",
            self.name,
            d.tsn,
            d.immediate_sack,
            d.user_data.len()
        );
        self.stats.inc_datas();

        let can_push = self.payload_queue.can_push(d.tsn, self.peer_last_tsn);
        let mut stream_handle_data = false;
        if can_push {
            if self.get_or_create_stream(d.stream_identifier).is_some() {
                if self.get_my_receiver_window_credit().await > 0 {
                    self.payload_queue.push(d.tsn, self.peer_last_tsn);
                    stream_handle_data = true;
                } else {
                    // Receive buffer full. A chunk below the highest
                    // received TSN fills a gap and is taken anyway; new
                    // data is dropped for the sender to retransmit.
                    match self.payload_queue.last_tsn_received().copied() {
                        Some(last_tsn) if sna32lt(d.tsn, last_tsn) => {
                            log::debug!(
                                "[{}] receive buffer full, but accepted as this is a missing chunk with tsn={} ssn={}",
                                self.name, d.tsn, d.stream_sequence_number
                            );
                            self.payload_queue.push(d.tsn, self.peer_last_tsn);
                            stream_handle_data = true;
                        }
                        _ => {
                            log::debug!(
                                "[{}] receive buffer full. dropping DATA with tsn={} ssn={}",
                                self.name,
                                d.tsn,
                                d.stream_sequence_number
                            );
                        }
                    }
                }
            } else {
                // Stream routing failed (accept queue overflow); drop and
                // let T3 at the sender sort it out.
                log::debug!("discard {}", d.stream_sequence_number);
                return Ok(vec![]);
            }
        } else {
            // Record duplicates for the next SACK.
            self.payload_queue.push(d.tsn, self.peer_last_tsn);
        }

        let immediate_sack = d.immediate_sack;

        if stream_handle_data {
            if let Some(s) = self.streams.get_mut(&d.stream_identifier) {
                s.handle_data(d.clone()).await;
            }
        }

        self.handle_peer_last_tsn_and_acknowledgement(immediate_sack)
    }

    /// Shared tail of DATA and FORWARD-TSN handling: advance the cumulative
    /// point as far as it goes, re-try deferred resets on each step, then
    /// settle the SACK decision.
    fn handle_peer_last_tsn_and_acknowledgement(
        &mut self,
        sack_immediately: bool,
    ) -> Result<Vec<Packet>> {
        let mut reply = vec![];

        // RFC 3758 sec 3.6: advance the cumulative point while the next
        // TSN is present.
        while self.payload_queue.pop(self.peer_last_tsn.wrapping_add(1)) {
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);

            let rst_reqs: Vec<ParamOutgoingResetRequest> =
                self.reconfig_requests.values().cloned().collect();
            for rst_req in rst_reqs {
                let resp = self.reset_streams_if_any(&rst_req);
                log::debug!("[{}] RESET RESPONSE: {}", self.name, resp);
                reply.push(resp);
            }
        }

        let has_packet_loss = !self.payload_queue.is_empty();
        if has_packet_loss {
            log::trace!(
                "[{}] packetloss: {}",
                self.name,
                self.payload_queue
                    .get_gap_ack_blocks_string(self.peer_last_tsn)
            );
        }

        if (self.ack_state != AckState::Immediate
            && !sack_immediately
            && !has_packet_loss
            && self.ack_mode == AckMode::Normal)
            || self.ack_mode == AckMode::AlwaysDelay
        {
            if self.ack_state == AckState::Idle {
                self.delayed_ack_triggered = true;
            } else {
                self.immediate_ack_triggered = true;
            }
        } else {
            self.immediate_ack_triggered = true;
        }

        Ok(reply)
    }

    /// How much receive buffer remains, i.e. the a_rwnd we advertise.
    pub(crate) async fn get_my_receiver_window_credit(&self) -> u32 {
        let mut bytes_queued = 0;
        for s in self.streams.values() {
            bytes_queued += s.get_num_bytes_in_reassembly_queue().await as u32;
        }

        self.max_receive_buffer_size.saturating_sub(bytes_queued)
    }

    pub(crate) fn open_stream(
        &mut self,
        stream_identifier: u16,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        if self.streams.contains_key(&stream_identifier) {
            return Err(Error::ErrStreamAlreadyExist);
        }

        match self.create_stream(stream_identifier, false) {
            Some(s) => {
                s.set_default_payload_type(default_payload_type);
                Ok(s)
            }
            None => Err(Error::ErrStreamCreateFailed),
        }
    }

    /// Registers a new stream object. `accept` routes it to the peer-opened
    /// accept queue; a full queue drops the stream entirely.
    fn create_stream(&mut self, stream_identifier: u16, accept: bool) -> Option<Arc<Stream>> {
        let s = Arc::new(Stream::new(
            format!("{}:{}", stream_identifier, self.name),
            stream_identifier,
            self.max_payload_size,
            Arc::clone(&self.max_message_size),
            Arc::clone(&self.state),
            self.awake_write_loop_ch.clone()?,
            Arc::clone(&self.pending_queue),
            self.block_write,
        ));

        if accept {
            match &self.accept_ch_tx {
                Some(accept_ch) => {
                    if accept_ch.try_send(Arc::clone(&s)).is_err() {
                        log::debug!("[{}] dropped a new stream due to accept_ch full", self.name);
                        return None;
                    }
                    log::debug!(
                        "[{}] accepted a new stream (streamIdentifier: {})",
                        self.name,
                        stream_identifier
                    );
                }
                None => {
                    log::debug!(
                        "[{}] dropped a new stream due to accept_ch_tx is None",
                        self.name
                    );
                    return None;
                }
            }
        }
        self.streams.insert(stream_identifier, Arc::clone(&s));
        Some(s)
    }

    /// Incoming DATA may lazily create its stream.
    fn get_or_create_stream(&mut self, stream_identifier: u16) -> Option<Arc<Stream>> {
        if self.streams.contains_key(&stream_identifier) {
            self.streams.get(&stream_identifier).cloned()
        } else {
            self.create_stream(stream_identifier, true)
        }
    }

    async fn process_selective_ack(
        &mut self,
        d: &ChunkSelectiveAck,
    ) -> Result<(HashMap<u16, i64>, u32)> {
        let mut bytes_acked_per_stream: HashMap<u16, i64> = HashMap::new();

        // Pop everything newly covered by the cumulative ack. The window
        // starts one past the current ack point.
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lte(i, d.cumulative_tsn_ack) {
            let c = match self.inflight_queue.pop(i) {
                Some(c) => c,
                None => return Err(Error::ErrInflightQueueTsnPop),
            };

            if !c.acked {
                // RFC 4960 sec 6.3.2 R3: a SACK acknowledging the earliest
                // outstanding TSN restarts T3; stop it here, postprocess
                // restarts it if anything is still in flight.
                if i == self.cumulative_tsn_ack_point.wrapping_add(1) {
                    if let Some(t3rtx) = &self.t3rtx {
                        t3rtx.stop().await;
                    }
                }

                let n_bytes_acked = c.user_data.len() as i64;
                *bytes_acked_per_stream
                    .entry(c.stream_identifier)
                    .or_insert(0) += n_bytes_acked;

                // RFC 4960 sec 6.3.1 C4/C5: one sample per round trip,
                // never from a retransmitted chunk (Karn).
                if c.nsent == 1 && sna32gte(c.tsn, self.min_tsn2measure_rtt) {
                    self.min_tsn2measure_rtt = self.my_next_tsn;
                    let rtt = match SystemTime::now().duration_since(c.since) {
                        Ok(rtt) => rtt,
                        Err(_) => return Err(Error::ErrInvalidSystemTime),
                    };
                    let srtt = self.rto_mgr.set_new_rtt(rtt.as_millis() as u64);
                    self.srtt.store(srtt, Ordering::SeqCst);
                    log::trace!(
                        "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
                        self.name,
                        rtt.as_millis(),
                        srtt,
                        self.rto_mgr.get_rto()
                    );
                }
            }

            if self.in_fast_recovery && c.tsn == self.fast_recover_exit_point {
                log::debug!("[{}] exit fast-recovery", self.name);
                self.in_fast_recovery = false;
            }

            i = i.wrapping_add(1);
        }

        let mut htna = d.cumulative_tsn_ack;

        // Gap-acked chunks stay in the queue but stop counting as inflight
        // bytes.
        for g in &d.gap_ack_blocks {
            for i in g.start..=g.end {
                let tsn = d.cumulative_tsn_ack.wrapping_add(i as u32);

                let (exists, already_acked) = match self.inflight_queue.get(tsn) {
                    Some(c) => (true, c.acked),
                    None => (false, false),
                };
                if !exists {
                    return Err(Error::ErrTsnRequestNotExist);
                }
                if already_acked {
                    continue;
                }

                let n_bytes_acked = self.inflight_queue.mark_as_acked(tsn) as i64;

                let c = match self.inflight_queue.get(tsn) {
                    Some(c) => c,
                    None => return Err(Error::ErrTsnRequestNotExist),
                };

                *bytes_acked_per_stream
                    .entry(c.stream_identifier)
                    .or_insert(0) += n_bytes_acked;

                log::trace!("[{}] tsn={} has been sacked", self.name, c.tsn);

                if c.nsent == 1 && sna32gte(c.tsn, self.min_tsn2measure_rtt) {
                    self.min_tsn2measure_rtt = self.my_next_tsn;
                    let rtt = match SystemTime::now().duration_since(c.since) {
                        Ok(rtt) => rtt,
                        Err(_) => return Err(Error::ErrInvalidSystemTime),
                    };
                    let srtt = self.rto_mgr.set_new_rtt(rtt.as_millis() as u64);
                    self.srtt.store(srtt, Ordering::SeqCst);
                    log::trace!(
                        "[{}] SACK: measured-rtt={} srtt={} new-rto={}",
                        self.name,
                        rtt.as_millis(),
                        srtt,
                        self.rto_mgr.get_rto()
                    );
                }

                if sna32lt(htna, tsn) {
                    htna = tsn;
                }
            }
        }

        Ok((bytes_acked_per_stream, htna))
    }

    async fn on_cumulative_tsn_ack_point_advanced(&mut self, total_bytes_acked: i64) {
        // RFC 4960 sec 6.3.2 R2: all outstanding data acked turns T3 off.
        if self.inflight_queue.is_empty() {
            log::trace!(
                "[{}] SACK: no more packet in-flight (pending={})",
                self.name,
                self.pending_queue.len()
            );
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.stop().await;
            }
        } else {
            log::trace!("[{}] T3-rtx timer start (pt2)", self.name);
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.start(self.rto_mgr.get_rto()).await;
            }
        }

        if self.cwnd() <= self.ssthresh {
            // RFC 4960 sec 7.2.1 slow start: grow only when the window is
            // being used, the cumulative point moved, and we are not in
            // fast recovery.
            if !self.in_fast_recovery && !self.pending_queue.is_empty() {
                let cwnd = self.cwnd();
                self.set_cwnd(cwnd + std::cmp::min(total_bytes_acked as u32, cwnd));
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} acked={} (SS)",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    total_bytes_acked
                );
            } else {
                log::trace!(
                    "[{}] cwnd did not grow: cwnd={} ssthresh={} acked={} FR={} pending={}",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    total_bytes_acked,
                    self.in_fast_recovery,
                    self.pending_queue.len()
                );
            }
        } else {
            // RFC 4960 sec 7.2.2 congestion avoidance.
            self.partial_bytes_acked += total_bytes_acked as u32;
            if self.partial_bytes_acked >= self.cwnd() && !self.pending_queue.is_empty() {
                let cwnd = self.cwnd();
                self.partial_bytes_acked -= cwnd;
                self.set_cwnd(cwnd + std::cmp::max(self.mtu, self.cwnd_ca_step));
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} acked={} (CA)",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    total_bytes_acked
                );
            }
        }
    }

    fn process_fast_retransmission(
        &mut self,
        cum_tsn_ack_point: u32,
        gap_ack_blocks: &[crate::chunk::chunk_selective_ack::GapAckBlock],
        htna: u32,
        cum_tsn_ack_point_advanced: bool,
    ) -> Result<()> {
        // HTNA algorithm, RFC 4960 sec 7.2.4: count misses
        // a) outside fast recovery, for TSNs below the highest newly acked;
        // b) inside fast recovery (only when the cumulative point moved),
        //    for every TSN the SACK reported missing.
        if !self.in_fast_recovery || cum_tsn_ack_point_advanced {
            let max_tsn = if !self.in_fast_recovery {
                htna
            } else {
                let last_gap_end = gap_ack_blocks.last().map(|g| g.end).unwrap_or(0);
                cum_tsn_ack_point.wrapping_add(last_gap_end as u32)
            };

            let mut tsn = cum_tsn_ack_point.wrapping_add(1);
            while sna32lt(tsn, max_tsn) {
                let mut third_miss = false;
                {
                    let c = match self.inflight_queue.get_mut(tsn) {
                        Some(c) => c,
                        None => return Err(Error::ErrTsnRequestNotExist),
                    };
                    if !c.acked && !c.abandoned() && c.miss_indicator < 3 {
                        c.miss_indicator += 1;
                        third_miss = c.miss_indicator == 3;
                    }
                }

                if third_miss && !self.in_fast_recovery {
                    // RFC 4960 sec 7.2.4 (2): enter fast recovery.
                    self.in_fast_recovery = true;
                    self.fast_recover_exit_point = htna;
                    self.ssthresh = std::cmp::max(self.cwnd() / 2, 4 * self.mtu);
                    self.set_cwnd(self.ssthresh);
                    self.partial_bytes_acked = 0;
                    self.will_retransmit_fast = true;

                    log::trace!(
                        "[{}] updated cwnd={} ssthresh={} inflight={} (FR)",
                        self.name,
                        self.cwnd(),
                        self.ssthresh,
                        self.inflight_queue.get_num_bytes()
                    );
                }

                tsn = tsn.wrapping_add(1);
            }
        }

        if self.in_fast_recovery && cum_tsn_ack_point_advanced {
            self.will_retransmit_fast = true;
        }

        Ok(())
    }

    async fn handle_sack(&mut self, d: &ChunkSelectiveAck) -> Result<Vec<Packet>> {
        log::trace!(
            "[{}] SACK: cumTSN={} a_rwnd={} (ack point={})",
            self.name,
            d.cumulative_tsn_ack,
            d.advertised_receiver_window_credit,
            self.cumulative_tsn_ack_point,
        );
        let state = self.get_state();
        if state != AssociationState::Established
            && state != AssociationState::ShutdownPending
            && state != AssociationState::ShutdownReceived
        {
            return Ok(vec![]);
        }

        self.stats.inc_sacks();

        // RFC 4960 sec 6.2.1 D-i: an out-of-order SACK changes nothing.
        if sna32gt(self.cumulative_tsn_ack_point, d.cumulative_tsn_ack) {
            log::debug!(
                "[{}] SACK Cumulative ACK {} is older than ACK point {}",
                self.name,
                d.cumulative_tsn_ack,
                self.cumulative_tsn_ack_point
            );
            return Ok(vec![]);
        }

        let (bytes_acked_per_stream, htna) = self.process_selective_ack(d).await?;

        let total_bytes_acked: i64 = bytes_acked_per_stream.values().sum();

        let mut cum_tsn_ack_point_advanced = false;
        if sna32lt(self.cumulative_tsn_ack_point, d.cumulative_tsn_ack) {
            log::trace!(
                "[{}] SACK: cumTSN advanced: {} -> {}",
                self.name,
                self.cumulative_tsn_ack_point,
                d.cumulative_tsn_ack
            );

            self.cumulative_tsn_ack_point = d.cumulative_tsn_ack;
            cum_tsn_ack_point_advanced = true;
            self.on_cumulative_tsn_ack_point_advanced(total_bytes_acked)
                .await;
        }

        // Streams learn about delivered bytes through their own atomics;
        // the buffered-amount-low callback may run user code but cannot
        // reenter the association.
        for (si, n_bytes_acked) in &bytes_acked_per_stream {
            if let Some(s) = self.streams.get(si).cloned() {
                s.on_buffer_released(*n_bytes_acked).await;
            }
        }

        // RFC 4960 sec 6.2.1 D-ii: rwnd = a_rwnd minus bytes still in
        // flight (gap-acked bytes were already deducted by mark_as_acked).
        let bytes_outstanding = self.inflight_queue.get_num_bytes() as u32;
        self.set_rwnd(
            d.advertised_receiver_window_credit
                .saturating_sub(bytes_outstanding),
        );

        self.process_fast_retransmission(
            d.cumulative_tsn_ack,
            &d.gap_ack_blocks,
            htna,
            cum_tsn_ack_point_advanced,
        )?;

        if self.use_forward_tsn {
            // RFC 3758 sec 3.5 C1
            if sna32lt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            ) {
                self.advanced_peer_tsn_ack_point = self.cumulative_tsn_ack_point
            }

            // RFC 3758 sec 3.5 C2: walk forward over abandoned chunks.
            let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
            while let Some(c) = self.inflight_queue.get(i) {
                if !c.abandoned() {
                    break;
                }
                self.advanced_peer_tsn_ack_point = i;
                i = i.wrapping_add(1);
            }

            // RFC 3758 sec 3.5 C3
            if sna32gt(
                self.advanced_peer_tsn_ack_point,
                self.cumulative_tsn_ack_point,
            ) {
                self.will_send_forward_tsn = true;
                log::debug!(
                    "[{}] handleSack: will send forward TSN (advanced={} ack point={})",
                    self.name,
                    self.advanced_peer_tsn_ack_point,
                    self.cumulative_tsn_ack_point
                );
            }
            self.awake_write_loop();
        }

        self.postprocess_sack(state, cum_tsn_ack_point_advanced)
            .await;

        Ok(vec![])
    }

    /// Restarts T3 while data remains in flight; otherwise lets a pending
    /// shutdown progress now that the queue drained.
    async fn postprocess_sack(
        &mut self,
        state: AssociationState,
        mut should_awake_write_loop: bool,
    ) {
        if !self.inflight_queue.is_empty() {
            log::trace!("[{}] T3-rtx timer start (pt3)", self.name);
            if let Some(t3rtx) = &self.t3rtx {
                t3rtx.start(self.rto_mgr.get_rto()).await;
            }
        } else if state == AssociationState::ShutdownPending {
            should_awake_write_loop = true;
            self.will_send_shutdown.store(true, Ordering::SeqCst);
            self.set_state(AssociationState::ShutdownSent);
        } else if state == AssociationState::ShutdownReceived {
            should_awake_write_loop = true;
            self.will_send_shutdown_ack = true;
            self.set_state(AssociationState::ShutdownAckSent);
        }

        if should_awake_write_loop {
            self.awake_write_loop();
        }
    }

    async fn handle_shutdown(&mut self, _: &ChunkShutdown) -> Result<Vec<Packet>> {
        let state = self.get_state();

        if state == AssociationState::Established {
            if !self.inflight_queue.is_empty() {
                self.set_state(AssociationState::ShutdownReceived);
            } else {
                self.will_send_shutdown_ack = true;
                self.set_state(AssociationState::ShutdownAckSent);
                self.awake_write_loop();
            }
        } else if state == AssociationState::ShutdownSent {
            // Both sides initiated at once; answer with the ack.
            self.will_send_shutdown_ack = true;
            self.set_state(AssociationState::ShutdownAckSent);
            self.awake_write_loop();
        }

        Ok(vec![])
    }

    async fn handle_shutdown_ack(&mut self, _: &ChunkShutdownAck) -> Result<Vec<Packet>> {
        let state = self.get_state();
        if state == AssociationState::ShutdownSent || state == AssociationState::ShutdownAckSent {
            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.stop().await;
            }
            self.will_send_shutdown_complete = true;
            self.awake_write_loop();
        }

        Ok(vec![])
    }

    async fn handle_shutdown_complete(&mut self, _: &ChunkShutdownComplete) -> Result<Vec<Packet>> {
        if self.get_state() == AssociationState::ShutdownAckSent {
            if let Some(t2shutdown) = &self.t2shutdown {
                t2shutdown.stop().await;
            }
            self.close().await?;
        }

        Ok(vec![])
    }

    fn handle_abort(&mut self, c: &ChunkAbort) -> Result<Vec<Packet>> {
        let mut err_str = String::new();
        for cause in &c.error_causes {
            err_str += format!("({cause})").as_str();
        }
        Err(Error::ErrAbortChunk(err_str))
    }

    /// Builds the FORWARD-TSN for the current advanced ack point,
    /// RFC 3758 sec 3.5 C4: one entry per stream, carrying its highest
    /// abandoned ordered SSN.
    pub(crate) fn create_forward_tsn(&self) -> ChunkForwardTsn {
        let mut stream_map: HashMap<u16, u16> = HashMap::new();
        let mut i = self.cumulative_tsn_ack_point.wrapping_add(1);
        while sna32lte(i, self.advanced_peer_tsn_ack_point) {
            let c = match self.inflight_queue.get(i) {
                Some(c) => c,
                None => break,
            };

            match stream_map.get(&c.stream_identifier) {
                Some(ssn) if sna16lt(*ssn, c.stream_sequence_number) => {
                    stream_map.insert(c.stream_identifier, c.stream_sequence_number);
                }
                None => {
                    stream_map.insert(c.stream_identifier, c.stream_sequence_number);
                }
                _ => {}
            }

            i = i.wrapping_add(1);
        }

        let mut fwd_tsn = ChunkForwardTsn {
            new_cumulative_tsn: self.advanced_peer_tsn_ack_point,
            streams: vec![],
        };

        for (si, ssn) in &stream_map {
            fwd_tsn.streams.push(ChunkForwardTsnStream {
                identifier: *si,
                sequence: *ssn,
            });
        }
        log::trace!(
            "[{}] building fwd_tsn: newCumulativeTSN={} cumTSN={} streams={}",
            self.name,
            fwd_tsn.new_cumulative_tsn,
            self.cumulative_tsn_ack_point,
            fwd_tsn.streams.len()
        );

        fwd_tsn
    }

    /// Stamps chunks with the association's ports and the peer's tag.
    pub(crate) fn create_packet(&self, chunks: Vec<Box<dyn Chunk + Send + Sync>>) -> Packet {
        Packet {
            verification_tag: self.peer_verification_tag,
            source_port: self.source_port,
            destination_port: self.destination_port,
            chunks,
        }
    }

    async fn handle_reconfig(&mut self, c: &ChunkReconfig) -> Result<Vec<Packet>> {
        log::trace!("[{}] handle_reconfig", self.name);

        let mut pp = vec![];

        if let Some(param_a) = &c.param_a {
            if let Some(p) = self.handle_reconfig_param(param_a).await? {
                pp.push(p);
            }
        }

        if let Some(param_b) = &c.param_b {
            if let Some(p) = self.handle_reconfig_param(param_b).await? {
                pp.push(p);
            }
        }

        Ok(pp)
    }

    async fn handle_forward_tsn(&mut self, c: &ChunkForwardTsn) -> Result<Vec<Packet>> {
        log::trace!("[{}] FwdTSN: {}", self.name, c.to_string());

        if !self.use_forward_tsn {
            log::warn!("[{}] received FwdTSN but not enabled", self.name);
            // RFC 3758 requires support to be negotiated; report the chunk
            // as unrecognized.
            let cerr = ChunkError {
                error_causes: vec![ErrorCause {
                    code: UNRECOGNIZED_CHUNK_TYPE,
                    ..Default::default()
                }],
            };
            return Ok(vec![self.create_packet(vec![Box::new(cerr)])]);
        }

        // RFC 3758 sec 3.6: a stale FORWARD-TSN still deserves a SACK; the
        // one that acknowledged it may have been lost.
        if sna32lte(c.new_cumulative_tsn, self.peer_last_tsn) {
            log::trace!("[{}] sending ack on Forward TSN", self.name);
            self.ack_state = AckState::Immediate;
            if let Some(ack_timer) = &mut self.ack_timer {
                ack_timer.stop();
            }
            self.awake_write_loop();
            return Ok(vec![]);
        }

        // Forced advance to the new cumulative point; the skipped TSNs may
        // or may not have arrived.
        while sna32lt(self.peer_last_tsn, c.new_cumulative_tsn) {
            self.payload_queue.pop(self.peer_last_tsn.wrapping_add(1));
            self.peer_last_tsn = self.peer_last_tsn.wrapping_add(1);
        }

        // Listed ordered streams flush up to the reported SSN.
        for forwarded in &c.streams {
            if let Some(s) = self.streams.get(&forwarded.identifier) {
                s.handle_forward_tsn_for_ordered(forwarded.sequence).await;
            }
        }

        // Unordered chunks are not attributed to streams in the chunk, so
        // every stream checks its unordered pool against the new point.
        for s in self.streams.values() {
            s.handle_forward_tsn_for_unordered(c.new_cumulative_tsn)
                .await;
        }

        self.handle_peer_last_tsn_and_acknowledgement(false)
    }

    #[allow(clippy::borrowed_box)]
    async fn handle_reconfig_param(
        &mut self,
        raw: &Box<dyn Param + Send + Sync>,
    ) -> Result<Option<Packet>> {
        if let Some(p) = raw.as_any().downcast_ref::<ParamOutgoingResetRequest>() {
            // Cap the deferred-request map; a well-behaved peer will
            // retransmit the request later.
            if !self
                .reconfig_requests
                .contains_key(&p.reconfig_request_sequence_number)
                && self.reconfig_requests.len() >= MAX_RECONFIG_REQUESTS
            {
                return Err(Error::ErrTooManyReconfigRequests);
            }
            self.reconfig_requests
                .insert(p.reconfig_request_sequence_number, p.clone());
            Ok(Some(self.reset_streams_if_any(p)))
        } else if let Some(p) = raw.as_any().downcast_ref::<ParamReconfigResponse>() {
            if p.result == ReconfigResult::InProgress {
                // Peer has not caught up to our sender_last_tsn yet; keep
                // the request and give the timer another round.
                if self
                    .reconfigs
                    .contains_key(&p.reconfig_response_sequence_number)
                {
                    if let Some(treconfig) = &self.treconfig {
                        treconfig.stop().await;
                        treconfig.start(self.rto_mgr.get_rto()).await;
                    }
                }
                return Ok(None);
            }

            self.reconfigs.remove(&p.reconfig_response_sequence_number);
            if self.reconfigs.is_empty() {
                if let Some(treconfig) = &self.treconfig {
                    treconfig.stop().await;
                }
            }
            Ok(None)
        } else {
            Err(Error::ErrParameterType)
        }
    }

    fn reset_streams_if_any(&mut self, p: &ParamOutgoingResetRequest) -> Packet {
        let mut result = ReconfigResult::SuccessPerformed;
        if sna32lte(p.sender_last_tsn, self.peer_last_tsn) {
            log::debug!(
                "[{}] resetStream(): senderLastTSN={} <= peer_last_tsn={}",
                self.name,
                p.sender_last_tsn,
                self.peer_last_tsn
            );
            for id in &p.stream_identifiers {
                if self.streams.contains_key(id) {
                    self.unregister_stream(*id);
                }
            }
            self.reconfig_requests
                .remove(&p.reconfig_request_sequence_number);
        } else {
            log::debug!(
                "[{}] resetStream(): senderLastTSN={} > peer_last_tsn={}",
                self.name,
                p.sender_last_tsn,
                self.peer_last_tsn
            );
            result = ReconfigResult::InProgress;
        }

        self.create_packet(vec![Box::new(ChunkReconfig {
            param_a: Some(Box::new(ParamReconfigResponse {
                reconfig_response_sequence_number: p.reconfig_request_sequence_number,
                result,
            })),
            param_b: None,
        })])
    }

    /// Moves the chunk at the head of the pending queue into the inflight
    /// queue, assigning its TSN and first-send timestamp.
    async fn move_pending_data_chunk_to_inflight_queue(
        &mut self,
        beginning_fragment: bool,
        unordered: bool,
    ) -> Option<ChunkPayloadData> {
        match self.pending_queue.pop(beginning_fragment, unordered).await {
            Some(mut c) => {
                // The last fragment flips the shared all-inflight marker.
                if c.ending_fragment {
                    c.set_all_inflight();
                }

                c.tsn = self.generate_next_tsn();
                c.since = SystemTime::now(); // RTT measurement and Timed abandonment
                c.nsent = 1;

                self.check_partial_reliability_status(&c);

                log::trace!(
                    "[{}] sending ppi={} tsn={} ssn={} sent={} len={} ({},{})",
                    self.name,
                    c.payload_type as u32,
                    c.tsn,
                    c.stream_sequence_number,
                    c.nsent,
                    c.user_data.len(),
                    c.beginning_fragment,
                    c.ending_fragment
                );

                self.inflight_queue.push_no_check(c.clone());

                Some(c)
            }
            None => {
                log::error!("[{}] failed to pop from pending queue", self.name);
                None
            }
        }
    }

    /// Pops as many pending chunks as cwnd and rwnd allow. Zero-length
    /// sentinels come back as stream ids to reset instead.
    async fn pop_pending_data_chunks_to_send(&mut self) -> (Vec<ChunkPayloadData>, Vec<u16>) {
        let mut chunks = vec![];
        let mut sis_to_reset = vec![];

        if self.pending_queue.is_empty() {
            return (chunks, sis_to_reset);
        }

        // RFC 4960 sec 6.1 A: never send into a zero rwnd, except to keep
        // exactly one chunk in flight as a window probe.
        while let Some(c) = self.pending_queue.peek().await {
            let (beginning_fragment, unordered, data_len, stream_identifier) = (
                c.beginning_fragment,
                c.unordered,
                c.user_data.len(),
                c.stream_identifier,
            );

            if data_len == 0 {
                // Stream-reset sentinel.
                sis_to_reset.push(stream_identifier);
                if self
                    .pending_queue
                    .pop(beginning_fragment, unordered)
                    .await
                    .is_none()
                {
                    log::error!("failed to pop from pending queue");
                }
                continue;
            }

            if self.inflight_queue.get_num_bytes() + data_len > self.cwnd() as usize {
                break; // would exceed cwnd
            }

            if data_len > self.rwnd() as usize {
                break; // no more rwnd
            }

            self.set_rwnd(self.rwnd() - data_len as u32);

            if let Some(chunk) = self
                .move_pending_data_chunk_to_inflight_queue(beginning_fragment, unordered)
                .await
            {
                chunks.push(chunk);
            }
        }

        // Zero window probe.
        if chunks.is_empty() && self.inflight_queue.is_empty() {
            if let Some(c) = self.pending_queue.peek().await {
                let (beginning_fragment, unordered) = (c.beginning_fragment, c.unordered);

                if let Some(chunk) = self
                    .move_pending_data_chunk_to_inflight_queue(beginning_fragment, unordered)
                    .await
                {
                    chunks.push(chunk);
                }
            }
        }

        (chunks, sis_to_reset)
    }

    /// Bundles DATA chunks into as few packets as the MTU allows.
    fn bundle_data_chunks_into_packets(&self, chunks: Vec<ChunkPayloadData>) -> Vec<Packet> {
        let mut packets = vec![];
        let mut chunks_to_send: Vec<Box<dyn Chunk + Send + Sync>> = vec![];
        let mut bytes_in_packet = COMMON_HEADER_SIZE;

        for c in chunks {
            // RFC 4960 sec 6.1: bundle while the packet stays within MTU.
            let chunk_size_in_packet = DATA_CHUNK_HEADER_SIZE
                + c.user_data.len() as u32
                + get_padding_size(c.user_data.len()) as u32;
            if bytes_in_packet + chunk_size_in_packet > self.mtu {
                packets.push(self.create_packet(std::mem::take(&mut chunks_to_send)));
                bytes_in_packet = COMMON_HEADER_SIZE;
            }

            bytes_in_packet += chunk_size_in_packet;
            chunks_to_send.push(Box::new(c));
        }

        if !chunks_to_send.is_empty() {
            packets.push(self.create_packet(chunks_to_send));
        }

        packets
    }

    /// Applies the stream's PR-SCTP policy to a chunk about to be sent or
    /// retransmitted.
    fn check_partial_reliability_status(&self, c: &ChunkPayloadData) {
        if !self.use_forward_tsn {
            return;
        }

        // DCEP control messages are exempt; they are always reliable.
        if c.payload_type == PayloadProtocolIdentifier::Dcep {
            return;
        }

        if let Some(s) = self.streams.get(&c.stream_identifier) {
            let reliability_type: ReliabilityType =
                s.reliability_type.load(Ordering::SeqCst).into();
            let reliability_value = s.reliability_value.load(Ordering::SeqCst);

            match reliability_type {
                ReliabilityType::Rexmit => {
                    if c.nsent >= reliability_value {
                        c.set_abandoned(true);
                        log::trace!(
                            "[{}] marked as abandoned: tsn={} ppi={} (rexmit: {})",
                            self.name,
                            c.tsn,
                            c.payload_type,
                            c.nsent
                        );
                    }
                }
                ReliabilityType::Timed => {
                    if let Ok(elapsed) = SystemTime::now().duration_since(c.since) {
                        if elapsed.as_millis() as u32 >= reliability_value {
                            c.set_abandoned(true);
                            log::trace!(
                                "[{}] marked as abandoned: tsn={} ppi={} (timed: {:?})",
                                self.name,
                                c.tsn,
                                c.payload_type,
                                elapsed
                            );
                        }
                    }
                }
                ReliabilityType::Reliable => {}
            }
        } else {
            log::error!("[{}] stream {} not found", self.name, c.stream_identifier);
        }
    }

    /// Picks T3-marked chunks for retransmission, lowest TSN first, within
    /// min(cwnd, rwnd). The first chunk always goes, as a zero window
    /// probe if need be.
    fn get_data_packets_to_retransmit(&mut self) -> Vec<Packet> {
        let awnd = std::cmp::min(self.cwnd(), self.rwnd());
        let mut chunks = vec![];
        let mut bytes_to_send = 0;
        let mut done = false;
        let mut i = 0;
        while !done {
            let tsn = self.cumulative_tsn_ack_point.wrapping_add(i + 1);
            let c = match self.inflight_queue.get_mut(tsn) {
                Some(c) => c,
                None => break, // end of the inflight window
            };

            if !c.retransmit {
                i += 1;
                continue;
            }

            if i == 0 && (self.rwnd.load(Ordering::SeqCst) as usize) < c.user_data.len() {
                // Zero window probe: this one chunk, then stop.
                done = true;
            } else if bytes_to_send + c.user_data.len() > awnd as usize {
                break;
            }

            // Cleared so the chunk is not re-picked before the next T3
            // expiry marks it again.
            c.retransmit = false;
            bytes_to_send += c.user_data.len();
            c.nsent += 1;

            if let Some(c) = self.inflight_queue.get(tsn) {
                self.check_partial_reliability_status(c);

                log::trace!(
                    "[{}] retransmitting tsn={} ssn={} sent={}",
                    self.name,
                    c.tsn,
                    c.stream_sequence_number,
                    c.nsent
                );

                chunks.push(c.clone());
            }
            i += 1;
        }

        self.bundle_data_chunks_into_packets(chunks)
    }

    fn generate_next_tsn(&mut self) -> u32 {
        let tsn = self.my_next_tsn;
        self.my_next_tsn = self.my_next_tsn.wrapping_add(1);
        tsn
    }

    fn generate_next_rsn(&mut self) -> u32 {
        let rsn = self.my_next_rsn;
        self.my_next_rsn = self.my_next_rsn.wrapping_add(1);
        rsn
    }

    async fn create_selective_ack_chunk(&mut self) -> ChunkSelectiveAck {
        ChunkSelectiveAck {
            cumulative_tsn_ack: self.peer_last_tsn,
            advertised_receiver_window_credit: self.get_my_receiver_window_credit().await,
            gap_ack_blocks: self.payload_queue.get_gap_ack_blocks(self.peer_last_tsn),
            duplicate_tsn: self.payload_queue.pop_duplicates(),
        }
    }

    fn handle_chunks_start(&mut self) {
        self.delayed_ack_triggered = false;
        self.immediate_ack_triggered = false;
    }

    fn handle_chunks_end(&mut self) {
        if self.immediate_ack_triggered {
            self.ack_state = AckState::Immediate;
            if let Some(ack_timer) = &mut self.ack_timer {
                ack_timer.stop();
            }
            self.awake_write_loop();
        } else if self.delayed_ack_triggered {
            self.ack_state = AckState::Delay;
            if let Some(ack_timer) = &mut self.ack_timer {
                ack_timer.start();
            }
        }
    }

    #[allow(clippy::borrowed_box)]
    async fn handle_chunk(
        &mut self,
        p: &Packet,
        chunk: &Box<dyn Chunk + Send + Sync>,
    ) -> Result<()> {
        let chunk_any = chunk.as_any();

        let result = match chunk.check() {
            Ok(()) => {
                if let Some(c) = chunk_any.downcast_ref::<ChunkInit>() {
                    if c.is_ack {
                        self.handle_init_ack(p, c).await
                    } else {
                        self.handle_init(p, c).await
                    }
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkAbort>() {
                    self.handle_abort(c)
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkError>() {
                    // Non-fatal by definition; surface the causes in the
                    // log and move on.
                    let mut err_str = String::new();
                    for cause in &c.error_causes {
                        err_str += format!("({cause})").as_str();
                    }
                    log::warn!("[{}] ERROR chunk received: {}", self.name, err_str);
                    Ok(vec![])
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkHeartbeat>() {
                    self.handle_heartbeat(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkCookieEcho>() {
                    self.handle_cookie_echo(c).await
                } else if chunk_any.downcast_ref::<ChunkCookieAck>().is_some() {
                    self.handle_cookie_ack().await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkPayloadData>() {
                    self.handle_data(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkSelectiveAck>() {
                    self.handle_sack(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkReconfig>() {
                    self.handle_reconfig(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkForwardTsn>() {
                    self.handle_forward_tsn(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkShutdown>() {
                    self.handle_shutdown(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkShutdownAck>() {
                    self.handle_shutdown_ack(c).await
                } else if let Some(c) = chunk_any.downcast_ref::<ChunkShutdownComplete>() {
                    self.handle_shutdown_complete(c).await
                } else {
                    self.handle_unknown_chunk(chunk)
                }
            }
            Err(err) => Err(err),
        };

        // Only an inbound ABORT brings the association down; everything
        // else is logged and absorbed (RFC 4960 error handling, sec 4.2).
        let packets = match result {
            Ok(packets) => packets,
            Err(err @ Error::ErrAbortChunk(_)) => return Err(err),
            Err(err) => {
                log::warn!("[{}] failed to handle chunk: {}", self.name, err);
                vec![]
            }
        };

        if !packets.is_empty() {
            let mut buf: VecDeque<_> = packets.into_iter().collect();
            self.control_queue.append(&mut buf);
            self.awake_write_loop();
        }

        Ok(())
    }

    /// RFC 4960 sec 3: the two high bits of an unrecognized chunk type say
    /// whether to stop processing and whether to report it.
    #[allow(clippy::borrowed_box)]
    fn handle_unknown_chunk(
        &mut self,
        chunk: &Box<dyn Chunk + Send + Sync>,
    ) -> Result<Vec<Packet>> {
        let handle_code = chunk.header().typ.0 >> 6;
        match handle_code {
            0b00 => Err(Error::ErrChunkTypeUnhandled),
            0b01 => {
                let err_chunk = ChunkError {
                    error_causes: vec![ErrorCause {
                        code: UNRECOGNIZED_CHUNK_TYPE,
                        raw: chunk.marshal()?,
                    }],
                };
                let packet = self.create_packet(vec![Box::new(err_chunk)]);
                self.control_queue.push_back(packet);
                self.awake_write_loop();
                Err(Error::ErrChunkTypeUnhandled)
            }
            0b10 => Ok(vec![]),
            0b11 => {
                let err_chunk = ChunkError {
                    error_causes: vec![ErrorCause {
                        code: UNRECOGNIZED_CHUNK_TYPE,
                        raw: chunk.marshal()?,
                    }],
                };
                Ok(vec![self.create_packet(vec![Box::new(err_chunk)])])
            }
            _ => unreachable!("two bits have four values"),
        }
    }

    /// Total user data buffered for sending, pending plus in flight.
    pub(crate) fn buffered_amount(&self) -> usize {
        self.pending_queue.get_num_bytes() + self.inflight_queue.get_num_bytes()
    }
}

#[async_trait]
impl AckTimerObserver for AssociationInternal {
    async fn on_ack_timeout(&mut self) {
        log::trace!(
            "[{}] ack timed out (ack_state: {})",
            self.name,
            self.ack_state
        );
        self.stats.inc_ack_timeouts();
        self.ack_state = AckState::Immediate;
        // The timer is single-shot; mark it stopped so it can be rearmed.
        if let Some(ack_timer) = &mut self.ack_timer {
            ack_timer.stop();
        }
        self.awake_write_loop();
    }
}

#[async_trait]
impl RtxTimerObserver for AssociationInternal {
    async fn on_retransmission_timeout(&mut self, id: RtxTimerId, n_rtos: usize) {
        match id {
            RtxTimerId::T1Init => {
                if let Err(err) = self.send_init() {
                    log::debug!(
                        "[{}] failed to retransmit init (n_rtos={}): {:?}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }

            RtxTimerId::T1Cookie => {
                if let Err(err) = self.send_cookie_echo() {
                    log::debug!(
                        "[{}] failed to retransmit cookie-echo (n_rtos={}): {:?}",
                        self.name,
                        n_rtos,
                        err
                    );
                }
            }

            RtxTimerId::T2Shutdown => {
                log::debug!(
                    "[{}] retransmission of shutdown timeout (n_rtos={})",
                    self.name,
                    n_rtos
                );
                match self.get_state() {
                    AssociationState::ShutdownSent => {
                        self.will_send_shutdown.store(true, Ordering::SeqCst);
                        self.awake_write_loop();
                    }
                    AssociationState::ShutdownAckSent => {
                        self.will_send_shutdown_ack = true;
                        self.awake_write_loop();
                    }
                    _ => {}
                }
            }

            RtxTimerId::T3RTX => {
                self.stats.inc_t3timeouts();
                self.n_t3_expirations += 1;

                // RFC 4960 sec 6.3.3 E1 / sec 7.2.3:
                //   ssthresh = max(cwnd/2, 4*MTU), cwnd = 1*MTU
                self.ssthresh = std::cmp::max(self.cwnd() / 2, 4 * self.mtu);
                self.set_cwnd(self.mtu);
                log::trace!(
                    "[{}] updated cwnd={} ssthresh={} inflight={} (RTO)",
                    self.name,
                    self.cwnd(),
                    self.ssthresh,
                    self.inflight_queue.get_num_bytes()
                );

                // Some peers negotiate zero checksum and then drop packets
                // that use it. Periodically flipping the behavior on
                // repeated timeouts gets data through either kind.
                if self.toggle_checksum_on_rtx
                    && self.zero_checksum_negotiated
                    && self.n_t3_expirations % 3 == 0
                {
                    let flipped = !self.send_zero_checksum.load(Ordering::SeqCst);
                    self.send_zero_checksum.store(flipped, Ordering::SeqCst);
                    log::debug!(
                        "[{}] toggled zero-checksum sending to {}",
                        self.name,
                        flipped
                    );
                }

                // RFC 3758 sec 3.5 A5: try to advance the advanced peer
                // ack point over abandoned chunks on every T3 expiry.
                if self.use_forward_tsn {
                    let mut i = self.advanced_peer_tsn_ack_point.wrapping_add(1);
                    while let Some(c) = self.inflight_queue.get(i) {
                        if !c.abandoned() {
                            break;
                        }
                        self.advanced_peer_tsn_ack_point = i;
                        i = i.wrapping_add(1);
                    }

                    if sna32gt(
                        self.advanced_peer_tsn_ack_point,
                        self.cumulative_tsn_ack_point,
                    ) {
                        self.will_send_forward_tsn = true;
                        log::debug!(
                            "[{}] on_retransmission_timeout: will send forward TSN (advanced={} ack point={})",
                            self.name,
                            self.advanced_peer_tsn_ack_point,
                            self.cumulative_tsn_ack_point
                        );
                    }
                }

                log::debug!(
                    "[{}] T3-rtx timed out: n_rtos={} cwnd={} ssthresh={}",
                    self.name,
                    n_rtos,
                    self.cwnd(),
                    self.ssthresh
                );

                self.inflight_queue.mark_all_to_retransmit();
                self.awake_write_loop();
            }

            RtxTimerId::Reconfig => {
                self.will_retransmit_reconfig = true;
                self.awake_write_loop();
            }
        }
    }

    async fn on_retransmission_failure(&mut self, id: RtxTimerId) {
        match id {
            RtxTimerId::T1Init => {
                log::error!("[{}] retransmission failure: T1-init", self.name);
                if let Some(handshake_completed_ch) = &self.handshake_completed_ch_tx {
                    let _ = handshake_completed_ch
                        .send(Some(Error::ErrHandshakeInitAck))
                        .await;
                }
            }
            RtxTimerId::T1Cookie => {
                log::error!("[{}] retransmission failure: T1-cookie", self.name);
                if let Some(handshake_completed_ch) = &self.handshake_completed_ch_tx {
                    let _ = handshake_completed_ch
                        .send(Some(Error::ErrHandshakeCookieEcho))
                        .await;
                }
            }
            RtxTimerId::T2Shutdown => {
                log::error!("[{}] retransmission failure: T2-shutdown", self.name);
            }
            RtxTimerId::T3RTX => {
                // T3 retransmits forever: connectivity loss is detected by
                // the transport below us, and WebRTC has no defined way to
                // report DATA retransmission failure upward.
                log::error!("[{}] retransmission failure: T3-rtx (DATA)", self.name);
            }
            _ => {}
        }
    }
}
