
mod association_internal;
mod association_stats;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{broadcast, mpsc, Mutex};
use util::Conn;

use crate::chunk::chunk_payload_data::PayloadProtocolIdentifier;
use crate::error::{Error, Result};
use crate::stream::Stream;
use crate::timer::ack_timer::{AckTimer, ACK_INTERVAL};
use crate::timer::rtx_timer::{RtxTimer, RtxTimerId, MAX_INIT_RETRANS, NO_MAX_RETRANS};

use association_internal::*;

pub(crate) const RECEIVE_MTU: usize = 8192;
/// MTU assumed for outbound packets until/unless configured otherwise.
pub(crate) const INITIAL_MTU: u32 = 1228;
pub(crate) const INITIAL_RECV_BUF_SIZE: u32 = 1024 * 1024;
pub(crate) const COMMON_HEADER_SIZE: u32 = 12;
pub(crate) const DATA_CHUNK_HEADER_SIZE: u32 = 16;
pub(crate) const DEFAULT_MAX_MESSAGE_SIZE: u32 = 65536;
/// Both ports of a WebRTC association default to 5000.
pub(crate) const DEFAULT_SCTP_PORT: u16 = 5000;

pub(crate) const ACCEPT_CH_SIZE: usize = 16;

/// Association states, RFC 4960 sec 4.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AssociationState {
    Closed = 0,
    CookieWait = 1,
    CookieEchoed = 2,
    Established = 3,
    ShutdownAckSent = 4,
    ShutdownPending = 5,
    ShutdownReceived = 6,
    ShutdownSent = 7,
}

impl From<u8> for AssociationState {
    fn from(v: u8) -> AssociationState {
        match v {
            1 => AssociationState::CookieWait,
            2 => AssociationState::CookieEchoed,
            3 => AssociationState::Established,
            4 => AssociationState::ShutdownAckSent,
            5 => AssociationState::ShutdownPending,
            6 => AssociationState::ShutdownReceived,
            7 => AssociationState::ShutdownSent,
            _ => AssociationState::Closed,
        }
    }
}

impl fmt::Display for AssociationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AssociationState::Closed => "Closed",
            AssociationState::CookieWait => "CookieWait",
            AssociationState::CookieEchoed => "CookieEchoed",
            AssociationState::Established => "Established",
            AssociationState::ShutdownPending => "ShutdownPending",
            AssociationState::ShutdownSent => "ShutdownSent",
            AssociationState::ShutdownReceived => "ShutdownReceived",
            AssociationState::ShutdownAckSent => "ShutdownAckSent",
        };
        write!(f, "{s}")
    }
}

/// SACK timing policy; anything but `Normal` exists for tests.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AckMode {
    #[default]
    Normal,
    NoDelay,
    AlwaysDelay,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckMode::Normal => "Normal",
            AckMode::NoDelay => "NoDelay",
            AckMode::AlwaysDelay => "AlwaysDelay",
        };
        write!(f, "{s}")
    }
}

/// Where the delayed-ack machinery currently stands.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AckState {
    /// ack timer off, nothing owed
    #[default]
    Idle,
    /// a SACK goes out on the next write-loop pass
    Immediate,
    /// ack timer armed
    Delay,
}

impl fmt::Display for AckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            AckState::Idle => "Idle",
            AckState::Immediate => "Immediate",
            AckState::Delay => "Delay",
        };
        write!(f, "{s}")
    }
}

/// Everything needed to construct an association. `new` fills in the
/// defaults; zero means "use the default" for the numeric knobs.
pub struct Config {
    pub net_conn: Arc<dyn Conn + Send + Sync>,
    pub name: String,
    pub max_receive_buffer_size: u32,
    pub max_message_size: u32,
    pub mtu: u32,
    /// Upper bound for the retransmission timeout, in milliseconds.
    pub rto_max: u64,
    /// Floor applied to every congestion-window assignment.
    pub min_cwnd: u32,
    /// Byte budget of one fast-retransmit burst; the effective value is at
    /// least one MTU.
    pub fast_rtx_wnd: u32,
    /// Congestion-avoidance increment; the effective value is at least one
    /// MTU.
    pub cwnd_ca_step: u32,
    /// Advertise RFC 9653 zero-checksum support to the peer.
    pub enable_zero_checksum: bool,
    /// Flip zero-checksum sending on every third T3 retransmission, to get
    /// through to peers that verify checksums despite negotiating them
    /// away.
    pub toggle_checksum_on_rtx: bool,
    /// Make `Stream::write` wait for the previous batch to drain.
    pub block_write: bool,
}

impl Config {
    pub fn new(net_conn: Arc<dyn Conn + Send + Sync>, name: String) -> Self {
        Config {
            net_conn,
            name,
            max_receive_buffer_size: 0,
            max_message_size: 0,
            mtu: 0,
            rto_max: 0,
            min_cwnd: 0,
            fast_rtx_wnd: 0,
            cwnd_ca_step: 0,
            enable_zero_checksum: false,
            toggle_checksum_on_rtx: true,
            block_write: false,
        }
    }
}

/// An SCTP association endpoint over a packet conduit.
///
/// This is the public shell: it owns the read and write tasks and the
/// handful of atomics they share with user code. All protocol state lives
/// in `AssociationInternal` behind one mutex.
pub struct Association {
    name: String,
    state: Arc<AtomicU8>,
    max_message_size: Arc<AtomicU32>,
    inflight_queue_length: Arc<AtomicUsize>,
    will_send_shutdown: Arc<AtomicBool>,
    awake_write_loop_ch: Arc<mpsc::Sender<()>>,
    close_loop_ch_rx: Mutex<broadcast::Receiver<()>>,
    accept_ch_rx: Mutex<mpsc::Receiver<Arc<Stream>>>,
    net_conn: Arc<dyn Conn + Send + Sync>,
    bytes_received: Arc<AtomicUsize>,
    bytes_sent: Arc<AtomicUsize>,
    mtu: u32,
    cwnd: Arc<AtomicU32>,
    rwnd: Arc<AtomicU32>,
    srtt: Arc<AtomicU64>,

    pub(crate) association_internal: Arc<Mutex<AssociationInternal>>,
}

impl Association {
    /// Waits for a peer's handshake and accepts the association.
    pub async fn server(config: Config) -> Result<Self> {
        let (a, mut handshake_completed_ch_rx) = Association::new(config, false).await?;

        match handshake_completed_ch_rx.recv().await {
            Some(None) => Ok(a),
            Some(Some(err)) => Err(err),
            None => Err(Error::ErrAssociationHandshakeClosed),
        }
    }

    /// Initiates the handshake and returns once it completes.
    pub async fn client(config: Config) -> Result<Self> {
        let (a, mut handshake_completed_ch_rx) = Association::new(config, true).await?;

        match handshake_completed_ch_rx.recv().await {
            Some(None) => Ok(a),
            Some(Some(err)) => Err(err),
            None => Err(Error::ErrAssociationHandshakeClosed),
        }
    }

    async fn new(config: Config, is_client: bool) -> Result<(Self, mpsc::Receiver<Option<Error>>)> {
        let net_conn = Arc::clone(&config.net_conn);

        let (awake_write_loop_ch_tx, awake_write_loop_ch_rx) = mpsc::channel(1);
        let (accept_ch_tx, accept_ch_rx) = mpsc::channel(ACCEPT_CH_SIZE);
        let (handshake_completed_ch_tx, handshake_completed_ch_rx) = mpsc::channel(1);
        let (close_loop_ch_tx, close_loop_ch_rx) = broadcast::channel(1);
        let (close_loop_ch_rx1, close_loop_ch_rx2) =
            (close_loop_ch_tx.subscribe(), close_loop_ch_tx.subscribe());
        let awake_write_loop_ch = Arc::new(awake_write_loop_ch_tx);

        let rto_max = config.rto_max;
        let ai = AssociationInternal::new(
            config,
            close_loop_ch_tx,
            accept_ch_tx,
            handshake_completed_ch_tx,
            Arc::clone(&awake_write_loop_ch),
        );

        let bytes_received = Arc::new(AtomicUsize::new(0));
        let bytes_sent = Arc::new(AtomicUsize::new(0));
        let name = ai.name.clone();
        let state = Arc::clone(&ai.state);
        let max_message_size = Arc::clone(&ai.max_message_size);
        let inflight_queue_length = Arc::clone(&ai.inflight_queue_length);
        let will_send_shutdown = Arc::clone(&ai.will_send_shutdown);
        let send_zero_checksum = Arc::clone(&ai.send_zero_checksum);
        let mtu = ai.mtu;
        let cwnd = Arc::clone(&ai.cwnd);
        let rwnd = Arc::clone(&ai.rwnd);
        let srtt = Arc::clone(&ai.srtt);

        let name1 = name.clone();
        let name2 = name.clone();

        let bytes_received1 = Arc::clone(&bytes_received);
        let bytes_sent2 = Arc::clone(&bytes_sent);

        let net_conn1 = Arc::clone(&net_conn);
        let net_conn2 = Arc::clone(&net_conn);

        let association_internal = Arc::new(Mutex::new(ai));
        let association_internal1 = Arc::clone(&association_internal);
        let association_internal2 = Arc::clone(&association_internal);

        {
            let weak = Arc::downgrade(&association_internal);

            let mut ai = association_internal.lock().await;
            ai.t1init = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Init,
                MAX_INIT_RETRANS,
                rto_max,
            ));
            ai.t1cookie = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T1Cookie,
                MAX_INIT_RETRANS,
                rto_max,
            ));
            ai.t2shutdown = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T2Shutdown,
                NO_MAX_RETRANS,
                rto_max,
            ));
            ai.t3rtx = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::T3RTX,
                NO_MAX_RETRANS,
                rto_max,
            ));
            ai.treconfig = Some(RtxTimer::new(
                weak.clone(),
                RtxTimerId::Reconfig,
                NO_MAX_RETRANS,
                rto_max,
            ));
            ai.ack_timer = Some(AckTimer::new(weak, ACK_INTERVAL));
        }

        tokio::spawn(async move {
            Association::read_loop(
                name1,
                bytes_received1,
                net_conn1,
                close_loop_ch_rx1,
                association_internal1,
            )
            .await;
        });

        {
            let send_zero_checksum = Arc::clone(&send_zero_checksum);
            tokio::spawn(async move {
                Association::write_loop(
                    name2,
                    bytes_sent2,
                    net_conn2,
                    close_loop_ch_rx2,
                    association_internal2,
                    awake_write_loop_ch_rx,
                    send_zero_checksum,
                )
                .await;
            });
        }

        if is_client {
            let mut ai = association_internal.lock().await;
            ai.set_state(AssociationState::CookieWait);
            ai.store_init();
            ai.send_init()?;
            let rto = ai.rto_mgr.get_rto();
            if let Some(t1init) = &ai.t1init {
                t1init.start(rto).await;
            }
        }

        Ok((
            Association {
                name,
                state,
                max_message_size,
                inflight_queue_length,
                will_send_shutdown,
                awake_write_loop_ch,
                close_loop_ch_rx: Mutex::new(close_loop_ch_rx),
                accept_ch_rx: Mutex::new(accept_ch_rx),
                net_conn,
                bytes_received,
                bytes_sent,
                mtu,
                cwnd,
                rwnd,
                srtt,
                association_internal,
            },
            handshake_completed_ch_rx,
        ))
    }

    async fn read_loop(
        name: String,
        bytes_received: Arc<AtomicUsize>,
        net_conn: Arc<dyn Conn + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        association_internal: Arc<Mutex<AssociationInternal>>,
    ) {
        log::debug!("[{}] read_loop entered", name);

        let mut buffer = vec![0u8; RECEIVE_MTU];
        loop {
            let n = tokio::select! {
                _ = close_loop_ch.recv() => break,
                result = net_conn.recv(&mut buffer) => {
                    match result {
                        Ok(n) => n,
                        Err(err) => {
                            log::warn!("[{}] failed to read packets on net_conn: {}", name, err);
                            break;
                        }
                    }
                }
            };

            // Copy out of the reusable read buffer; the payload travels by
            // reference from here on.
            let inbound = Bytes::from(buffer[..n].to_vec());
            bytes_received.fetch_add(n, Ordering::SeqCst);

            {
                let mut ai = association_internal.lock().await;
                if let Err(err) = ai.handle_inbound(&inbound).await {
                    log::warn!("[{}] failed to handle_inbound: {:?}", name, err);
                    break;
                }
            }
        }

        {
            let mut ai = association_internal.lock().await;
            if let Err(err) = ai.close().await {
                log::warn!("[{}] failed to close association: {:?}", name, err);
            }
        }

        log::debug!("[{}] read_loop exited", name);
    }

    async fn write_loop(
        name: String,
        bytes_sent: Arc<AtomicUsize>,
        net_conn: Arc<dyn Conn + Send + Sync>,
        mut close_loop_ch: broadcast::Receiver<()>,
        association_internal: Arc<Mutex<AssociationInternal>>,
        mut awake_write_loop_ch: mpsc::Receiver<()>,
        send_zero_checksum: Arc<AtomicBool>,
    ) {
        log::debug!("[{}] write_loop entered", name);

        let mut buf = BytesMut::with_capacity(16 * 1024);
        'outer: loop {
            let (packets, continue_loop) = {
                let mut ai = association_internal.lock().await;
                ai.gather_outbound().await
            };

            for raw in &packets {
                buf.clear();
                // Zero-checksum never applies to INIT or COOKIE-ECHO
                // packets (RFC 9653).
                let do_checksum = !send_zero_checksum.load(Ordering::SeqCst)
                    || raw.always_checksummed();
                if let Err(err) = raw.marshal_to(&mut buf, do_checksum) {
                    log::warn!("[{}] failed to serialize a packet: {:?}", name, err);
                    continue;
                }
                match net_conn.send(buf.as_ref()).await {
                    Ok(_) => {
                        bytes_sent.fetch_add(buf.len(), Ordering::SeqCst);
                    }
                    Err(err) => {
                        log::warn!("[{}] failed to write packets on net_conn: {}", name, err);
                        break 'outer;
                    }
                }
            }

            if !continue_loop {
                break;
            }

            tokio::select! {
                _ = awake_write_loop_ch.recv() => {}
                _ = close_loop_ch.recv() => break,
            };
        }

        {
            let mut ai = association_internal.lock().await;
            if let Err(err) = ai.close().await {
                log::warn!("[{}] failed to close association: {:?}", name, err);
            }
        }

        log::debug!("[{}] write_loop exited", name);
    }

    /// Initiates the shutdown sequence and waits for it to complete. Wrap
    /// the call in `tokio::select!` to bound the wait; cancelling the
    /// future does not cancel the in-flight shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        log::debug!("[{}] closing association..", self.name);

        if self.get_state() != AssociationState::Established {
            return Err(Error::ErrShutdownNonEstablished);
        }

        // Attempt a graceful shutdown.
        self.set_state(AssociationState::ShutdownPending);

        if self.inflight_queue_length.load(Ordering::SeqCst) == 0 {
            // Nothing outstanding; the SHUTDOWN can go right away.
            self.will_send_shutdown.store(true, Ordering::SeqCst);
            let _ = self.awake_write_loop_ch.try_send(());
            self.set_state(AssociationState::ShutdownSent);
        }

        {
            let mut close_loop_ch_rx = self.close_loop_ch_rx.lock().await;
            let _ = close_loop_ch_rx.recv().await;
        }

        Ok(())
    }

    /// Sends an ABORT with a User-Initiated-Abort cause carrying `reason`,
    /// then closes.
    pub async fn abort(&self, reason: &str) {
        log::debug!("[{}] aborting association: {}", self.name, reason);

        {
            let mut ai = self.association_internal.lock().await;
            ai.will_send_abort = Some(reason.to_owned());
        }
        let _ = self.awake_write_loop_ch.try_send(());

        {
            let mut close_loop_ch_rx = self.close_loop_ch_rx.lock().await;
            let _ = close_loop_ch_rx.recv().await;
        }
    }

    /// Tears the association down without notifying the peer beyond closing
    /// the conduit.
    pub async fn close(&self) -> Result<()> {
        log::debug!("[{}] closing association..", self.name);

        let _ = self.net_conn.close().await;

        let mut ai = self.association_internal.lock().await;
        ai.close().await
    }

    /// Opens a stream. Fails once the association is shutting down.
    pub async fn open_stream(
        &self,
        stream_identifier: u16,
        default_payload_type: PayloadProtocolIdentifier,
    ) -> Result<Arc<Stream>> {
        match self.get_state() {
            AssociationState::Established
            | AssociationState::CookieWait
            | AssociationState::CookieEchoed => {}
            _ => return Err(Error::ErrAssociationClosed),
        }

        let mut ai = self.association_internal.lock().await;
        ai.open_stream(stream_identifier, default_payload_type)
    }

    /// Yields the next stream opened by the peer; `None` once the
    /// association has closed.
    pub async fn accept_stream(&self) -> Option<Arc<Stream>> {
        let mut accept_ch_rx = self.accept_ch_rx.lock().await;
        accept_ch_rx.recv().await
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent.load(Ordering::SeqCst)
    }

    pub fn bytes_received(&self) -> usize {
        self.bytes_received.load(Ordering::SeqCst)
    }

    /// The maximum message size `Stream::write` accepts.
    pub fn max_message_size(&self) -> u32 {
        self.max_message_size.load(Ordering::SeqCst)
    }

    pub fn set_max_message_size(&self, max_message_size: u32) {
        self.max_message_size
            .store(max_message_size, Ordering::SeqCst);
    }

    /// Current congestion window, in bytes.
    pub fn cwnd(&self) -> u32 {
        self.cwnd.load(Ordering::SeqCst)
    }

    /// Last computed peer receive window, in bytes.
    pub fn rwnd(&self) -> u32 {
        self.rwnd.load(Ordering::SeqCst)
    }

    /// Smoothed round-trip time, in milliseconds; 0 before the first
    /// measurement.
    pub fn srtt(&self) -> u64 {
        self.srtt.load(Ordering::SeqCst)
    }

    /// Path MTU this association packs packets against.
    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Bytes of user data queued or in flight across all streams.
    pub async fn buffered_amount(&self) -> usize {
        let ai = self.association_internal.lock().await;
        ai.buffered_amount()
    }

    fn set_state(&self, new_state: AssociationState) {
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

    fn get_state(&self) -> AssociationState {
        self.state.load(Ordering::SeqCst).into()
    }
}
