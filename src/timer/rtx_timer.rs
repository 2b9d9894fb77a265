use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

pub(crate) const RTO_INITIAL: u64 = 3000; // msec
pub(crate) const RTO_MIN: u64 = 1000; // msec
pub(crate) const DEFAULT_RTO_MAX: u64 = 60000; // msec

/// T1-init and T1-cookie give up after this many retransmissions.
pub(crate) const MAX_INIT_RETRANS: usize = 10;
pub(crate) const PATH_MAX_RETRANS: usize = 5;
/// A max-retransmission count of zero means the timer never fails.
pub(crate) const NO_MAX_RETRANS: usize = 0;

/// Names the retransmission timers of an association.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RtxTimerId {
    T1Init,
    T1Cookie,
    T2Shutdown,
    T3RTX,
    Reconfig,
}

impl Default for RtxTimerId {
    fn default() -> Self {
        RtxTimerId::T1Init
    }
}

impl fmt::Display for RtxTimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            RtxTimerId::T1Init => "T1Init",
            RtxTimerId::T1Cookie => "T1Cookie",
            RtxTimerId::T2Shutdown => "T2Shutdown",
            RtxTimerId::T3RTX => "T3RTX",
            RtxTimerId::Reconfig => "Reconfig",
        };
        write!(f, "{s}")
    }
}

/// Smoothed RTT estimator per RFC 6298 (as referenced by RFC 4960
/// sec 6.3.1). All values in milliseconds.
#[derive(Debug)]
pub(crate) struct RtoManager {
    pub(crate) srtt: u64,
    pub(crate) rttvar: f64,
    pub(crate) rto: u64,
    pub(crate) rto_max: u64,
    no_update: bool,
}

impl Default for RtoManager {
    fn default() -> Self {
        RtoManager {
            srtt: 0,
            rttvar: 0.0,
            rto: RTO_INITIAL,
            rto_max: DEFAULT_RTO_MAX,
            no_update: false,
        }
    }
}

impl RtoManager {
    pub(crate) fn new(rto_max: u64) -> Self {
        RtoManager {
            rto_max: if rto_max == 0 { DEFAULT_RTO_MAX } else { rto_max },
            ..Default::default()
        }
    }

    /// Feeds a new RTT measurement and returns the updated SRTT.
    pub(crate) fn set_new_rtt(&mut self, rtt: u64) -> u64 {
        if self.no_update {
            return self.srtt;
        }

        if self.srtt == 0 {
            // First measurement: SRTT = R, RTTVAR = R/2.
            self.srtt = rtt;
            self.rttvar = rtt as f64 / 2.0;
        } else {
            // RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|
            // SRTT   = 7/8 SRTT + 1/8 R
            self.rttvar =
                (6.0 * self.rttvar + (self.srtt as i64 - rtt as i64).abs() as f64 * 2.0) / 8.0;
            self.srtt = (7 * self.srtt + rtt) / 8;
        }

        self.rto = (self.srtt + (4.0 * self.rttvar) as u64).clamp(RTO_MIN, self.rto_max);

        self.srtt
    }

    pub(crate) fn get_rto(&self) -> u64 {
        self.rto
    }

    pub(crate) fn reset(&mut self) {
        if self.no_update {
            return;
        }

        self.srtt = 0;
        self.rttvar = 0.0;
        self.rto = RTO_INITIAL;
    }

    /// Pins the RTO for tests.
    #[cfg(test)]
    pub(crate) fn set_rto(&mut self, rto: u64, no_update: bool) {
        self.rto = rto;
        self.no_update = no_update;
    }
}

/// Exponential backoff: RTO doubles per expiry, capped at `rto_max`.
pub(crate) fn calculate_next_timeout(rto: u64, n_rtos: usize, rto_max: u64) -> u64 {
    if n_rtos < 31 {
        std::cmp::min(rto << n_rtos, rto_max)
    } else {
        rto_max
    }
}

#[async_trait]
pub(crate) trait RtxTimerObserver {
    async fn on_retransmission_timeout(&mut self, timer_id: RtxTimerId, n_rtos: usize);
    async fn on_retransmission_failure(&mut self, timer_id: RtxTimerId);
}

/// One retransmission timer. `start` arms it with the given RTO; each
/// expiry notifies the observer and doubles the next interval. When the
/// retransmission count exceeds `max_retrans` (if nonzero) the observer's
/// failure hook runs once and the timer stops itself.
///
/// The observer is held weakly; the timer dies quietly if the association
/// is already gone when it fires.
#[derive(Debug)]
pub(crate) struct RtxTimer<T: 'static + RtxTimerObserver + Send + Sync> {
    timeout_observer: Weak<Mutex<T>>,
    id: RtxTimerId,
    max_retrans: usize,
    rto_max: u64,
    close_tx: Arc<Mutex<Option<mpsc::Sender<()>>>>,
}

impl<T: 'static + RtxTimerObserver + Send + Sync> RtxTimer<T> {
    pub(crate) fn new(
        timeout_observer: Weak<Mutex<T>>,
        id: RtxTimerId,
        max_retrans: usize,
        rto_max: u64,
    ) -> Self {
        RtxTimer {
            timeout_observer,
            id,
            max_retrans,
            rto_max: if rto_max == 0 { DEFAULT_RTO_MAX } else { rto_max },
            close_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Arms the timer. A timer that is already running keeps its original
    /// schedule; the call reports false and changes nothing.
    pub(crate) async fn start(&self, rto: u64) -> bool {
        {
            let mut close_tx = self.close_tx.lock().await;
            if close_tx.is_some() {
                return false;
            }

            let (tx, rx) = mpsc::channel(1);
            *close_tx = Some(tx.clone());
            drop(close_tx);

            let id = self.id;
            let max_retrans = self.max_retrans;
            let rto_max = self.rto_max;
            let observer = self.timeout_observer.clone();
            let close_slot = Arc::clone(&self.close_tx);

            tokio::spawn(Self::run(
                observer, id, max_retrans, rto, rto_max, rx, tx, close_slot,
            ));
        }

        true
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        observer: Weak<Mutex<T>>,
        id: RtxTimerId,
        max_retrans: usize,
        rto: u64,
        rto_max: u64,
        mut close_rx: mpsc::Receiver<()>,
        own_tx: mpsc::Sender<()>,
        close_slot: Arc<Mutex<Option<mpsc::Sender<()>>>>,
    ) {
        let mut n_rtos = 0usize;
        loop {
            let interval = calculate_next_timeout(rto, n_rtos, rto_max);
            let timeout = sleep(Duration::from_millis(interval));
            tokio::pin!(timeout);

            tokio::select! {
                _ = timeout.as_mut() => {
                    n_rtos += 1;
                    let observer = match observer.upgrade() {
                        Some(o) => o,
                        None => break,
                    };
                    let mut observer = observer.lock().await;
                    if max_retrans == NO_MAX_RETRANS || n_rtos <= max_retrans {
                        observer.on_retransmission_timeout(id, n_rtos).await;
                    } else {
                        observer.on_retransmission_failure(id).await;
                        drop(observer);

                        // Disarm ourselves, unless the timer was already
                        // restarted with a fresh channel.
                        let mut slot = close_slot.lock().await;
                        if let Some(cur) = &*slot {
                            if cur.same_channel(&own_tx) {
                                slot.take();
                            }
                        }
                        break;
                    }
                }
                _ = close_rx.recv() => break,
            }
        }
    }

    /// Disarms the timer. The spawned task notices the dropped channel the
    /// next time its sleep would have fired.
    pub(crate) async fn stop(&self) {
        self.close_tx.lock().await.take();
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.close_tx.lock().await.is_some()
    }
}
