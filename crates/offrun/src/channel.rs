//! # Control Channel with Async Pump
//!
//! Correlates worker replies with outstanding requests and routes lane notices.
//!
//! The channel spawns a background task that continuously reads from the
//! transport. Replies are matched to their request by sequence number;
//! notices are forwarded to the lane they name. When the transport closes,
//! every outstanding request is failed so that nobody waits forever.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::error::Result;
use crate::frame::Command;
use crate::frame::Inbound;
use crate::frame::Notice;
use crate::frame::Request;
use crate::frame::Response;
use crate::handles::LaneId;
use crate::transport;
use crate::transport::Transport;

type Pending = DashMap<u64, oneshot::Sender<Result<Response>>>;
type Lanes = DashMap<LaneId, mpsc::UnboundedSender<Notice>>;

pub struct Channel {
    transport: Arc<dyn Transport>,
    pending: Arc<Pending>,
    lanes: Arc<Lanes>,
    closed: Arc<AtomicBool>,
    seq_gen: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Takes ownership of the transport and spawns the pump task.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending = Arc::new(DashMap::new());
        let lanes = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let pump = tokio::spawn(Self::pump(
            transport.clone(),
            pending.clone(),
            lanes.clone(),
            closed.clone(),
        ));

        Self {
            transport,
            pending,
            lanes,
            closed,
            seq_gen: AtomicU64::new(1),
            pump: Mutex::new(Some(pump)),
        }
    }

    async fn pump(
        transport: Arc<dyn Transport>,
        pending: Arc<Pending>,
        lanes: Arc<Lanes>,
        closed: Arc<AtomicBool>,
    ) {
        let error = loop {
            match transport.recv().await {
                Ok(Some(Inbound::Reply(reply))) => {
                    match pending.remove(&reply.seq) {
                        Some((_, tx)) => { let _ = tx.send(Ok(reply.status)); }
                        None => tracing::warn!(seq = reply.seq, "reply for unknown request"),
                    }
                }
                Ok(Some(Inbound::Notice { lane, notice })) => {
                    let delivered = lanes
                        .get(&lane)
                        .map(|tx| tx.send(notice).is_ok())
                        .unwrap_or(false);
                    if !delivered {
                        tracing::warn!(%lane, "notice for unknown lane dropped");
                    }
                }
                Ok(None) => {
                    break transport::Error::ConnectionLost("worker closed the channel".into());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "transport error in pump");
                    break e;
                }
            }
        };

        tracing::debug!(reason = %error, "channel pump stopped");
        closed.store(true, Ordering::SeqCst);
        lanes.clear();
        Self::notify_all_pending(&pending, Error::Transport(error));
    }

    /// Fails every outstanding request with the given error.
    fn notify_all_pending(pending: &Pending, error: Error) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends one command and waits for the worker's answer.
    ///
    /// The outer `Result` reports channel failures; the inner one is the
    /// worker's verdict on the command itself.
    pub async fn request(&self, lane: Option<LaneId>, command: Command) -> Result<Response> {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        // the pump may have drained the table before our insert landed
        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(Error::ProcessNotAvailable);
        }

        tracing::trace!(seq, command = command.name(), "send");
        if let Err(e) = self.transport.send(Request { seq, lane, command }).await {
            self.pending.remove(&seq);
            return Err(e.into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ProcessNotAvailable),
        }
    }

    /// Routes notices addressed to `lane` into a fresh receiver.
    pub fn register_lane(&self, lane: LaneId) -> mpsc::UnboundedReceiver<Notice> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lanes.insert(lane, tx);
        rx
    }

    pub fn unregister_lane(&self, lane: LaneId) {
        self.lanes.remove(&lane);
    }

    /// Stops the pump and fails whatever is still outstanding.
    pub fn abort(&self) {
        let pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(pump) = pump {
            pump.abort();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.lanes.clear();
        Self::notify_all_pending(&self.pending, Error::ProcessNotAvailable);
    }

    /// Stops the pump and releases the transport.
    pub async fn shutdown(&self) {
        self.abort();
        self.transport.close().await;
    }
}
