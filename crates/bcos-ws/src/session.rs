//! One live connection to a node.
//!
//! A [`Session`] owns three tasks over its stream:
//!
//! - **reader**: decodes one [`Frame`] per WebSocket message. A frame whose
//!   seq matches an outstanding request resolves that request; anything else
//!   is queued for the observer.
//! - **writer**: drains the FIFO write queue, so exactly one write is in
//!   flight and concurrent senders never touch the sink directly.
//! - **dispatcher**: hands unmatched frames to the [`SessionObserver`] in
//!   arrival order, off the read path. When the session drops it delivers
//!   whatever the reader already queued, then reports the disconnect, so the
//!   observer sees every frame before the drop.
//!
//! Outstanding requests live in one map of `seq -> {callback, timer}`.
//! Whichever of response, timeout or disconnect removes the entry first owns
//! it, so every callback runs exactly once.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bcos_core::Endpoint;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::codec::{Frame, Seq};
use crate::connector::{Connection, WsStream};
use crate::error::{Result, WsError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A response together with the session it arrived on.
#[derive(Clone, Debug)]
pub struct Reply {
    /// The response frame.
    pub frame: Frame,
    /// Session that delivered it.
    pub session: Arc<Session>,
}

/// Completion for a request. Invoked exactly once.
pub type ReplyCallback = Box<dyn FnOnce(Result<Reply>) + Send + 'static>;

/// Receives what a session cannot resolve itself.
pub trait SessionObserver: Send + Sync + 'static {
    /// A frame with no outstanding request, in arrival order.
    fn on_message(&self, session: &Arc<Session>, frame: Frame);
    /// The session dropped. Called once, after every queued frame has been
    /// passed to [`on_message`](Self::on_message).
    fn on_disconnect(&self, session: &Arc<Session>);
}

/// Stable handle to a session: pool key plus session id.
///
/// Holders look the session up through the pool instead of keeping it alive.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionRef {
    /// Pool key of the connected endpoint.
    pub endpoint: String,
    /// Process-unique session id.
    pub id: u64,
}

struct Pending {
    callback: ReplyCallback,
    timer: Option<JoinHandle<()>>,
}

/// A live, framed WebSocket connection.
pub struct Session {
    id: u64,
    endpoint: Endpoint,
    reported_endpoint: Option<SocketAddr>,
    protocol_version: AtomicU32,
    dropped: AtomicBool,
    pending: Mutex<HashMap<Seq, Pending>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    queued: AtomicUsize,
    dispatch_tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    observer: Weak<dyn SessionObserver>,
}

impl Session {
    /// Take ownership of a connection and spawn its reader, writer and
    /// dispatcher. Must be called inside a Tokio runtime.
    pub fn start(
        conn: Connection,
        endpoint: Endpoint,
        observer: Weak<dyn SessionObserver>,
    ) -> Arc<Self> {
        let (sink, stream) = conn.stream.split();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            endpoint,
            reported_endpoint: conn.peer,
            protocol_version: AtomicU32::new(0),
            dropped: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
            write_tx,
            queued: AtomicUsize::new(0),
            dispatch_tx,
            cancel: CancellationToken::new(),
            observer,
        });

        let _ = tokio::spawn(write_loop(Arc::clone(&session), sink, write_rx));
        let _ = tokio::spawn(read_loop(Arc::clone(&session), stream));
        let _ = tokio::spawn(dispatch_loop(Arc::clone(&session), dispatch_rx));
        debug!(session_id = session.id, endpoint = %session.endpoint, "session started");
        session
    }

    /// Process-unique id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The endpoint that was dialed (the pool key).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Socket address actually reached, if the transport knows it.
    pub fn reported_endpoint(&self) -> Option<SocketAddr> {
        self.reported_endpoint
    }

    /// Key for looking this session up later.
    pub fn session_ref(&self) -> SessionRef {
        SessionRef {
            endpoint: self.endpoint.key(),
            id: self.id,
        }
    }

    /// Negotiated protocol version; 0 until handshaken.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::Acquire)
    }

    pub(crate) fn set_protocol_version(&self, version: u32) {
        self.protocol_version.store(version, Ordering::Release);
    }

    /// Whether the handshake completed.
    pub fn is_handshaken(&self) -> bool {
        self.protocol_version() > 0
    }

    /// Whether the session is still usable.
    pub fn is_connected(&self) -> bool {
        !self.dropped.load(Ordering::Acquire)
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Encoded frames queued but not yet taken by the writer.
    pub fn queue_len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Queue a frame.
    ///
    /// With a callback, the request is registered under `frame.seq` before
    /// the bytes are queued. A non-zero `timeout` arms a timer that fails the
    /// request with [`WsError::Timeout`]; `None` or zero arms nothing.
    /// Returns whether the frame was queued.
    pub fn send(
        self: &Arc<Self>,
        frame: Frame,
        timeout: Option<Duration>,
        callback: Option<ReplyCallback>,
    ) -> bool {
        if !self.is_connected() {
            if let Some(callback) = callback {
                spawn_callback(callback, Err(self.dropped_error()));
            }
            return false;
        }

        let seq = frame.seq;
        if let Some(callback) = callback {
            if !self.register(seq, callback, timeout) {
                return false;
            }
        }

        let _ = self.queued.fetch_add(1, Ordering::AcqRel);
        if self.write_tx.send(frame.encode()).is_err() {
            let _ = self.queued.fetch_sub(1, Ordering::AcqRel);
            self.fail(seq, self.dropped_error());
            return false;
        }

        // a disconnect that drained the map before we registered
        if !self.is_connected() {
            self.fail(seq, self.dropped_error());
            return false;
        }
        true
    }

    /// Send and await the response.
    ///
    /// A zero `timeout` waits until a response arrives or the session drops.
    pub async fn request(self: &Arc<Self>, frame: Frame, timeout: Duration) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let _ = self.send(
            frame,
            Some(timeout),
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.await.unwrap_or_else(|_| Err(self.dropped_error()))
    }

    /// Mark the session unusable, stop its tasks and fail every outstanding
    /// request. The dispatcher notifies the observer once it has drained.
    /// Idempotent.
    pub fn disconnect(self: &Arc<Self>) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let drained: Vec<Pending> = self.pending.lock().drain().map(|(_, p)| p).collect();
        let failed = drained.len();
        for Pending { callback, timer } in drained {
            if let Some(timer) = timer {
                timer.abort();
            }
            spawn_callback(callback, Err(self.dropped_error()));
        }
        info!(
            session_id = self.id,
            endpoint = %self.endpoint,
            failed_requests = failed,
            "session dropped"
        );
    }

    fn dropped_error(&self) -> WsError {
        WsError::SessionDropped {
            endpoint: self.endpoint.key(),
        }
    }

    fn register(self: &Arc<Self>, seq: Seq, callback: ReplyCallback, timeout: Option<Duration>) -> bool {
        match self.pending.lock().entry(seq) {
            Entry::Occupied(_) => {
                spawn_callback(
                    callback,
                    Err(WsError::DuplicateSeq {
                        seq: seq.to_string(),
                    }),
                );
                return false;
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(Pending {
                    callback,
                    timer: None,
                });
            }
        }

        if let Some(timeout) = timeout.filter(|t| !t.is_zero()) {
            let weak = Arc::downgrade(self);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(session) = weak.upgrade() {
                    session.expire(seq, timeout);
                }
            });
            match self.pending.lock().get_mut(&seq) {
                Some(pending) => pending.timer = Some(timer),
                None => timer.abort(),
            }
        }
        true
    }

    /// Claim and resolve a request because its response arrived.
    fn complete(self: &Arc<Self>, frame: Frame) -> std::result::Result<(), Frame> {
        let Some(Pending { callback, timer }) = self.pending.lock().remove(&frame.seq) else {
            return Err(frame);
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        spawn_callback(
            callback,
            Ok(Reply {
                frame,
                session: Arc::clone(self),
            }),
        );
        Ok(())
    }

    /// Claim and resolve a request because its timer fired.
    fn expire(&self, seq: Seq, timeout: Duration) {
        let Some(Pending { callback, .. }) = self.pending.lock().remove(&seq) else {
            return;
        };
        counter!("ws_request_timeouts_total").increment(1);
        debug!(session_id = self.id, %seq, "request timed out");
        callback(Err(WsError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }));
    }

    fn fail(&self, seq: Seq, err: WsError) {
        let Some(Pending { callback, timer }) = self.pending.lock().remove(&seq) else {
            return;
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        spawn_callback(callback, Err(err));
    }

    fn deliver(self: &Arc<Self>, frame: Frame) {
        match self.observer.upgrade() {
            Some(observer) => observer.on_message(self, frame),
            None => debug!(session_id = self.id, "observer gone, frame dropped"),
        }
    }

    /// Returns false when the session should drop.
    fn on_bytes(self: &Arc<Self>, data: &[u8]) -> bool {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                counter!("ws_frames_dropped_total", "reason" => "decode").increment(1);
                warn!(session_id = self.id, endpoint = %self.endpoint, error = %e, "undecodable frame");
                return false;
            }
        };
        if let Err(frame) = self.complete(frame) {
            let _ = self.dispatch_tx.send(frame);
        }
        true
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.key())
            .field("protocol_version", &self.protocol_version())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

fn spawn_callback(callback: ReplyCallback, result: Result<Reply>) {
    let _ = tokio::spawn(async move { callback(result) });
}

#[instrument(skip_all, fields(session_id = session.id, endpoint = %session.endpoint))]
async fn read_loop(session: Arc<Session>, mut stream: SplitStream<WsStream>) {
    loop {
        let next = tokio::select! {
            biased;
            () = session.cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let keep = match next {
            Some(Ok(Message::Binary(data))) => session.on_bytes(&data),
            Some(Ok(Message::Text(text))) => session.on_bytes(text.as_bytes()),
            Some(Ok(Message::Close(_))) | None => {
                debug!("peer closed stream");
                false
            }
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                debug!(error = %e, "read failed");
                false
            }
        };
        if !keep {
            break;
        }
    }
    session.disconnect();
}

#[instrument(skip_all, fields(session_id = session.id, endpoint = %session.endpoint))]
async fn write_loop(
    session: Arc<Session>,
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        let bytes = tokio::select! {
            biased;
            () = session.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let _ = session.queued.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = sink.send(Message::Binary(bytes.into())).await {
            debug!(error = %e, "write failed");
            session.disconnect();
            break;
        }
    }
    let _ = sink.close().await;
}

async fn dispatch_loop(session: Arc<Session>, mut rx: mpsc::UnboundedReceiver<Frame>) {
    loop {
        let frame = tokio::select! {
            biased;
            next = rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            },
            () = session.cancel.cancelled() => break,
        };
        session.deliver(frame);
    }
    // frames the reader queued before the drop
    while let Ok(frame) = rx.try_recv() {
        session.deliver(frame);
    }
    if let Some(observer) = session.observer.upgrade() {
        observer.on_disconnect(&session);
    }
}
