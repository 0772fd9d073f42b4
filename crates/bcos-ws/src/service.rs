//! Connection pool.
//!
//! [`WsService`] keeps one session per configured peer. A reconnection loop
//! ticks every `reconnect_period`, dialing each peer that has neither a live
//! session nor a connect in flight. A fresh session must complete the
//! handshake before it enters the pool; from then on it is routable by
//! endpoint key, by group and node through the [`Topology`], or as one of the
//! candidates for pick-one dispatch.
//!
//! The pool is the observer of every session it starts. Unsolicited frames
//! are routed by [`MessageType`] to registered handlers; BlockNotify and
//! GroupNotify are also applied internally first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bcos_core::Endpoint;
use bcos_settings::TransportSettings;
use metrics::{counter, gauge};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::Frame;
use crate::connector::{Connector, TcpConnector};
use crate::error::{Result, WsError};
use crate::handshake;
use crate::message::MessageType;
use crate::notify::{BlockNotification, BlockNumbers};
use crate::session::{Reply, ReplyCallback, Session, SessionObserver, SessionRef};
use crate::topology::{GroupInfo, Topology};

/// Handler for unsolicited frames of one type.
pub type MessageHandler = Arc<dyn Fn(Frame, Arc<Session>) + Send + Sync>;

/// Hook run when a session enters or leaves the pool.
pub type SessionHandler = Arc<dyn Fn(Arc<Session>) + Send + Sync>;

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Peers to keep connected.
    pub peers: Vec<Endpoint>,
    /// Reconnection tick.
    pub reconnect_period: Duration,
    /// Deadline for opening a stream.
    pub connect_timeout: Duration,
    /// Deadline for the protocol handshake.
    pub handshake_timeout: Duration,
    /// Timeout for requests that do not name one.
    pub request_timeout: Duration,
    /// Largest inbound message.
    pub max_message_size: usize,
}

impl ServiceConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &TransportSettings) -> bcos_settings::Result<Self> {
        Ok(Self {
            peers: settings.endpoints()?,
            reconnect_period: settings.reconnect_period(),
            connect_timeout: settings.connect_timeout(),
            handshake_timeout: settings.handshake_timeout(),
            request_timeout: settings.request_timeout(),
            max_message_size: settings.max_message_size,
        })
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let defaults = TransportSettings::default();
        Self {
            peers: vec![Endpoint::new("127.0.0.1", 20200)],
            reconnect_period: defaults.reconnect_period(),
            connect_timeout: defaults.connect_timeout(),
            handshake_timeout: defaults.handshake_timeout(),
            request_timeout: defaults.request_timeout(),
            max_message_size: defaults.max_message_size,
        }
    }
}

/// Routing and timeout for one send.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Send only to this endpoint key; `None` picks any live session.
    pub endpoint: Option<String>,
    /// Request timeout; `None` uses the pool default, zero disables it.
    pub timeout: Option<Duration>,
}

impl SendOptions {
    /// Direct send to `endpoint`.
    pub fn to(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            timeout: None,
        }
    }

    /// Override the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Session pool handle. Cheap to clone.
#[derive(Clone)]
pub struct WsService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ServiceConfig,
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    connecting: Mutex<HashSet<String>>,
    handlers: RwLock<HashMap<u16, MessageHandler>>,
    connect_handlers: RwLock<Vec<SessionHandler>>,
    disconnect_handlers: RwLock<Vec<SessionHandler>>,
    topology: Topology,
    blocks: BlockNumbers,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl WsService {
    /// Pool over a custom connector.
    pub fn new(config: ServiceConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                connector,
                sessions: RwLock::new(HashMap::new()),
                connecting: Mutex::new(HashSet::new()),
                handlers: RwLock::new(HashMap::new()),
                connect_handlers: RwLock::new(Vec::new()),
                disconnect_handlers: RwLock::new(Vec::new()),
                topology: Topology::new(),
                blocks: BlockNumbers::new(),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Pool over plain TCP.
    pub fn with_tcp(config: ServiceConfig) -> Self {
        let connector = TcpConnector::new(config.connect_timeout, config.max_message_size);
        Self::new(config, Arc::new(connector))
    }

    /// Spawn the reconnection loop. The first tick fires immediately.
    /// Calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.reconnect_period.max(Duration::from_millis(1));
        info!(
            peers = self.inner.config.peers.len(),
            period_ms = period.as_millis() as u64,
            "starting connection pool"
        );
        let _ = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                inner.reconnect_tick();
            }
            debug!("reconnect loop stopped");
        });
    }

    /// Stop reconnecting. Live sessions stay up until their streams close;
    /// the pool cannot be restarted afterwards.
    pub fn stop(&self) {
        info!(sessions = self.session_count(), "stopping connection pool");
        self.inner.shutdown.cancel();
    }

    /// Close every pooled session now.
    pub fn disconnect_all(&self) {
        let sessions: Vec<Arc<Session>> = self.inner.sessions.read().values().cloned().collect();
        for session in sessions {
            session.disconnect();
        }
    }

    /// Cancelled by [`stop`](Self::stop); background loops built on the pool
    /// stop with it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Active configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Send `frame`, reporting the outcome through `callback`.
    ///
    /// With an endpoint in `options` the frame goes to that session only.
    /// Otherwise a live session is picked at random; with a callback the
    /// remaining sessions are tried in turn until one answers with status 0.
    pub fn send(&self, frame: Frame, options: SendOptions, callback: Option<ReplyCallback>) {
        let timeout = self.inner.timeout_or_default(options.timeout);
        if let Some(endpoint) = options.endpoint {
            match self.session(&endpoint) {
                Some(session) => {
                    let _ = session.send(frame, Some(timeout), callback);
                }
                None => {
                    debug!(endpoint = %endpoint, "no session for direct send");
                    if let Some(callback) = callback {
                        let _ = tokio::spawn(async move {
                            callback(Err(WsError::EndpointNotFound { endpoint }));
                        });
                    }
                }
            }
            return;
        }

        let Some(callback) = callback else {
            let sent = self
                .inner
                .candidates()
                .into_iter()
                .any(|session| session.send(frame.clone(), None, None));
            if !sent {
                debug!("no session for fire-and-forget send");
            }
            return;
        };
        let candidates = self.inner.candidates();
        let _ = tokio::spawn(async move {
            callback(try_candidates(candidates, frame, timeout).await);
        });
    }

    /// Send and await the reply. Routing follows [`send`](Self::send).
    pub async fn request(&self, frame: Frame, options: SendOptions) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.send(
            frame,
            options,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
        );
        rx.await.unwrap_or(Err(WsError::NoSessionAvailable))
    }

    /// Pick-one with retry across every live session.
    pub async fn request_any(&self, frame: Frame, timeout: Option<Duration>) -> Result<Reply> {
        let timeout = self.inner.timeout_or_default(timeout);
        try_candidates(self.inner.candidates(), frame, timeout).await
    }

    /// Pick-one with retry across the sessions serving `group` (and `node`).
    pub async fn request_group(
        &self,
        group: &str,
        node: Option<&str>,
        frame: Frame,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let not_found = || WsError::GroupNotFound {
            group: group.to_owned(),
            node: node.map(str::to_owned),
        };
        let endpoints = match node {
            Some(node) => self.inner.topology.endpoints_for_group_node(group, node),
            None => self.inner.topology.endpoints_for_group(group),
        }
        .ok_or_else(not_found)?;

        let mut candidates: Vec<Arc<Session>> = {
            let sessions = self.inner.sessions.read();
            endpoints
                .iter()
                .filter_map(|endpoint| sessions.get(endpoint))
                .filter(|session| is_routable(session))
                .cloned()
                .collect()
        };
        if candidates.is_empty() {
            return Err(not_found());
        }
        candidates.shuffle(&mut rand::rng());
        let timeout = self.inner.timeout_or_default(timeout);
        try_candidates(candidates, frame, timeout).await
    }

    /// Queue `frame` on every live session without awaiting replies.
    /// Returns the number of sessions reached.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .read()
            .values()
            .filter(|session| is_routable(session))
            .cloned()
            .collect();
        let mut reached = 0;
        for session in sessions {
            if session.send(frame.clone(), None, None) {
                reached += 1;
            } else {
                debug!(endpoint = %session.endpoint(), "broadcast skipped dropped session");
            }
        }
        reached
    }

    /// Route unsolicited frames of `msg_type` to `handler`, replacing any
    /// previous handler for that type.
    pub fn register_handler<F>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(Frame, Arc<Session>) + Send + Sync + 'static,
    {
        let _ = self
            .inner
            .handlers
            .write()
            .insert(msg_type.code(), Arc::new(handler));
    }

    /// Run `handler` for each session that completes the handshake.
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(Arc<Session>) + Send + Sync + 'static,
    {
        self.inner.connect_handlers.write().push(Arc::new(handler));
    }

    /// Run `handler` for each pooled session that drops.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(Arc<Session>) + Send + Sync + 'static,
    {
        self.inner.disconnect_handlers.write().push(Arc::new(handler));
    }

    /// Run `notifier` whenever `group`'s block number increases.
    pub fn register_block_notifier<F>(&self, group: impl Into<String>, notifier: F)
    where
        F: Fn(&str, i64) + Send + Sync + 'static,
    {
        self.inner.blocks.register(group, Arc::new(notifier));
    }

    /// Session for an endpoint key.
    pub fn session(&self, endpoint: &str) -> Option<Arc<Session>> {
        self.inner.sessions.read().get(endpoint).cloned()
    }

    /// Session for a stored reference, if that exact session is still pooled.
    pub fn session_by_ref(&self, session_ref: &SessionRef) -> Option<Arc<Session>> {
        self.session(&session_ref.endpoint)
            .filter(|session| session.id() == session_ref.id)
    }

    /// Every pooled session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.read().values().cloned().collect()
    }

    /// Number of pooled sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Endpoint keys with a pooled session, sorted.
    pub fn connected_endpoints(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Group and node routing maps.
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Highest block number seen for `group`.
    pub fn block_number(&self, group: &str) -> Option<i64> {
        self.inner.blocks.get(group)
    }
}

impl std::fmt::Debug for WsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsService")
            .field("peers", &self.inner.config.peers.len())
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

fn is_routable(session: &Session) -> bool {
    session.is_connected() && session.is_handshaken()
}

async fn try_candidates(candidates: Vec<Arc<Session>>, frame: Frame, timeout: Duration) -> Result<Reply> {
    if candidates.is_empty() {
        return Err(WsError::NoSessionAvailable);
    }
    let attempts = candidates.len();
    let mut last = WsError::NoSessionAvailable;
    for session in candidates {
        match session.request(frame.clone(), timeout).await {
            Ok(reply) if reply.frame.status == 0 => return Ok(reply),
            Ok(reply) => {
                last = WsError::RemoteStatus {
                    status: reply.frame.status,
                };
            }
            Err(e) => last = e,
        }
        debug!(endpoint = %session.endpoint(), error = %last, "candidate failed, trying next");
    }
    Err(WsError::Exhausted {
        attempts,
        last: Box::new(last),
    })
}

impl ServiceInner {
    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.config.request_timeout)
    }

    /// Live handshaken sessions in random order.
    fn candidates(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|session| is_routable(session))
            .cloned()
            .collect();
        sessions.shuffle(&mut rand::rng());
        sessions
    }

    fn reconnect_tick(self: &Arc<Self>) {
        for peer in &self.config.peers {
            let key = peer.key();
            if self.sessions.read().contains_key(&key) {
                continue;
            }
            if !self.connecting.lock().insert(key.clone()) {
                continue;
            }
            let inner = Arc::clone(self);
            let peer = peer.clone();
            let _ = tokio::spawn(async move {
                inner.connect_peer(&peer).await;
                let _ = inner.connecting.lock().remove(&key);
            });
        }
    }

    async fn connect_peer(self: &Arc<Self>, peer: &Endpoint) {
        counter!("ws_connect_attempts_total").increment(1);
        let conn = match self.connector.connect(peer).await {
            Ok(conn) => conn,
            Err(e) => {
                counter!("ws_connect_failures_total", "phase" => e.phase()).increment(1);
                warn!(endpoint = %peer, error = %e, "connect failed, retrying next tick");
                return;
            }
        };

        let observer: Weak<dyn SessionObserver> = Arc::downgrade(self) as Weak<dyn SessionObserver>;
        let session = Session::start(conn, peer.clone(), observer);
        let response = match handshake::perform(&session, self.config.handshake_timeout).await {
            Ok(response) => response,
            Err(e) => {
                counter!("ws_connect_failures_total", "phase" => "protocol").increment(1);
                warn!(endpoint = %peer, error = %e, "protocol handshake failed");
                session.disconnect();
                return;
            }
        };
        if self.shutdown.is_cancelled() {
            session.disconnect();
            return;
        }

        let key = peer.key();
        for info in response.group_info_list {
            self.topology.update(&key, info);
        }
        self.blocks.seed(&response.group_block_number);
        self.register_session(session);
    }

    fn register_session(&self, session: Arc<Session>) {
        let key = session.endpoint().key();
        let (replaced, active) = {
            let mut sessions = self.sessions.write();
            let replaced = sessions.insert(key.clone(), Arc::clone(&session));
            (replaced, sessions.len())
        };
        gauge!("ws_sessions_active").set(active as f64);
        if let Some(old) = replaced {
            old.disconnect();
        }
        if !session.is_connected() {
            // dropped while registering; its disconnect hook may have missed it
            let _ = self.evict(&session);
            return;
        }
        info!(
            endpoint = %key,
            session_id = session.id(),
            protocol_version = session.protocol_version(),
            "session ready"
        );
        let handlers = self.connect_handlers.read().clone();
        for handler in handlers {
            handler(Arc::clone(&session));
        }
    }

    /// Remove `session` if it is still the pooled one for its endpoint, and
    /// prune its topology.
    ///
    /// The prune happens under the session-map write lock: a reconnect to the
    /// same key only starts once the key is absent, so its handshake topology
    /// is always merged after this prune.
    fn evict(&self, session: &Arc<Session>) -> bool {
        let key = session.endpoint().key();
        let mut sessions = self.sessions.write();
        let evicted = match sessions.get(&key) {
            Some(current) if Arc::ptr_eq(current, session) => sessions.remove(&key).is_some(),
            _ => false,
        };
        if evicted {
            self.topology.remove_endpoint(&key);
            gauge!("ws_sessions_active").set(sessions.len() as f64);
        }
        evicted
    }

    fn on_block_notify(&self, session: &Session, frame: &Frame) {
        match serde_json::from_slice::<BlockNotification>(&frame.payload) {
            Ok(notification) => {
                if self.blocks.update(&notification.group, notification.block_number) {
                    debug!(
                        endpoint = %session.endpoint(),
                        group = %notification.group,
                        block_number = notification.block_number,
                        "block number advanced"
                    );
                }
            }
            Err(e) => {
                counter!("ws_frames_dropped_total", "reason" => "payload").increment(1);
                warn!(endpoint = %session.endpoint(), error = %e, "malformed block notification");
            }
        }
    }

    fn on_group_notify(&self, session: &Session, frame: &Frame) {
        match serde_json::from_slice::<GroupInfo>(&frame.payload) {
            Ok(info) => {
                debug!(endpoint = %session.endpoint(), group = %info.group_id, "group info updated");
                self.topology.update(&session.endpoint().key(), info);
            }
            Err(e) => {
                counter!("ws_frames_dropped_total", "reason" => "payload").increment(1);
                warn!(endpoint = %session.endpoint(), error = %e, "malformed group notification");
            }
        }
    }
}

impl SessionObserver for ServiceInner {
    fn on_message(&self, session: &Arc<Session>, frame: Frame) {
        if !session.is_handshaken() {
            counter!("ws_frames_dropped_total", "reason" => "unhandshaken").increment(1);
            warn!(
                endpoint = %session.endpoint(),
                msg_type = frame.msg_type,
                "frame before handshake, dropping session"
            );
            session.disconnect();
            return;
        }

        let Some(msg_type) = frame.message_type() else {
            counter!("ws_frames_dropped_total", "reason" => "unknown_type").increment(1);
            debug!(endpoint = %session.endpoint(), msg_type = frame.msg_type, "unknown message type");
            return;
        };
        let internal = match msg_type {
            MessageType::BlockNotify => {
                self.on_block_notify(session, &frame);
                true
            }
            MessageType::GroupNotify => {
                self.on_group_notify(session, &frame);
                true
            }
            _ => false,
        };

        let handler = self.handlers.read().get(&frame.msg_type).cloned();
        match handler {
            Some(handler) => handler(frame, Arc::clone(session)),
            None if !internal => {
                counter!("ws_frames_dropped_total", "reason" => "unhandled").increment(1);
                debug!(endpoint = %session.endpoint(), %msg_type, "no handler registered");
            }
            None => {}
        }
    }

    fn on_disconnect(&self, session: &Arc<Session>) {
        if !self.evict(session) {
            return;
        }
        let key = session.endpoint().key();
        info!(endpoint = %key, session_id = session.id(), "session left pool");
        let handlers = self.disconnect_handlers.read().clone();
        for handler in handlers {
            handler(Arc::clone(session));
        }
    }
}
