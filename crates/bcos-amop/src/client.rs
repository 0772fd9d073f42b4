//! Topic registry and routing.
//!
//! The local topic set is synced to nodes as a whole: every subscribe or
//! unsubscribe broadcasts the full set, and each new session gets it from a
//! connect hook. A lost update is repaired by the next one.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bcos_settings::AmopSettings;
use bcos_ws::{Frame, MessageType, Reply, ReplyCallback, SendOptions, Session, TopicFrame, WsService};
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{AmopError, Result};
use crate::message::{AmopKind, AmopMessage, TopicCallback, TopicSync};

/// Topic pub/sub over a [`WsService`]. Cheap to clone.
#[derive(Clone)]
pub struct Amop {
    inner: Arc<AmopInner>,
}

struct AmopInner {
    service: WsService,
    topics: RwLock<BTreeSet<String>>,
    callbacks: DashMap<String, TopicCallback>,
    default_callback: RwLock<Option<TopicCallback>>,
}

impl Amop {
    /// Attach to `service`: route inbound topic frames here and sync the
    /// topic set to every new session.
    pub fn new(service: WsService) -> Self {
        let inner = Arc::new(AmopInner {
            service: service.clone(),
            topics: RwLock::new(BTreeSet::new()),
            callbacks: DashMap::new(),
            default_callback: RwLock::new(None),
        });

        for kind in [AmopKind::Request, AmopKind::Broadcast] {
            let msg_type = match kind {
                AmopKind::Request => MessageType::AmopRequest,
                AmopKind::Broadcast => MessageType::AmopBroadcast,
            };
            let weak: Weak<AmopInner> = Arc::downgrade(&inner);
            service.register_handler(msg_type, move |frame, session| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_topic_frame(kind, &frame, session);
                }
            });
        }

        let weak = Arc::downgrade(&inner);
        service.on_connect(move |session| {
            if let Some(inner) = weak.upgrade() {
                inner.sync_session(&session);
            }
        });

        Self { inner }
    }

    /// Attach and subscribe the configured startup topics.
    pub fn with_settings(service: WsService, settings: &AmopSettings) -> Self {
        let amop = Self::new(service);
        if let Err(e) = amop.subscribe(settings.topics.iter().cloned()) {
            warn!(error = %e, "initial topic sync failed");
        }
        amop
    }

    /// Add topics and sync the full set. Returns the sessions reached.
    pub fn subscribe<I, S>(&self, topics: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut set = self.inner.topics.write();
            for topic in topics {
                let _ = set.insert(topic.into());
            }
        }
        self.inner.sync()
    }

    /// Subscribe `topic` and route its messages to `callback`.
    pub fn subscribe_with<F>(&self, topic: impl Into<String>, callback: F) -> Result<usize>
    where
        F: Fn(AmopMessage) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let _ = self.inner.callbacks.insert(topic.clone(), Arc::new(callback));
        self.subscribe([topic])
    }

    /// Remove topics (and their callbacks) and sync the full set.
    pub fn unsubscribe<I, S>(&self, topics: I) -> Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        {
            let mut set = self.inner.topics.write();
            for topic in &topics {
                let _ = set.remove(topic);
            }
        }
        for topic in &topics {
            let _ = self.inner.callbacks.remove(topic);
        }
        self.inner.sync()
    }

    /// Callback for topics without their own.
    pub fn set_default_callback<F>(&self, callback: F)
    where
        F: Fn(AmopMessage) + Send + Sync + 'static,
    {
        *self.inner.default_callback.write() = Some(Arc::new(callback));
    }

    /// Subscribed topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.inner.topics.read().iter().cloned().collect()
    }

    /// Publish a request on `topic` and await one subscriber's response.
    /// Sessions are tried in random order until one answers with status 0.
    pub async fn publish(
        &self,
        topic: &str,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let frame = topic_frame(MessageType::AmopRequest, topic, data)?;
        counter!("amop_messages_total", "kind" => "publish").increment(1);
        Ok(self.inner.service.request_any(frame, timeout).await?)
    }

    /// Callback form of [`publish`](Self::publish).
    pub fn publish_with(
        &self,
        topic: &str,
        data: impl Into<Bytes>,
        timeout: Option<Duration>,
        callback: ReplyCallback,
    ) -> Result<()> {
        let frame = topic_frame(MessageType::AmopRequest, topic, data)?;
        counter!("amop_messages_total", "kind" => "publish").increment(1);
        self.inner.service.send(
            frame,
            SendOptions {
                endpoint: None,
                timeout,
            },
            Some(callback),
        );
        Ok(())
    }

    /// Send `data` on `topic` to every session. Returns the sessions reached.
    pub fn broadcast(&self, topic: &str, data: impl Into<Bytes>) -> Result<usize> {
        let frame = topic_frame(MessageType::AmopBroadcast, topic, data)?;
        counter!("amop_messages_total", "kind" => "broadcast_out").increment(1);
        Ok(self.inner.service.broadcast(&frame))
    }

    /// Answer a request on the session it came from.
    pub fn respond(&self, message: &AmopMessage, data: impl Into<Bytes>) -> Result<()> {
        let frame = Frame {
            msg_type: MessageType::AmopResponse.code(),
            status: 0,
            seq: message.seq,
            payload: data.into(),
        };
        if message.session.send(frame, None, None) {
            Ok(())
        } else {
            Err(AmopError::OriginClosed {
                endpoint: message.session.endpoint().key(),
            })
        }
    }
}

impl std::fmt::Debug for Amop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Amop")
            .field("topics", &self.topics())
            .finish_non_exhaustive()
    }
}

fn topic_frame(msg_type: MessageType, topic: &str, data: impl Into<Bytes>) -> Result<Frame> {
    let payload = TopicFrame::new(topic, data).encode()?;
    Ok(Frame::new(msg_type, payload))
}

impl AmopInner {
    fn sync_frame(&self) -> Result<Frame> {
        let sync = TopicSync {
            topics: self.topics.read().iter().cloned().collect(),
        };
        Ok(Frame::new(
            MessageType::AmopSubscribeTopics,
            serde_json::to_vec(&sync)?,
        ))
    }

    fn sync(&self) -> Result<usize> {
        let frame = self.sync_frame()?;
        let reached = self.service.broadcast(&frame);
        debug!(reached, "topic set synced");
        Ok(reached)
    }

    fn sync_session(&self, session: &Arc<Session>) {
        match self.sync_frame() {
            Ok(frame) => {
                if !session.send(frame, None, None) {
                    debug!(endpoint = %session.endpoint(), "session closed before topic sync");
                }
            }
            Err(e) => warn!(endpoint = %session.endpoint(), error = %e, "topic sync payload"),
        }
    }

    fn on_topic_frame(&self, kind: AmopKind, frame: &Frame, session: Arc<Session>) {
        let TopicFrame { topic, data } = match TopicFrame::decode(&frame.payload) {
            Ok(tf) => tf,
            Err(e) => {
                counter!("amop_messages_total", "kind" => "malformed").increment(1);
                warn!(endpoint = %session.endpoint(), %kind, error = %e, "undecodable topic frame");
                return;
            }
        };
        counter!("amop_messages_total", "kind" => kind.as_str()).increment(1);

        let callback = self
            .callbacks
            .get(&topic)
            .map(|entry| Arc::clone(entry.value()))
            .or_else(|| self.default_callback.read().clone());
        let Some(callback) = callback else {
            warn!(topic = %topic, %kind, "no callback for topic");
            return;
        };
        callback(AmopMessage {
            topic,
            data,
            seq: frame.seq,
            kind,
            session,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bcos_core::Endpoint;
    use bcos_ws::testutil::{FakeNode, MockConnector, Responder, eventually, handshake_only, node_responder};
    use bcos_ws::{ServiceConfig, WsError};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("127.0.0.1", port)
    }

    fn config(peers: &[Endpoint]) -> ServiceConfig {
        ServiceConfig {
            peers: peers.to_vec(),
            reconnect_period: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            max_message_size: 1 << 20,
        }
    }

    fn offline() -> Amop {
        Amop::new(WsService::new(ServiceConfig::default(), MockConnector::new()))
    }

    async fn pool(connector: &Arc<MockConnector>, peers: &[Endpoint]) -> WsService {
        let service = WsService::new(config(peers), connector.clone());
        service.start();
        eventually("peers pooled", || service.session_count() == peers.len()).await;
        service
    }

    fn last_sync(node: &FakeNode) -> Option<Vec<String>> {
        node.received_of(MessageType::AmopSubscribeTopics)
            .last()
            .map(|f| serde_json::from_slice::<TopicSync>(&f.payload).unwrap().topics)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_owned()).collect()
    }

    /// Answers AmopRequest on `topic` with `reply`, any other topic with status 1.
    fn subscriber(topic: &'static str, reply: &'static [u8]) -> Responder {
        node_responder(vec![], move |frame: &Frame| {
            if frame.message_type() != Some(MessageType::AmopRequest) {
                return Vec::new();
            }
            let status = match TopicFrame::decode(&frame.payload) {
                Ok(tf) if tf.topic == topic => 0,
                _ => 1,
            };
            vec![frame.reply(MessageType::AmopResponse, status, reply)]
        })
    }

    #[test]
    fn empty_subscribe_changes_nothing() {
        let amop = offline();
        assert_eq!(amop.subscribe(["a", "b"]).unwrap(), 0);
        let _ = amop.subscribe(Vec::<String>::new()).unwrap();
        assert_eq!(amop.topics(), strings(&["a", "b"]));
    }

    #[test]
    fn unsubscribe_drops_callback() {
        let amop = offline();
        let _ = amop.subscribe_with("t", |_| {}).unwrap();
        assert!(amop.inner.callbacks.contains_key("t"));
        let _ = amop.unsubscribe(["t"]).unwrap();
        assert!(amop.topics().is_empty());
        assert!(!amop.inner.callbacks.contains_key("t"));
    }

    #[test]
    fn unsubscribe_releases_topic_set_before_touching_callbacks() {
        let amop = offline();
        let _ = amop.subscribe_with("t", |_| {}).unwrap();

        // a held callback entry blocks the callback removal only
        let held = amop.inner.callbacks.get("t").unwrap();
        let worker = {
            let amop = amop.clone();
            std::thread::spawn(move || amop.unsubscribe(["t"]).unwrap())
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let removed = amop
                .inner
                .topics
                .try_read_for(Duration::from_millis(50))
                .is_some_and(|set| !set.contains("t"));
            if removed {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "topic set stayed locked");
        }
        drop(held);

        let _ = worker.join().unwrap();
        assert!(!amop.inner.callbacks.contains_key("t"));
    }

    #[test]
    fn settings_seed_topics() {
        let service = WsService::new(ServiceConfig::default(), MockConnector::new());
        let settings = AmopSettings {
            topics: strings(&["x", "y", "x"]),
        };
        let amop = Amop::with_settings(service, &settings);
        assert_eq!(amop.topics(), strings(&["x", "y"]));
    }

    #[test]
    fn oversized_topic_is_rejected() {
        let amop = offline();
        let topic = "t".repeat(70_000);
        assert_matches!(
            amop.broadcast(&topic, &b"x"[..]),
            Err(AmopError::Codec(bcos_ws::CodecError::TopicTooLong(70_000)))
        );
    }

    proptest! {
        #[test]
        fn subscribe_then_unsubscribe_restores_set(
            prior in proptest::collection::btree_set("p[a-z]{1,6}", 0..8),
            added in proptest::collection::btree_set("t[a-z]{1,6}", 0..8),
        ) {
            let amop = offline();
            let _ = amop.subscribe(prior.iter().cloned()).unwrap();
            let before = amop.topics();
            let _ = amop.subscribe(added.iter().cloned()).unwrap();
            let _ = amop.unsubscribe(added.iter().cloned()).unwrap();
            prop_assert_eq!(amop.topics(), before);
        }
    }

    #[tokio::test]
    async fn subscribe_syncs_full_set_to_every_session() {
        let connector = MockConnector::new();
        let peers = [ep(1), ep(2)];
        for peer in &peers {
            connector.add_node(peer, handshake_only(vec![]));
        }
        let service = pool(&connector, &peers).await;
        let amop = Amop::new(service.clone());

        assert_eq!(amop.subscribe(["b", "a"]).unwrap(), 2);
        assert_eq!(amop.subscribe(["c"]).unwrap(), 2);
        assert_eq!(amop.unsubscribe(["a"]).unwrap(), 2);
        for peer in &peers {
            let node = connector.node(peer).unwrap();
            eventually("three syncs", || {
                node.received_of(MessageType::AmopSubscribeTopics).len() == 3
            })
            .await;
            assert_eq!(last_sync(&node).unwrap(), strings(&["b", "c"]));
        }
        service.stop();
    }

    #[tokio::test]
    async fn new_session_receives_topic_set() {
        let connector = MockConnector::new();
        let a = ep(1);
        connector.add_node(&a, handshake_only(vec![]));
        let service = WsService::new(config(&[a.clone()]), connector.clone());
        let amop = Amop::new(service.clone());
        let _ = amop.subscribe(["early"]).unwrap();

        service.start();
        eventually("session up", || connector.node(&a).is_some()).await;
        let node = connector.node(&a).unwrap();
        eventually("topic sync", || last_sync(&node).is_some()).await;
        assert_eq!(last_sync(&node).unwrap(), strings(&["early"]));
        service.stop();
    }

    #[tokio::test]
    async fn publish_returns_subscriber_response() {
        let connector = MockConnector::new();
        let peers = [ep(1), ep(2)];
        connector.add_node(&peers[0], subscriber("other", b"nope"));
        connector.add_node(&peers[1], subscriber("price", b"42"));
        let service = pool(&connector, &peers).await;
        let amop = Amop::new(service.clone());

        let reply = amop.publish("price", &b"query"[..], None).await.unwrap();
        assert_eq!(&reply.frame.payload[..], b"42");
        assert_eq!(reply.frame.message_type(), Some(MessageType::AmopResponse));

        let sent = connector
            .node(&peers[1])
            .unwrap()
            .received_of(MessageType::AmopRequest);
        let tf = TopicFrame::decode(&sent[0].payload).unwrap();
        assert_eq!(tf.topic, "price");
        assert_eq!(&tf.data[..], b"query");
        service.stop();
    }

    #[tokio::test]
    async fn publish_with_calls_back_once() {
        let connector = MockConnector::new();
        let a = ep(1);
        connector.add_node(&a, subscriber("t", b"ok"));
        let service = pool(&connector, &[a]).await;
        let amop = Amop::new(service.clone());

        let results = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&results);
        amop.publish_with(
            "t",
            &b"x"[..],
            None,
            Box::new(move |result: bcos_ws::Result<Reply>| r.lock().push(result.map(|reply| reply.frame.payload))),
        )
        .unwrap();
        eventually("callback", || results.lock().len() == 1).await;
        assert_eq!(results.lock()[0], Ok(Bytes::from_static(b"ok")));
        service.stop();
    }

    #[tokio::test]
    async fn publish_without_sessions_fails() {
        let amop = offline();
        assert_matches!(
            amop.publish("t", &b"x"[..], None).await,
            Err(AmopError::Transport(WsError::NoSessionAvailable))
        );
    }

    #[tokio::test]
    async fn inbound_request_reaches_callback_and_is_answered() {
        let connector = MockConnector::new();
        let a = ep(1);
        connector.add_node(&a, handshake_only(vec![]));
        let service = pool(&connector, &[a.clone()]).await;
        let amop = Amop::new(service.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let responder = amop.clone();
        let _ = amop
            .subscribe_with("orders", move |msg: AmopMessage| {
                s.lock().push((msg.topic.clone(), msg.data.clone(), msg.kind));
                responder.respond(&msg, &b"ack"[..]).unwrap();
            })
            .unwrap();

        let node = connector.node(&a).unwrap();
        let request = Frame::new(
            MessageType::AmopRequest,
            TopicFrame::new("orders", &b"buy"[..]).encode().unwrap(),
        );
        node.push(request.clone());

        eventually("response sent", || {
            !node.received_of(MessageType::AmopResponse).is_empty()
        })
        .await;
        let response = &node.received_of(MessageType::AmopResponse)[0];
        assert_eq!(response.seq, request.seq);
        assert_eq!(&response.payload[..], b"ack");
        assert_eq!(
            *seen.lock(),
            vec![("orders".to_owned(), Bytes::from_static(b"buy"), AmopKind::Request)]
        );
        service.stop();
    }

    #[tokio::test]
    async fn default_callback_and_missing_callback() {
        let connector = MockConnector::new();
        let a = ep(1);
        connector.add_node(&a, handshake_only(vec![]));
        let service = pool(&connector, &[a.clone()]).await;
        let amop = Amop::new(service.clone());
        let node = connector.node(&a).unwrap();
        let push = |topic: &str| {
            node.push(Frame::new(
                MessageType::AmopBroadcast,
                TopicFrame::new(topic, &b"d"[..]).encode().unwrap(),
            ));
        };

        // nobody listening: logged, session unaffected
        push("lost");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(service.session_count(), 1);

        let topics = Arc::new(Mutex::new(Vec::new()));
        let t = Arc::clone(&topics);
        amop.set_default_callback(move |msg| t.lock().push((msg.topic, msg.kind)));
        push("anything");
        eventually("default callback", || topics.lock().len() == 1).await;
        assert_eq!(topics.lock()[0], ("anything".to_owned(), AmopKind::Broadcast));
        service.stop();
    }

    #[tokio::test]
    async fn malformed_topic_frame_is_dropped() {
        let connector = MockConnector::new();
        let a = ep(1);
        connector.add_node(&a, handshake_only(vec![]));
        let service = pool(&connector, &[a.clone()]).await;
        let amop = Amop::new(service.clone());
        let hits = Arc::new(Mutex::new(0));
        let h = Arc::clone(&hits);
        amop.set_default_callback(move |_| *h.lock() += 1);

        let node = connector.node(&a).unwrap();
        node.push(Frame::new(MessageType::AmopBroadcast, &[0u8, 50, b'x'][..]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*hits.lock(), 0);
        assert_eq!(service.session_count(), 1);
        service.stop();
    }

    #[tokio::test]
    async fn broadcast_reaches_all_sessions() {
        let connector = MockConnector::new();
        let peers = [ep(1), ep(2), ep(3)];
        for peer in &peers {
            connector.add_node(peer, handshake_only(vec![]));
        }
        let service = pool(&connector, &peers).await;
        let amop = Amop::new(service.clone());

        assert_eq!(amop.broadcast("news", &b"hello"[..]).unwrap(), 3);
        for peer in &peers {
            let node = connector.node(peer).unwrap();
            eventually("broadcast", || {
                node.received_of(MessageType::AmopBroadcast).len() == 1
            })
            .await;
            let tf = TopicFrame::decode(&node.received_of(MessageType::AmopBroadcast)[0].payload).unwrap();
            assert_eq!(tf.topic, "news");
        }
        service.stop();
    }

    #[tokio::test]
    async fn respond_on_closed_session_fails() {
        let connector = MockConnector::new();
        let a = ep(1);
        connector.add_node(&a, handshake_only(vec![]));
        let service = pool(&connector, &[a.clone()]).await;
        let amop = Amop::new(service.clone());
        let session = service.session(&a.key()).unwrap();
        let msg = AmopMessage {
            topic: "t".into(),
            data: Bytes::new(),
            seq: bcos_ws::Seq::generate(),
            kind: AmopKind::Request,
            session: Arc::clone(&session),
        };
        session.disconnect();
        assert_matches!(amop.respond(&msg, &b"late"[..]), Err(AmopError::OriginClosed { .. }));
        service.stop();
    }
}
