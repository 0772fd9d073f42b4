//! Subscription task registry.
//!
//! Every task has one entry in a single map, tagged with its state:
//!
//! - `Working`: bound to a pooled session, receiving pushes
//! - `Suspended`: its session dropped; waiting for the resync loop
//!
//! A state change is one write under that map's lock, so a task is always
//! findable by pushes and removal always wins over a concurrent suspend.
//!
//! The resync loop runs at the pool's reconnect period. Each suspended task
//! that is not already awaiting an ack is resubscribed under its original id
//! with `fromBlock` raised to its checkpoint. A successful ack makes it
//! working again; a failure leaves it suspended for the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bcos_core::SubscriptionId;
use bcos_ws::{Frame, MessageType, Session, SessionRef, WsError, WsService};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{EventSubError, Result};
use crate::types::{
    EventAck, EventCallback, EventNotice, EventPush, EventSubParams, STATUS_END_OF_PUSH,
    STATUS_SUCCESS, SubscribeRequest, TaskInfo, TaskState, UnsubscribeRequest,
};

struct Task {
    id: SubscriptionId,
    group: String,
    params: EventSubParams,
    checkpoint: Mutex<Option<i64>>,
    callback: EventCallback,
    bound: Mutex<Option<SessionRef>>,
}

impl Task {
    /// Raise the checkpoint; never lowers it.
    fn advance(&self, block: i64) {
        let mut checkpoint = self.checkpoint.lock();
        if checkpoint.is_none_or(|current| block > current) {
            *checkpoint = Some(block);
        }
    }

    fn notify(&self, notice: EventNotice) {
        (self.callback)(&self.id, notice);
    }

    fn info(&self, state: TaskState) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            group: self.group.clone(),
            params: self.params.clone(),
            checkpoint: *self.checkpoint.lock(),
            state,
            session: self.bound.lock().clone(),
        }
    }
}

struct Slot {
    task: Arc<Task>,
    state: TaskState,
}

/// Event subscriptions over a [`WsService`]. Cheap to clone.
#[derive(Clone)]
pub struct EventSub {
    inner: Arc<EventInner>,
}

struct EventInner {
    service: WsService,
    tasks: RwLock<HashMap<SubscriptionId, Slot>>,
    awaiting: Mutex<HashSet<SubscriptionId>>,
    started: AtomicBool,
}

impl EventSub {
    /// Attach to `service`: route pushes here and suspend tasks whose session
    /// drops. Call [`start`](Self::start) to run the resync loop.
    pub fn new(service: WsService) -> Self {
        let inner = Arc::new(EventInner {
            service: service.clone(),
            tasks: RwLock::new(HashMap::new()),
            awaiting: Mutex::new(HashSet::new()),
            started: AtomicBool::new(false),
        });

        let weak: Weak<EventInner> = Arc::downgrade(&inner);
        service.register_handler(MessageType::EventLogPush, move |frame, session| {
            if let Some(inner) = weak.upgrade() {
                inner.on_push(&frame, &session);
            }
        });
        let weak = Arc::downgrade(&inner);
        service.on_disconnect(move |session| {
            if let Some(inner) = weak.upgrade() {
                inner.suspend_session(&session);
            }
        });

        Self { inner }
    }

    /// Spawn the resync loop. It stops with the pool's shutdown token.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.service.shutdown_token();
        let period = self
            .inner
            .service
            .config()
            .reconnect_period
            .max(Duration::from_millis(1));
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
                inner.resync();
            }
            debug!("event resync loop stopped");
        });
    }

    /// Subscribe to logs in `group` matching `params`.
    ///
    /// On success the task is working and `callback` receives its pushes.
    /// On failure `callback` receives the error once and nothing is kept.
    pub async fn subscribe_event<F>(
        &self,
        group: impl Into<String>,
        params: EventSubParams,
        callback: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(&SubscriptionId, EventNotice) + Send + Sync + 'static,
    {
        let task = Arc::new(Task {
            id: SubscriptionId::new(),
            group: group.into(),
            params,
            checkpoint: Mutex::new(None),
            callback: Arc::new(callback),
            bound: Mutex::new(None),
        });
        let id = task.id.clone();
        // registered before the request so an early push finds it
        let _ = self.inner.tasks.write().insert(
            id.clone(),
            Slot {
                task: Arc::clone(&task),
                state: TaskState::Working,
            },
        );

        match self.inner.send_subscribe(&task).await {
            Ok(session_ref) => {
                info!(id = %id, group = %task.group, endpoint = %session_ref.endpoint, "event subscription active");
                self.inner.bind(&task, session_ref);
                Ok(id)
            }
            Err(e) => {
                let _ = self.inner.tasks.write().remove(&id);
                warn!(id = %id, group = %task.group, error = %e, "event subscription failed");
                task.notify(EventNotice::Failed(e.clone()));
                Err(e)
            }
        }
    }

    /// Cancel a subscription.
    ///
    /// A working task is unsubscribed on its session; a suspended one has
    /// nothing to cancel remotely.
    pub async fn unsubscribe_event(&self, id: &SubscriptionId) -> Result<()> {
        let removed = self.inner.tasks.write().remove(id);
        let _ = self.inner.awaiting.lock().remove(id);
        let Some(Slot { task, state }) = removed else {
            return Err(EventSubError::TaskNotFound { id: id.clone() });
        };
        if state == TaskState::Suspended {
            info!(id = %id, "suspended event subscription dropped");
            return Ok(());
        }

        let bound = task.bound.lock().clone();
        let Some(session) = bound.and_then(|r| self.inner.service.session_by_ref(&r)) else {
            debug!(id = %id, "bound session gone, nothing to cancel remotely");
            return Ok(());
        };
        let frame = unsubscribe_frame(&task)?;
        let timeout = self.inner.service.config().request_timeout;
        let reply = session.request(frame, timeout).await?;
        let ack: EventAck = serde_json::from_slice(&reply.frame.payload)?;
        if ack.result != 0 {
            return Err(EventSubError::Rejected {
                id: id.clone(),
                result: ack.result,
            });
        }
        info!(id = %id, "event subscription cancelled");
        Ok(())
    }

    /// Snapshot of one task.
    pub fn task(&self, id: &SubscriptionId) -> Option<TaskInfo> {
        self.inner
            .tasks
            .read()
            .get(id)
            .map(|slot| slot.task.info(slot.state))
    }

    /// Working task ids, sorted.
    pub fn working_ids(&self) -> Vec<SubscriptionId> {
        self.inner.ids_in(TaskState::Working)
    }

    /// Suspended task ids, sorted.
    pub fn suspended_ids(&self) -> Vec<SubscriptionId> {
        self.inner.ids_in(TaskState::Suspended)
    }
}

impl std::fmt::Debug for EventSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSub")
            .field("working", &self.inner.ids_in(TaskState::Working).len())
            .field("suspended", &self.inner.ids_in(TaskState::Suspended).len())
            .finish_non_exhaustive()
    }
}

fn subscribe_frame(task: &Task) -> Result<Frame> {
    let params = task.params.resumed_from(*task.checkpoint.lock());
    let body = SubscribeRequest {
        id: task.id.as_str(),
        group: &task.group,
        params: &params,
    };
    Ok(Frame::new(MessageType::EventSubscribe, serde_json::to_vec(&body)?))
}

fn unsubscribe_frame(task: &Task) -> Result<Frame> {
    let body = UnsubscribeRequest {
        id: task.id.as_str(),
        group: &task.group,
    };
    Ok(Frame::new(MessageType::EventUnsubscribe, serde_json::to_vec(&body)?))
}

impl EventInner {
    fn ids_in(&self, state: TaskState) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, slot)| slot.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Send a subscribe request and check the ack. Prefers sessions serving
    /// the task's group and falls back to any session when none is known.
    async fn send_subscribe(&self, task: &Task) -> Result<SessionRef> {
        let frame = subscribe_frame(task)?;
        let reply = match self
            .service
            .request_group(&task.group, None, frame.clone(), None)
            .await
        {
            Err(WsError::GroupNotFound { .. }) => self.service.request_any(frame, None).await?,
            other => other?,
        };
        let ack: EventAck = serde_json::from_slice(&reply.frame.payload)?;
        if ack.result != 0 {
            return Err(EventSubError::Rejected {
                id: task.id.clone(),
                result: ack.result,
            });
        }
        Ok(reply.session.session_ref())
    }

    /// Bind a working task to the session that acked it. If that session
    /// already left the pool the task is suspended at once.
    fn bind(&self, task: &Arc<Task>, session_ref: SessionRef) {
        *task.bound.lock() = Some(session_ref.clone());
        if self.service.session_by_ref(&session_ref).is_none() {
            let _ = self.suspend_where(|t| Arc::ptr_eq(t, task));
        }
    }

    fn suspend_session(&self, session: &Arc<Session>) {
        let session_ref = session.session_ref();
        let moved = self.suspend_where(|task| task.bound.lock().as_ref() == Some(&session_ref));
        if moved > 0 {
            info!(endpoint = %session_ref.endpoint, tasks = moved, "event subscriptions suspended");
        }
    }

    /// Mark matching working tasks suspended and unbind them. Returns how
    /// many changed. Removed tasks are never touched.
    fn suspend_where(&self, matches: impl Fn(&Arc<Task>) -> bool) -> usize {
        let mut tasks = self.tasks.write();
        let mut moved = 0;
        for slot in tasks.values_mut() {
            if slot.state == TaskState::Working && matches(&slot.task) {
                slot.state = TaskState::Suspended;
                *slot.task.bound.lock() = None;
                moved += 1;
            }
        }
        moved
    }

    fn resync(self: &Arc<Self>) {
        if self.service.session_count() == 0 {
            return;
        }
        let tasks: Vec<Arc<Task>> = self
            .tasks
            .read()
            .values()
            .filter(|slot| slot.state == TaskState::Suspended)
            .map(|slot| Arc::clone(&slot.task))
            .collect();
        for task in tasks {
            if !self.awaiting.lock().insert(task.id.clone()) {
                continue;
            }
            let inner = Arc::clone(self);
            let _ = tokio::spawn(async move { inner.resubscribe(task).await });
        }
    }

    async fn resubscribe(&self, task: Arc<Task>) {
        match self.send_subscribe(&task).await {
            Ok(session_ref) => {
                let resumed = match self.tasks.write().get_mut(&task.id) {
                    Some(slot) if Arc::ptr_eq(&slot.task, &task) => {
                        slot.state = TaskState::Working;
                        true
                    }
                    _ => false,
                };
                if resumed {
                    let checkpoint = *task.checkpoint.lock();
                    info!(
                        id = %task.id,
                        endpoint = %session_ref.endpoint,
                        ?checkpoint,
                        "event subscription resumed"
                    );
                    self.bind(&task, session_ref);
                } else {
                    // unsubscribed while the request was in flight
                    debug!(id = %task.id, "task gone before resubscribe ack, cancelling");
                    if let (Some(session), Ok(frame)) =
                        (self.service.session_by_ref(&session_ref), unsubscribe_frame(&task))
                    {
                        let _ = session.send(frame, None, None);
                    }
                }
            }
            Err(e) => {
                debug!(id = %task.id, error = %e, "resubscribe failed, retrying next tick");
            }
        }
        let _ = self.awaiting.lock().remove(&task.id);
    }

    fn find(&self, id: &SubscriptionId) -> Option<Arc<Task>> {
        self.tasks.read().get(id).map(|slot| Arc::clone(&slot.task))
    }

    fn remove(&self, id: &SubscriptionId) {
        let _ = self.tasks.write().remove(id);
        let _ = self.awaiting.lock().remove(id);
    }

    fn on_push(&self, frame: &Frame, session: &Arc<Session>) {
        let push: EventPush = match serde_json::from_slice(&frame.payload) {
            Ok(push) => push,
            Err(e) => {
                counter!("event_sub_pushes_total", "status" => "malformed").increment(1);
                warn!(endpoint = %session.endpoint(), error = %e, "undecodable event push");
                return;
            }
        };
        let id = SubscriptionId::from(push.id.as_str());
        let Some(task) = self.find(&id) else {
            counter!("event_sub_pushes_total", "status" => "unknown").increment(1);
            debug!(id = %id, "push for unknown subscription");
            return;
        };

        match push.status {
            STATUS_SUCCESS => {
                counter!("event_sub_pushes_total", "status" => "success").increment(1);
                if let Some(block) = push.first_block_number() {
                    task.advance(block);
                }
                task.notify(EventNotice::Logs(push.result));
            }
            STATUS_END_OF_PUSH => {
                counter!("event_sub_pushes_total", "status" => "end").increment(1);
                self.remove(&id);
                info!(id = %id, "event subscription completed");
                task.notify(EventNotice::Completed(push.result));
            }
            status => {
                counter!("event_sub_pushes_total", "status" => "error").increment(1);
                self.remove(&id);
                warn!(id = %id, status, "event subscription ended with error");
                task.notify(EventNotice::Failed(EventSubError::RemoteStatus { id: id.clone(), status }));
            }
        }
    }
}
