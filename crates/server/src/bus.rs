use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use quorum_protocol::events::SessionEvent;
use quorum_protocol::types::{AgentType, SessionId, ViewerContext, Visibility};

/// Everything the bus needs to know about a freshly committed message in
/// order to fan it out with visibility applied.
#[derive(Debug, Clone)]
pub struct MessageNotice {
    pub id: i64,
    pub sender: String,
    pub sender_type: AgentType,
    pub visibility: Visibility,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

struct Subscriber {
    id: u64,
    viewer: ViewerContext,
    tx: mpsc::Sender<SessionEvent>,
    /// Events that overflowed the queue, held in publish order while the
    /// subscriber is inside its lagging grace window.
    pending: VecDeque<SessionEvent>,
    /// When the subscriber first overflowed; cleared once it drains.
    lagging_since: Option<Instant>,
}

struct BusInner {
    sessions: Mutex<HashMap<SessionId, Vec<Subscriber>>>,
    queue_size: usize,
    grace: Duration,
    next_id: AtomicU64,
    dropped_lagging: AtomicU64,
}

/// Per-session in-process fan-out with bounded per-subscriber queues.
/// Cheap to clone; all clones share the subscriber tables.
///
/// Publishing never blocks. A subscriber whose queue overflows is marked
/// lagging and its surplus events are parked in a bounded pending buffer;
/// if it drains within the grace window the backlog is flushed in order,
/// otherwise it is dropped and the client must reconnect and reconcile via
/// `since_id`. The subscriber table lock is only ever held for map
/// bookkeeping.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

/// Handle owned by a transport connection. Receives the session's events;
/// dropping it unsubscribes.
pub struct Subscription {
    pub session_id: SessionId,
    pub rx: mpsc::Receiver<SessionEvent>,
    id: u64,
    bus: NotificationBus,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.session_id, self.id);
    }
}

impl NotificationBus {
    pub fn new(queue_size: usize, lagging_grace: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sessions: Mutex::new(HashMap::new()),
                queue_size: queue_size.max(1),
                grace: lagging_grace,
                next_id: AtomicU64::new(1),
                dropped_lagging: AtomicU64::new(0),
            }),
        }
    }

    /// Register a subscriber for a session. History is not replayed; the
    /// transport layer reconciles via `since_id` if the client asks.
    pub fn subscribe(&self, session_id: SessionId, viewer: ViewerContext) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.queue_size);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sessions.entry(session_id.clone()).or_default().push(Subscriber {
            id,
            viewer,
            tx,
            pending: VecDeque::new(),
            lagging_since: None,
        });
        drop(sessions);
        tracing::debug!(%session_id, subscriber = id, "Subscriber registered");
        Subscription {
            session_id,
            rx,
            id,
            bus: self.clone(),
        }
    }

    /// Remove a subscriber. Idempotent; called from `Subscription::drop`.
    pub fn unsubscribe(&self, session_id: &SessionId, subscriber_id: u64) {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = sessions.get_mut(session_id) {
            subs.retain(|s| s.id != subscriber_id);
            if subs.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Fan a committed message out to the session's subscribers. Callers
    /// invoke this only after the database transaction committed.
    ///
    /// Subscribers whose view does not include the message get a metadata
    /// heartbeat instead of the full event.
    pub fn publish_message(&self, session_id: &SessionId, notice: &MessageNotice) {
        let full = SessionEvent::MessageAdded {
            id: notice.id,
            sender: notice.sender.clone(),
            visibility: notice.visibility,
            timestamp: notice.timestamp,
        };
        let heartbeat = SessionEvent::MessageHeartbeat {
            id: notice.id,
            timestamp: notice.timestamp,
        };

        self.deliver(session_id, |viewer| {
            if notice
                .visibility
                .visible_to(viewer, &notice.sender, notice.sender_type)
            {
                full.clone()
            } else {
                heartbeat.clone()
            }
        });
    }

    /// Fan out a session lifecycle change.
    pub fn publish_session_updated(&self, session_id: &SessionId, is_active: bool) {
        let event = SessionEvent::SessionUpdated {
            session_id: session_id.clone(),
            is_active,
            timestamp: chrono::Utc::now(),
        };
        self.deliver(session_id, |_| event.clone());
    }

    fn deliver(&self, session_id: &SessionId, event_for: impl Fn(&ViewerContext) -> SessionEvent) {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let Some(subs) = sessions.get_mut(session_id) else {
            return;
        };

        subs.retain_mut(|sub| {
            let event = event_for(&sub.viewer);

            // A lagging subscriber's backlog flushes first so events keep
            // arriving in publish order.
            while let Some(parked) = sub.pending.front() {
                match sub.tx.try_send(parked.clone()) {
                    Ok(()) => {
                        sub.pending.pop_front();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => break,
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }

            if sub.pending.is_empty() {
                match sub.tx.try_send(event) {
                    Ok(()) => {
                        sub.lagging_since = None;
                        true
                    }
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        self.park_or_drop(session_id, sub, event)
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            } else {
                self.park_or_drop(session_id, sub, event)
            }
        });
        if subs.is_empty() {
            sessions.remove(session_id);
        }
    }

    /// Park one overflow event on a lagging subscriber, or drop the
    /// subscriber once its grace window elapsed or the backlog itself
    /// overflows.
    fn park_or_drop(
        &self,
        session_id: &SessionId,
        sub: &mut Subscriber,
        event: SessionEvent,
    ) -> bool {
        let since = *sub.lagging_since.get_or_insert_with(Instant::now);
        if since.elapsed() > self.inner.grace || sub.pending.len() >= self.inner.queue_size {
            self.inner.dropped_lagging.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                %session_id,
                subscriber = sub.id,
                agent_id = %sub.viewer.agent_id,
                backlog = sub.pending.len(),
                "Subscriber lagging past grace, dropping it"
            );
            false
        } else {
            sub.pending.push_back(event);
            true
        }
    }

    /// (total subscribers, sessions with at least one subscriber)
    pub fn counts(&self) -> (usize, usize) {
        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let total = sessions.values().map(Vec::len).sum();
        (total, sessions.len())
    }

    pub fn dropped_lagging(&self) -> u64 {
        self.inner.dropped_lagging.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    /// Grace long enough that tests never cross it by accident.
    const TEST_GRACE: Duration = Duration::from_secs(2);

    fn sid(hex: &str) -> SessionId {
        SessionId::parse(&format!("session_{hex:0>16}")).unwrap()
    }

    fn viewer(agent_id: &str, agent_type: AgentType, is_admin: bool) -> ViewerContext {
        ViewerContext {
            agent_id: agent_id.to_string(),
            agent_type,
            is_admin,
        }
    }

    fn notice(id: i64, sender: &str, visibility: Visibility) -> MessageNotice {
        MessageNotice {
            id,
            sender: sender.to_string(),
            sender_type: AgentType::Claude,
            visibility,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = NotificationBus::new(8, TEST_GRACE);
        let session = sid("a");
        let mut sub = bus.subscribe(session.clone(), viewer("alice", AgentType::Claude, false));

        bus.publish_message(&session, &notice(1, "bob", Visibility::Public));

        match sub.rx.recv().await.unwrap() {
            SessionEvent::MessageAdded { id, sender, .. } => {
                assert_eq!(id, 1);
                assert_eq!(sender, "bob");
            }
            other => panic!("expected MessageAdded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = NotificationBus::new(8, TEST_GRACE);
        let session = sid("b");
        let mut sub = bus.subscribe(session.clone(), viewer("alice", AgentType::Claude, false));

        for i in 1..=5 {
            bus.publish_message(&session, &notice(i, "bob", Visibility::Public));
        }
        for expected in 1..=5 {
            assert_eq!(sub.rx.recv().await.unwrap().message_id(), Some(expected));
        }
    }

    #[tokio::test]
    async fn no_cross_session_delivery() {
        let bus = NotificationBus::new(8, TEST_GRACE);
        let session_a = sid("a1");
        let session_b = sid("b2");
        let mut sub = bus.subscribe(session_a.clone(), viewer("alice", AgentType::Claude, false));

        bus.publish_message(&session_b, &notice(9, "bob", Visibility::Public));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn visibility_denied_subscriber_gets_heartbeat() {
        let bus = NotificationBus::new(8, TEST_GRACE);
        let session = sid("c");
        let mut outsider = bus.subscribe(session.clone(), viewer("eve", AgentType::Generic, false));
        let mut owner = bus.subscribe(session.clone(), viewer("alice", AgentType::Claude, false));

        bus.publish_message(&session, &notice(3, "alice", Visibility::Private));

        match outsider.rx.recv().await.unwrap() {
            SessionEvent::MessageHeartbeat { id, .. } => assert_eq!(id, 3),
            other => panic!("expected heartbeat, got {other:?}"),
        }
        match owner.rx.recv().await.unwrap() {
            SessionEvent::MessageAdded { id, .. } => assert_eq!(id, 3),
            other => panic!("expected MessageAdded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn overflow_marks_lagging_but_does_not_drop_inside_grace() {
        let bus = NotificationBus::new(2, TEST_GRACE);
        let session = sid("d");
        let _sub = bus.subscribe(session.clone(), viewer("slow", AgentType::Claude, false));

        // queue of 2 fills; the third event parks instead of killing the
        // subscriber
        for i in 1..=3 {
            bus.publish_message(&session, &notice(i, "bob", Visibility::Public));
        }
        assert_eq!(bus.counts(), (1, 1));
        assert_eq!(bus.dropped_lagging(), 0);
    }

    #[tokio::test]
    async fn subscriber_that_drains_within_grace_survives_with_order_intact() {
        let bus = NotificationBus::new(2, TEST_GRACE);
        let session = sid("d2");
        let mut sub = bus.subscribe(session.clone(), viewer("slow", AgentType::Claude, false));

        // events 1-2 fill the queue, 3 overflows into the pending backlog
        for i in 1..=3 {
            bus.publish_message(&session, &notice(i, "bob", Visibility::Public));
        }
        assert_eq!(sub.rx.recv().await.unwrap().message_id(), Some(1));
        assert_eq!(sub.rx.recv().await.unwrap().message_id(), Some(2));

        // the next publish flushes the backlog first, then its own event
        bus.publish_message(&session, &notice(4, "bob", Visibility::Public));
        assert_eq!(sub.rx.recv().await.unwrap().message_id(), Some(3));
        assert_eq!(sub.rx.recv().await.unwrap().message_id(), Some(4));

        assert_eq!(bus.counts(), (1, 1));
        assert_eq!(bus.dropped_lagging(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_dropped_after_the_grace_window() {
        let bus = NotificationBus::new(4, Duration::from_millis(50));
        let session = sid("d3");
        let _sub = bus.subscribe(session.clone(), viewer("stuck", AgentType::Claude, false));

        for i in 1..=5 {
            bus.publish_message(&session, &notice(i, "bob", Visibility::Public));
        }
        // overflowed but still inside the window
        assert_eq!(bus.counts(), (1, 1));

        tokio::time::sleep(Duration::from_millis(80)).await;
        bus.publish_message(&session, &notice(6, "bob", Visibility::Public));

        assert_eq!(bus.counts(), (0, 0));
        assert_eq!(bus.dropped_lagging(), 1);
    }

    #[tokio::test]
    async fn runaway_backlog_drops_before_the_grace_expires() {
        let bus = NotificationBus::new(2, TEST_GRACE);
        let session = sid("d4");
        let _sub = bus.subscribe(session.clone(), viewer("stuck", AgentType::Claude, false));

        // queue 2 + pending cap 2; the fifth event exceeds the backlog
        for i in 1..=5 {
            bus.publish_message(&session, &notice(i, "bob", Visibility::Public));
        }
        assert_eq!(bus.counts(), (0, 0));
        assert_eq!(bus.dropped_lagging(), 1);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = NotificationBus::new(8, TEST_GRACE);
        let session = sid("e");
        {
            let _sub = bus.subscribe(session.clone(), viewer("alice", AgentType::Claude, false));
            assert_eq!(bus.counts(), (1, 1));
        }
        assert_eq!(bus.counts(), (0, 0));

        // unsubscribing again is a no-op
        bus.unsubscribe(&session, 999);
        assert_eq!(bus.counts(), (0, 0));
    }

    #[tokio::test]
    async fn session_updated_reaches_all_subscribers() {
        let bus = NotificationBus::new(8, TEST_GRACE);
        let session = sid("f");
        let mut s1 = bus.subscribe(session.clone(), viewer("a", AgentType::Claude, false));
        let mut s2 = bus.subscribe(session.clone(), viewer("b", AgentType::Generic, false));

        bus.publish_session_updated(&session, false);

        for sub in [&mut s1, &mut s2] {
            match sub.rx.recv().await.unwrap() {
                SessionEvent::SessionUpdated { is_active, .. } => assert!(!is_active),
                other => panic!("expected SessionUpdated, got {other:?}"),
            }
        }
    }
}
