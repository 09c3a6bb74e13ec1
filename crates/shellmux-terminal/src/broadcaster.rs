use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use shellmux_types::ConnectionId;
use tokio::sync::Notify;
use tracing::trace;

/// One chunk handed to a subscriber, with the number of chunks dropped for
/// this subscriber since its previous delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub data: Arc<[u8]>,
    pub dropped: usize,
}

#[derive(Default)]
struct QueueState {
    chunks: VecDeque<Arc<[u8]>>,
    dropped: usize,
    closed: bool,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Never blocks: a full queue loses its oldest chunk instead.
    fn push(&self, chunk: Arc<[u8]>) {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if state.chunks.len() >= self.capacity {
                state.chunks.pop_front();
                state.dropped += 1;
            }
            state.chunks.push_back(chunk);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.notify_one();
    }
}

/// Receiving end handed to a connection by [`OutputBroadcaster::attach`].
pub struct OutputSubscription {
    connection_id: ConnectionId,
    queue: Arc<SubscriberQueue>,
}

impl OutputSubscription {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Next chunk in PTY order, or `None` once the subscription is detached or
    /// the session closed and everything queued has been delivered.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            {
                let mut state = lock(&self.queue.state);
                if let Some(data) = state.chunks.pop_front() {
                    let dropped = std::mem::take(&mut state.dropped);
                    return Some(Delivery { data, dropped });
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Chunks currently waiting in this subscriber's queue
    pub fn pending(&self) -> usize {
        lock(&self.queue.state).chunks.len()
    }
}

/// Output published before anyone attached, bounded like a subscriber queue
#[derive(Default)]
struct Backlog {
    chunks: VecDeque<Arc<[u8]>>,
    dropped: usize,
}

#[derive(Default)]
struct Subscribers {
    queues: HashMap<ConnectionId, Arc<SubscriberQueue>>,
    last_chunk: Option<Arc<[u8]>>,
    /// `None` once the first subscriber has claimed it
    backlog: Option<Backlog>,
    closed: bool,
}

/// Per-session fan-out of PTY output.
///
/// Every subscriber owns a bounded queue; the producer never waits on a
/// consumer, so one slow connection cannot stall the reader loop or any
/// other connection.
pub struct OutputBroadcaster {
    subscribers: Mutex<Subscribers>,
    capacity: usize,
    replay_last_chunk: bool,
}

impl OutputBroadcaster {
    pub fn new(capacity: usize, replay_last_chunk: bool) -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                backlog: Some(Backlog::default()),
                ..Subscribers::default()
            }),
            capacity: capacity.max(1),
            replay_last_chunk,
        }
    }

    /// Register a queue for `connection_id`.
    ///
    /// The first subscriber receives whatever was published before it
    /// arrived. Later ones start at the next published chunk, preceded by the
    /// most recent one when replay is on. Attaching to a closed broadcaster
    /// yields a subscription that drains any unclaimed output and then ends.
    pub fn attach(&self, connection_id: ConnectionId) -> OutputSubscription {
        let queue = Arc::new(SubscriberQueue::new(self.capacity));

        let mut subscribers = lock(&self.subscribers);
        let backlog = subscribers.backlog.take().unwrap_or_default();
        if backlog.chunks.is_empty() {
            if self.replay_last_chunk {
                if let Some(last) = subscribers.last_chunk.clone() {
                    queue.push(last);
                }
            }
        } else {
            let mut state = lock(&queue.state);
            state.chunks = backlog.chunks;
            state.dropped = backlog.dropped;
        }

        if subscribers.closed {
            queue.close();
        } else if let Some(previous) = subscribers.queues.insert(connection_id, queue.clone()) {
            previous.close();
        }
        drop(subscribers);

        OutputSubscription {
            connection_id,
            queue,
        }
    }

    /// Remove a subscriber. Its pending `recv` resolves to `None`.
    pub fn detach(&self, connection_id: ConnectionId) -> bool {
        let removed = lock(&self.subscribers).queues.remove(&connection_id);
        match removed {
            Some(queue) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Push a chunk to every attached subscriber, or hold it for the first
    /// one when nobody has attached yet.
    pub fn publish(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let chunk: Arc<[u8]> = Arc::from(data);
        let mut subscribers = lock(&self.subscribers);
        subscribers.last_chunk = Some(chunk.clone());

        if let Some(backlog) = subscribers.backlog.as_mut() {
            if backlog.chunks.len() >= self.capacity {
                backlog.chunks.pop_front();
                backlog.dropped += 1;
            }
            backlog.chunks.push_back(chunk);
            trace!(bytes = data.len(), held = backlog.chunks.len(), "holding PTY output");
            return;
        }

        trace!(bytes = data.len(), subscribers = subscribers.queues.len(), "publishing PTY output");
        for queue in subscribers.queues.values() {
            queue.push(chunk.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).queues.len()
    }

    /// End every subscription; later attaches finish immediately
    pub fn close(&self) {
        let drained: Vec<_> = {
            let mut subscribers = lock(&self.subscribers);
            subscribers.closed = true;
            subscribers.queues.drain().map(|(_, queue)| queue).collect()
        };
        for queue in drained {
            queue.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use uuid::Uuid;

    async fn recv_now(sub: &OutputSubscription) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("recv should not block when data is queued")
    }

    #[tokio::test]
    async fn test_fan_out_preserves_order() {
        let broadcaster = OutputBroadcaster::new(8, false);
        let a = broadcaster.attach(Uuid::new_v4());
        let b = broadcaster.attach(Uuid::new_v4());

        broadcaster.publish(b"one");
        broadcaster.publish(b"two");

        for sub in [&a, &b] {
            assert_eq!(&*recv_now(sub).await.unwrap().data, b"one");
            assert_eq!(&*recv_now(sub).await.unwrap().data, b"two");
        }
    }

    #[tokio::test]
    async fn test_attach_starts_at_next_chunk() {
        let broadcaster = OutputBroadcaster::new(8, false);
        let _first = broadcaster.attach(Uuid::new_v4());
        broadcaster.publish(b"history");

        let sub = broadcaster.attach(Uuid::new_v4());
        assert_eq!(sub.pending(), 0);

        broadcaster.publish(b"fresh");
        assert_eq!(&*recv_now(&sub).await.unwrap().data, b"fresh");
    }

    #[tokio::test]
    async fn test_first_subscriber_receives_earlier_output() {
        let broadcaster = OutputBroadcaster::new(8, false);
        broadcaster.publish(b"before ");
        broadcaster.publish(b"anyone");

        let first = broadcaster.attach(Uuid::new_v4());
        assert_eq!(&*recv_now(&first).await.unwrap().data, b"before ");
        assert_eq!(&*recv_now(&first).await.unwrap().data, b"anyone");

        let second = broadcaster.attach(Uuid::new_v4());
        assert_eq!(second.pending(), 0);
    }

    #[tokio::test]
    async fn test_earlier_output_is_bounded() {
        let broadcaster = OutputBroadcaster::new(2, false);
        for chunk in [b"1", b"2", b"3"] {
            broadcaster.publish(chunk);
        }

        let sub = broadcaster.attach(Uuid::new_v4());
        let first = recv_now(&sub).await.unwrap();
        assert_eq!(&*first.data, b"2");
        assert_eq!(first.dropped, 1);
        assert_eq!(&*recv_now(&sub).await.unwrap().data, b"3");
    }

    #[tokio::test]
    async fn test_closed_broadcaster_hands_over_unclaimed_output() {
        let broadcaster = OutputBroadcaster::new(8, false);
        broadcaster.publish(b"hello\r\n");
        broadcaster.close();

        let sub = broadcaster.attach(Uuid::new_v4());
        assert_eq!(&*recv_now(&sub).await.unwrap().data, b"hello\r\n");
        assert_eq!(recv_now(&sub).await, None);
    }

    #[tokio::test]
    async fn test_replay_last_chunk_when_enabled() {
        let broadcaster = OutputBroadcaster::new(8, true);
        let _first = broadcaster.attach(Uuid::new_v4());
        broadcaster.publish(b"first");
        broadcaster.publish(b"prompt$ ");

        let sub = broadcaster.attach(Uuid::new_v4());
        assert_eq!(&*recv_now(&sub).await.unwrap().data, b"prompt$ ");
        assert_eq!(sub.pending(), 0);

        broadcaster.publish(b"next");
        assert_eq!(&*recv_now(&sub).await.unwrap().data, b"next");
    }

    #[tokio::test]
    async fn test_replay_and_concurrent_publish_never_skip_a_chunk() {
        let broadcaster = Arc::new(OutputBroadcaster::new(1024, true));
        let _first = broadcaster.attach(Uuid::new_v4());

        let publisher = broadcaster.clone();
        let producer = tokio::task::spawn_blocking(move || {
            for i in 0..200u8 {
                publisher.publish(&[i]);
            }
        });
        tokio::task::yield_now().await;
        let sub = broadcaster.attach(Uuid::new_v4());
        producer.await.unwrap();

        // Replay plus live delivery form one gapless, duplicate-free run
        // ending at the last chunk.
        let mut seen = Vec::new();
        while sub.pending() > 0 {
            seen.push(recv_now(&sub).await.unwrap().data[0]);
        }
        if let Some(&start) = seen.first() {
            let expected: Vec<u8> = (start..200).collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_and_reports_loss() {
        let broadcaster = OutputBroadcaster::new(2, false);
        let sub = broadcaster.attach(Uuid::new_v4());

        broadcaster.publish(b"1");
        broadcaster.publish(b"2");
        broadcaster.publish(b"3");
        broadcaster.publish(b"4");

        let first = recv_now(&sub).await.unwrap();
        assert_eq!(&*first.data, b"3");
        assert_eq!(first.dropped, 2);

        let second = recv_now(&sub).await.unwrap();
        assert_eq!(&*second.data, b"4");
        assert_eq!(second.dropped, 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_affect_fast_one() {
        let broadcaster = OutputBroadcaster::new(4, false);
        let _slow = broadcaster.attach(Uuid::new_v4());
        let fast = broadcaster.attach(Uuid::new_v4());

        for i in 0..100u8 {
            broadcaster.publish(&[i]);
            let delivery = recv_now(&fast).await.unwrap();
            assert_eq!(&*delivery.data, &[i]);
            assert_eq!(delivery.dropped, 0);
        }
    }

    #[tokio::test]
    async fn test_detach_ends_subscription() {
        let broadcaster = OutputBroadcaster::new(4, false);
        let id = Uuid::new_v4();
        let sub = broadcaster.attach(id);

        assert!(broadcaster.detach(id));
        assert!(!broadcaster.detach(id));
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert_eq!(recv_now(&sub).await, None);

        broadcaster.publish(b"after");
        assert_eq!(sub.pending(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let broadcaster = OutputBroadcaster::new(4, false);
        let sub = broadcaster.attach(Uuid::new_v4());
        broadcaster.publish(b"bye");
        broadcaster.close();

        assert_eq!(&*recv_now(&sub).await.unwrap().data, b"bye");
        assert_eq!(recv_now(&sub).await, None);

        let late = broadcaster.attach(Uuid::new_v4());
        assert_eq!(recv_now(&late).await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let broadcaster = Arc::new(OutputBroadcaster::new(4, false));
        let sub = broadcaster.attach(Uuid::new_v4());

        let publisher = broadcaster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(b"late");
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&*delivery.data, b"late");
    }
}
