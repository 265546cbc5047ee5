//! 进程内发布/订阅总线
//!
//! 每个订阅拥有独立的有界队列和投递线程，与真实中间件一样：
//! 回调在传输层自己的线程上执行，调用方无法控制其时机。
//! 队列满时丢弃新消息并计数（订阅深度默认 10）。

use crate::lifecycle::{NodeContext, NodeGuard, NodeRuntime, NoopRuntime};
use crate::{Message, MessageCallback, SubscriptionHandle, Transport, TransportError, validate_topic};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, trace};

/// 默认订阅队列深度
pub const DEFAULT_QUEUE_DEPTH: usize = 10;

/// 总线计数器快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    /// 成功入队的消息数（按订阅者计）
    pub enqueued: u64,
    /// 回调执行完成的消息数
    pub delivered: u64,
    /// 因队列满被丢弃的消息数
    pub dropped: u64,
    /// 回调 panic 次数
    pub callback_panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    callback_panics: AtomicU64,
    in_flight: AtomicU64,
}

struct Subscriber {
    id: u64,
    tx: Sender<Message>,
    thread: Option<JoinHandle<()>>,
}

struct Inner {
    node: Arc<NodeContext>,
    queue_depth: usize,
    next_id: AtomicU64,
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    counters: Arc<Counters>,
}

/// 进程内总线（可 Clone，多个会话共享同一实例）
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    /// 创建总线（无操作节点运行时，队列深度 10）
    pub fn new() -> Self {
        Self::with_runtime(NoopRuntime, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_runtime(runtime: impl NodeRuntime + 'static, queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                node: NodeContext::new(runtime),
                queue_depth: queue_depth.max(1),
                next_id: AtomicU64::new(1),
                topics: RwLock::new(HashMap::new()),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// 节点上下文（用于检查引用计数）
    pub fn node(&self) -> &Arc<NodeContext> {
        &self.inner.node
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.read().get(topic).map(Vec::len).unwrap_or(0)
    }

    pub fn stats(&self) -> LoopbackStats {
        let c = &self.inner.counters;
        LoopbackStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            callback_panics: c.callback_panics.load(Ordering::Relaxed),
        }
    }

    /// 等待所有已入队消息投递完毕
    ///
    /// 返回 `false` 表示超时。
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.inner.counters.in_flight.load(Ordering::Acquire) > 0 {
            if start.elapsed() >= timeout {
                return false;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        true
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LoopbackTransport {
    fn acquire_node(&self) -> Result<NodeGuard, TransportError> {
        self.inner.node.acquire()
    }

    fn subscribe(
        &self,
        topic: &str,
        callback: Arc<dyn MessageCallback>,
    ) -> Result<SubscriptionHandle, TransportError> {
        validate_topic(topic)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded::<Message>(self.inner.queue_depth);
        let counters = self.inner.counters.clone();
        let thread_topic = topic.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("loopback-{}", id))
            .spawn(move || {
                // 发送端被 drop 后 recv 返回 Err，线程退出
                while let Ok(message) = rx.recv() {
                    let result = catch_unwind(AssertUnwindSafe(|| callback.on_message(&message)));
                    if result.is_err() {
                        counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                        error!(
                            "Callback on '{}' panicked while handling {} message",
                            thread_topic,
                            message.kind()
                        );
                    } else {
                        counters.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    counters.in_flight.fetch_sub(1, Ordering::Release);
                }
                trace!("Delivery thread for '{}' exiting", thread_topic);
            })?;

        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id,
                tx,
                thread: Some(thread),
            });

        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    fn publish(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        validate_topic(topic)?;

        let topics = self.inner.topics.read();
        let Some(subscribers) = topics.get(topic) else {
            trace!("No subscriber on '{}', {} message discarded", topic, message.kind());
            return Ok(());
        };

        let counters = &self.inner.counters;
        for subscriber in subscribers {
            counters.in_flight.fetch_add(1, Ordering::AcqRel);
            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => {
                    counters.enqueued.fetch_add(1, Ordering::Relaxed);
                },
                Err(TrySendError::Full(_)) => {
                    counters.in_flight.fetch_sub(1, Ordering::AcqRel);
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Queue full on '{}' (subscriber {}), message dropped", topic, subscriber.id);
                },
                Err(TrySendError::Disconnected(_)) => {
                    counters.in_flight.fetch_sub(1, Ordering::AcqRel);
                },
            }
        }
        Ok(())
    }

    fn teardown(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let removed = {
            let mut topics = self.inner.topics.write();
            let unknown = || TransportError::UnknownSubscription {
                id: handle.id,
                topic: handle.topic.clone(),
            };
            let subscribers = topics.get_mut(&handle.topic).ok_or_else(unknown)?;
            let index = subscribers
                .iter()
                .position(|s| s.id == handle.id)
                .ok_or_else(unknown)?;
            let removed = subscribers.remove(index);
            if subscribers.is_empty() {
                topics.remove(&handle.topic);
            }
            removed
        };

        shutdown_subscriber(removed);
        Ok(())
    }
}

/// 关闭投递线程：先 drop 发送端，再 join（回调线程内自注销时不 join）
fn shutdown_subscriber(mut subscriber: Subscriber) {
    let thread = subscriber.thread.take();
    drop(subscriber);

    if let Some(handle) = thread
        && handle.thread().id() != std::thread::current().id()
        && handle.join().is_err()
    {
        error!("Loopback delivery thread panicked");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let topics = std::mem::take(self.topics.get_mut());
        for subscriber in topics.into_values().flatten() {
            shutdown_subscriber(subscriber);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JointStateMessage;
    use parking_lot::Mutex;

    fn joint_message(value: f64) -> Message {
        Message::JointState(JointStateMessage::from_positions(["j1"], [value]))
    }

    #[test]
    fn test_publish_delivers_on_delivery_thread() {
        let bus = LoopbackTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let caller = std::thread::current().id();

        let handle = bus
            .subscribe(
                "/joint_states",
                Arc::new(move |msg: &Message| {
                    assert_ne!(std::thread::current().id(), caller);
                    if let Message::JointState(js) = msg {
                        seen_clone.lock().push(js.position[0]);
                    }
                }),
            )
            .unwrap();

        bus.publish("/joint_states", joint_message(1.0)).unwrap();
        bus.publish("/joint_states", joint_message(2.0)).unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)));

        assert_eq!(*seen.lock(), vec![1.0, 2.0]);
        assert_eq!(bus.stats().delivered, 2);

        bus.teardown(handle).unwrap();
        assert_eq!(bus.subscriber_count("/joint_states"), 0);
    }

    #[test]
    fn test_publish_without_subscriber_is_ok() {
        let bus = LoopbackTransport::new();
        assert!(bus.publish("/nobody", joint_message(0.0)).is_ok());
        assert_eq!(bus.stats().enqueued, 0);
    }

    #[test]
    fn test_teardown_unknown_handle() {
        let bus = LoopbackTransport::new();
        let result = bus.teardown(SubscriptionHandle {
            id: 42,
            topic: "/joint_states".to_string(),
        });
        assert!(matches!(
            result,
            Err(TransportError::UnknownSubscription { id: 42, .. })
        ));
    }

    #[test]
    fn test_full_queue_drops_messages() {
        let bus = LoopbackTransport::with_runtime(NoopRuntime, 1);
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

        let handle = bus
            .subscribe(
                "/slow",
                Arc::new(move |_msg: &Message| {
                    let _ = gate_rx.recv_timeout(Duration::from_secs(1));
                }),
            )
            .unwrap();

        // 第一条被投递线程取走并阻塞，第二条占满队列，之后的全部丢弃
        for i in 0..5 {
            bus.publish("/slow", joint_message(i as f64)).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(bus.stats().dropped >= 3, "stats: {:?}", bus.stats());

        for _ in 0..2 {
            let _ = gate_tx.send_timeout((), Duration::from_secs(1));
        }
        assert!(bus.wait_idle(Duration::from_secs(2)));
        bus.teardown(handle).unwrap();
    }

    #[test]
    fn test_callback_panic_does_not_kill_delivery() {
        let bus = LoopbackTransport::new();
        let hits = Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();

        let _handle = bus
            .subscribe(
                "/flaky",
                Arc::new(move |msg: &Message| {
                    if let Message::JointState(js) = msg
                        && js.position[0] < 0.0
                    {
                        panic!("negative position");
                    }
                    hits_clone.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

        bus.publish("/flaky", joint_message(-1.0)).unwrap();
        bus.publish("/flaky", joint_message(1.0)).unwrap();
        assert!(bus.wait_idle(Duration::from_secs(1)));

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(bus.stats().callback_panics, 1);
    }

    #[test]
    fn test_node_shared_between_clones() {
        let bus = LoopbackTransport::new();
        let other = bus.clone();

        let a = bus.acquire_node().unwrap();
        let b = other.acquire_node().unwrap();
        assert_eq!(bus.node().ref_count(), 2);
        drop(a);
        drop(b);
        assert!(!other.node().is_initialized());
    }
}
