use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Bounded notification channel with a drop-oldest overflow policy: a slow
/// consumer always finds the most recent events, never the most stale.
/// Eviction and enqueue happen under one lock, so a published event is only
/// lost by being displaced by a newer one.
#[derive(Clone)]
pub struct UpdateBus<T> {
    shared: Arc<BusShared<T>>,
}

struct BusShared<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl<T: Send> UpdateBus<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(BusShared {
                queue: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
                capacity: capacity.max(1),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue an event, evicting the oldest pending one on overflow.
    /// Returns false once the bus is closed.
    pub fn publish(&self, event: T) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() == self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
        true
    }

    pub fn try_recv(&self) -> Option<T> {
        self.shared.queue.lock().pop_front()
    }

    /// Await the next event. Returns None once the bus is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            // Register for a wakeup before the emptiness check so a publish
            // between the check and the await is not lost.
            let notified = self.shared.notify.notified();
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting events. Pending ones stay readable until drained.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.lock().is_empty()
    }

    /// Events evicted by the overflow policy since creation.
    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_recv_roundtrip() {
        let bus = UpdateBus::new(8);
        assert!(bus.publish(7u64));
        assert_eq!(bus.recv().await, Some(7));
        assert!(bus.is_empty());
    }

    #[test]
    fn overflow_drops_oldest_and_keeps_newest() {
        let bus = UpdateBus::new(3);
        for i in 0..10u64 {
            assert!(bus.publish(i));
        }
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.dropped_count(), 7);
        assert_eq!(bus.try_recv(), Some(7));
        assert_eq!(bus.try_recv(), Some(8));
        // The most recent publish always survives saturation.
        assert_eq!(bus.try_recv(), Some(9));
        assert_eq!(bus.try_recv(), None);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = UpdateBus::new(0);
        assert!(bus.publish(1u64));
        assert!(bus.publish(2u64));
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.try_recv(), Some(2));
    }

    #[tokio::test]
    async fn close_drains_then_signals_end() {
        let bus = UpdateBus::new(4);
        bus.publish(1u64);
        bus.publish(2u64);
        bus.close();
        assert!(!bus.publish(3u64));
        assert_eq!(bus.recv().await, Some(1));
        assert_eq!(bus.recv().await, Some(2));
        assert_eq!(bus.recv().await, None);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_publish() {
        let bus = UpdateBus::new(4);
        let reader = bus.clone();
        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(42u64);
        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("timely wakeup")
            .expect("join");
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn concurrent_publishers_never_exceed_capacity() {
        let bus = UpdateBus::new(16);
        let publishers: Vec<_> = (0..4u64)
            .map(|p| {
                let bus = bus.clone();
                tokio::spawn(async move {
                    for i in 0..250u64 {
                        bus.publish(p * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in publishers {
            handle.await.expect("publisher");
        }

        assert!(bus.len() <= 16);
        assert_eq!(bus.len() as u64 + bus.dropped_count(), 1000);
    }

    #[tokio::test]
    async fn waiting_consumer_wakes_on_close() {
        let bus: UpdateBus<u64> = UpdateBus::new(4);
        let reader = bus.clone();
        let handle = tokio::spawn(async move { reader.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.close();
        let got = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("timely wakeup")
            .expect("join");
        assert_eq!(got, None);
    }
}
