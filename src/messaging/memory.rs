//! In-process broker.
//!
//! Behaves like the AMQP transport where it matters to the pipeline:
//! queues are FIFO, consumers see at most `prefetch` unsettled deliveries,
//! requeued messages go back to the head flagged as redelivered, and
//! messages rejected without requeue land in `<queue>.dead` when
//! dead-lettering is on. A delivery dropped without being settled is
//! requeued, as the broker does when a channel closes.
//!
//! Connection attempts are counted, and connect or publish failures can be
//! injected, so retry paths can be exercised without a server.

use super::broker::{dead_letter_queue, Acker, Broker, BrokerChannel, Delivery, DeliveryStream};
use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: StoredMessage) {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        self.messages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    queues: DashMap<String, Arc<MemoryQueue>>,
    connect_attempts: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_publishes: AtomicUsize,
    passing_publishes: AtomicUsize,
    dead_letter: bool,
}

impl Inner {
    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_default()
            .value()
            .clone()
    }
}

/// Cheap to clone; clones share queues and counters.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl MemoryBroker {
    pub fn new(dead_letter: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                dead_letter,
                ..Default::default()
            }),
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` publishes fail after the connection is up.
    pub fn fail_next_publishes(&self, n: usize) {
        self.fail_publishes_after(0, n);
    }

    /// Let `skip` publishes through, then fail the `n` after them.
    pub fn fail_publishes_after(&self, skip: usize, n: usize) {
        self.inner.passing_publishes.store(skip, Ordering::SeqCst);
        self.inner.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Enqueue a raw body, bypassing validation and serialisation.
    pub fn inject(&self, queue: &str, body: &[u8]) {
        self.inner.queue(queue).push_back(StoredMessage {
            body: body.to_vec(),
            redelivered: false,
        });
    }

    /// Messages waiting in `queue` (not counting unsettled deliveries).
    pub fn depth(&self, queue: &str) -> usize {
        self.inner.queues.get(queue).map(|q| q.len()).unwrap_or(0)
    }

    /// Remove and return every waiting message in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<Vec<u8>> {
        let q = self.inner.queue(queue);
        std::iter::from_fn(|| q.pop()).map(|m| m.body).collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let attempt = self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if take_one(&self.inner.failing_connects) {
            debug!(attempt, "Injected connection failure");
            return Err(PipelineError::Connection("injected connection failure".into()));
        }
        Ok(Arc::new(MemoryChannel {
            inner: Arc::clone(&self.inner),
            prefetch: AtomicU16::new(0),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
        }))
    }
}

pub struct MemoryChannel {
    inner: Arc<Inner>,
    prefetch: AtomicU16,
    open: AtomicBool,
    closed: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(PipelineError::Connection("channel is closed".into()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.inner.queue(queue);
        if self.inner.dead_letter {
            self.inner.queue(&dead_letter_queue(queue));
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if !take_one(&self.inner.passing_publishes) && take_one(&self.inner.failing_publishes) {
            // A failed publish leaves the channel unusable, as with AMQP.
            self.open.store(false, Ordering::SeqCst);
            return Err(PipelineError::publish(queue, "injected publish failure"));
        }
        self.inner.queue(queue).push_back(StoredMessage {
            body: body.to_vec(),
            redelivered: false,
        });
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let prefetch = match self.prefetch.load(Ordering::SeqCst) {
            0 => Semaphore::MAX_PERMITS,
            n => n as usize,
        };
        let state = ConsumerState {
            queue: self.inner.queue(queue),
            dead: self
                .inner
                .dead_letter
                .then(|| self.inner.queue(&dead_letter_queue(queue))),
            credit: Arc::new(Semaphore::new(prefetch)),
            closed: self.closed.clone(),
        };

        let deliveries = stream::unfold(state, |state| async move {
            let permit = tokio::select! {
                _ = state.closed.cancelled() => return None,
                permit = Arc::clone(&state.credit).acquire_owned() => permit.ok()?,
            };
            loop {
                if let Some(message) = state.queue.pop() {
                    let delivery = Delivery::new(
                        message.body.clone(),
                        message.redelivered,
                        Box::new(MemoryAcker {
                            queue: Arc::clone(&state.queue),
                            dead: state.dead.clone(),
                            message,
                            settled: AtomicBool::new(false),
                            _permit: permit,
                        }),
                    );
                    return Some((Ok(delivery), state));
                }
                tokio::select! {
                    _ = state.closed.cancelled() => return None,
                    _ = state.queue.notify.notified() => {}
                }
            }
        });
        Ok(deliveries.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

struct ConsumerState {
    queue: Arc<MemoryQueue>,
    dead: Option<Arc<MemoryQueue>>,
    credit: Arc<Semaphore>,
    closed: CancellationToken,
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    dead: Option<Arc<MemoryQueue>>,
    message: StoredMessage,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::Connection("delivery already settled".into()));
        }
        Ok(())
    }

    fn requeue(&self) {
        self.queue.push_front(StoredMessage {
            body: self.message.body.clone(),
            redelivered: true,
        });
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        if requeue {
            self.requeue();
        } else if let Some(dead) = &self.dead {
            dead.push_back(StoredMessage {
                body: self.message.body.clone(),
                redelivered: false,
            });
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.requeue();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next(stream: &mut DeliveryStream) -> Option<Delivery> {
        timeout(Duration::from_millis(100), stream.next())
            .await
            .ok()
            .flatten()
            .map(|d| d.unwrap())
    }

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let broker = MemoryBroker::new(true);
        let channel = broker.connect().await.unwrap();
        channel.declare_queue("q").await.unwrap();
        channel.publish("q", b"1").await.unwrap();
        channel.publish("q", b"2").await.unwrap();

        let mut stream = channel.consume("q", "t").await.unwrap();
        let first = next(&mut stream).await.unwrap();
        assert_eq!(first.body, b"1");
        first.ack().await.unwrap();
        let second = next(&mut stream).await.unwrap();
        assert_eq!(second.body, b"2");
        assert!(!second.redelivered);
        second.ack().await.unwrap();
        assert_eq!(broker.depth("q"), 0);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unsettled_deliveries() {
        let broker = MemoryBroker::new(true);
        let channel = broker.connect().await.unwrap();
        channel.set_prefetch(2).await.unwrap();
        for i in 0..3u8 {
            channel.publish("q", &[i]).await.unwrap();
        }

        let mut stream = channel.consume("q", "t").await.unwrap();
        let a = next(&mut stream).await.unwrap();
        let _b = next(&mut stream).await.unwrap();
        assert!(next(&mut stream).await.is_none());
        assert_eq!(broker.depth("q"), 1);

        a.ack().await.unwrap();
        assert_eq!(next(&mut stream).await.unwrap().body, vec![2]);
    }

    #[tokio::test]
    async fn test_requeue_and_dead_letter() {
        let broker = MemoryBroker::new(true);
        let channel = broker.connect().await.unwrap();
        channel.declare_queue("q").await.unwrap();
        channel.publish("q", b"x").await.unwrap();

        let mut stream = channel.consume("q", "t").await.unwrap();
        next(&mut stream).await.unwrap().reject(true).await.unwrap();
        let again = next(&mut stream).await.unwrap();
        assert!(again.redelivered);
        again.reject(false).await.unwrap();

        assert_eq!(broker.depth("q"), 0);
        assert_eq!(broker.drain("q.dead"), vec![b"x".to_vec()]);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = MemoryBroker::new(false);
        let channel = broker.connect().await.unwrap();
        channel.publish("q", b"x").await.unwrap();
        let mut stream = channel.consume("q", "t").await.unwrap();
        drop(next(&mut stream).await.unwrap());
        assert_eq!(broker.depth("q"), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_and_counter() {
        let broker = MemoryBroker::new(true);
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        let channel = broker.connect().await.unwrap();
        assert_eq!(broker.connect_attempts(), 2);

        broker.fail_next_publishes(1);
        assert!(channel.publish("q", b"x").await.is_err());
        assert!(!channel.is_open());
        assert!(channel.publish("q", b"x").await.is_err());

        let channel = broker.connect().await.unwrap();
        broker.fail_publishes_after(1, 1);
        assert!(channel.publish("q", b"x").await.is_ok());
        assert!(channel.publish("q", b"y").await.is_err());
        let channel = broker.connect().await.unwrap();
        assert!(channel.publish("q", b"z").await.is_ok());
        assert_eq!(broker.depth("q"), 2);
    }

    #[tokio::test]
    async fn test_close_ends_consumer_stream() {
        let broker = MemoryBroker::new(true);
        let channel = broker.connect().await.unwrap();
        let mut stream = channel.consume("q", "t").await.unwrap();
        channel.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
