//! Broker abstraction shared by the AMQP and in-memory transports.

use crate::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

/// Suffix of the queue that receives messages rejected without requeue.
pub const DEAD_LETTER_SUFFIX: &str = ".dead";

pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}{DEAD_LETTER_SUFFIX}")
}

/// Opens connections. One call is one connection attempt.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a durable queue. Idempotent.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Publish a persistent message through the default exchange and wait
    /// for the broker to confirm it.
    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Cap unacknowledged deliveries per consumer on this channel.
    async fn set_prefetch(&self, prefetch: u16) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A message handed to a consumer. Must be settled exactly once.
pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject; with `requeue = false` the message goes to the dead-letter
    /// queue when one is configured, otherwise it is discarded.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}
