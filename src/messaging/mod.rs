//! Durable messaging between the collection and storage sides.
//!
//! - [`broker`]: the connection/channel abstraction and [`Delivery`] handle
//! - [`amqp`]: RabbitMQ over `lapin`
//! - [`memory`]: in-process broker for local runs and tests
//! - [`schema`]: required-field rules per queue
//! - [`publisher`] / [`subscriber`]: reliable publish and consume
//!
//! [`Delivery`]: broker::Delivery

pub mod amqp;
pub mod broker;
pub mod memory;
pub mod publisher;
pub mod schema;
pub mod subscriber;

use crate::errors::Result;
use serde::Serialize;
use serde_json::Value;

pub use broker::{Broker, BrokerChannel, Delivery};
pub use publisher::Publisher;
pub use schema::{
    COLLECTION_STATUS_QUEUE, COLLECTOR_REQUESTS_QUEUE, COMMENTS_QUEUE, METADATA_QUEUE,
};
pub use subscriber::{MessageHandler, Subscriber};

/// A message bound for a named durable queue.
///
/// Every envelope is published persistent; the default exchange routes by
/// queue name.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub queue: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new<T: Serialize>(queue: &str, payload: &T) -> Result<Self> {
        Ok(Self {
            queue: queue.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }
}
