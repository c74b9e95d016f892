//! RabbitMQ transport over `lapin`.
//!
//! Queues are durable and messages persistent (`delivery_mode = 2`). With
//! dead-lettering enabled each queue `q` is declared with
//! `x-dead-letter-exchange = q.dlx`, a direct exchange bound to `q.dead`,
//! so messages rejected without requeue are kept rather than dropped.

use super::broker::{dead_letter_queue, Acker, Broker, BrokerChannel, Delivery, DeliveryStream};
use crate::config::BrokerConfig;
use crate::errors::{PipelineError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
    dead_letter: bool,
}

impl AmqpBroker {
    pub fn new(url: &str, dead_letter: bool) -> Self {
        Self {
            url: url.to_string(),
            dead_letter,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(&config.url, config.dead_letter)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(level = "debug", skip(self))]
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PipelineError::Connection(format!("RabbitMQ channel creation failed: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("enabling publisher confirms failed: {e}")))?;

        info!("Connected to RabbitMQ");
        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            dead_letter: self.dead_letter,
            declared: Mutex::new(HashSet::new()),
        }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    dead_letter: bool,
    declared: Mutex<HashSet<String>>,
}

impl AmqpChannel {
    async fn declare_durable(&self, queue: &str, args: FieldTable) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| PipelineError::Connection(format!("declare {queue} failed: {e}")))?;
        Ok(())
    }

    async fn setup_dead_letter(&self, queue: &str) -> Result<String> {
        let dlx = format!("{queue}.dlx");
        let dlq = dead_letter_queue(queue);

        self.channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::Connection(format!("declare {dlx} failed: {e}")))?;
        self.declare_durable(&dlq, FieldTable::default()).await?;
        self.channel
            .queue_bind(&dlq, &dlx, queue, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("bind {dlq} failed: {e}")))?;
        Ok(dlx)
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue) {
            return Ok(());
        }

        let mut args = FieldTable::default();
        if self.dead_letter {
            let dlx = self.setup_dead_letter(queue).await?;
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.as_str().into()),
            );
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(queue.into()),
            );
        }
        self.declare_durable(queue, args).await?;

        declared.insert(queue.to_string());
        debug!(%queue, dead_letter = self.dead_letter, "Declared queue");
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| PipelineError::publish(queue, e))?;
        let confirmation = confirm
            .await
            .map_err(|e| PipelineError::publish(queue, format!("confirm failed: {e}")))?;
        if confirmation.is_nack() {
            return Err(PipelineError::publish(queue, "broker nacked the message"));
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| PipelineError::Connection(format!("failed to set QoS: {e}")))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::Connection(format!("consume {queue} failed: {e}")))?;
        debug!(%queue, %consumer_tag, "Started consumer");

        let stream = consumer.map(|delivery| -> Result<Delivery> {
            let delivery =
                delivery.map_err(|e| PipelineError::Connection(format!("delivery failed: {e}")))?;
            Ok(Delivery::new(
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker {
                    acker: delivery.acker,
                }),
            ))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection
                .close(200, "normal shutdown")
                .await
                .map_err(|e| PipelineError::Connection(format!("close failed: {e}")))?;
            info!("RabbitMQ connection closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::Connection(format!("ack failed: {e}")))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::Connection(format!("reject failed: {e}")))
    }
}
