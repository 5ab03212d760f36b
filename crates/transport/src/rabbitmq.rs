//! RabbitMQ transport over AMQP 0.9.1.
//!
//! Publishes go through the default exchange with the queue name as routing
//! key on a channel in confirm mode, so a publish only succeeds once the
//! broker acks it. Each consumer gets its own channel so its prefetch (`basic.qos`)
//! bounds only that queue. Rejections never requeue; the queue's
//! dead-letter arguments decide where the message goes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use crate::broker::{Broker, DeliveryStream, Publisher};
use crate::{
    Acknowledger, DeadLetter, Delivery, OutboundMessage, QueueSpec, Result, TransportError,
};

/// RabbitMQ-backed transport.
pub struct RabbitMqTransport {
    connection: Connection,
    channel: Channel,
}

impl RabbitMqTransport {
    /// Connects to the broker at `url` and opens the publishing channel.
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name("order-worker".into()),
        )
        .await
        .map_err(|e| {
            TransportError::Connection(format!("{}: {}", redact(url), e))
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("channel creation failed: {}", e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("confirm mode failed: {}", e)))?;

        tracing::info!(url = %redact(url), "connected to broker");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Tries each URL in turn and returns the first successful connection.
    pub async fn connect_any(urls: &[String]) -> Result<Self> {
        let mut last_error = TransportError::Connection("no broker URL configured".to_string());
        for url in urls {
            match Self::connect(url).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    tracing::warn!(url = %redact(url), error = %e, "broker connection failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Closes the connection, cancelling all consumers.
    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }

    async fn declare_dead_letter(&self, dead_letter: &DeadLetter) -> Result<()> {
        self.channel
            .exchange_declare(
                &dead_letter.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::declare(&dead_letter.exchange, e))?;

        self.channel
            .queue_declare(
                &dead_letter.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::declare(&dead_letter.queue, e))?;

        self.channel
            .queue_bind(
                &dead_letter.queue,
                &dead_letter.exchange,
                &dead_letter.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::declare(&dead_letter.queue, e))?;

        Ok(())
    }
}

/// Turns a broker nack into a publish error. The publishing channel is in
/// confirm mode, so `NotRequested` means the channel lost it.
fn check_confirmation(queue: &str, confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(TransportError::publish(queue, "nacked by broker")),
        Confirmation::NotRequested => Err(TransportError::publish(
            queue,
            "channel is not in confirm mode",
        )),
    }
}

/// Strips credentials from an AMQP URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = spec.message_ttl {
        let millis = i32::try_from(ttl.as_millis()).unwrap_or(i32::MAX);
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(millis));
    }
    if let Some(dead_letter) = &spec.dead_letter {
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter.exchange.clone().into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(dead_letter.routing_key.clone().into()),
        );
    }
    args
}

fn header_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
    }
    table
}

fn string_headers(properties: &BasicProperties) -> BTreeMap<String, String> {
    let Some(table) = properties.headers() else {
        return BTreeMap::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(value) => Some((key.to_string(), value.to_string())),
            AMQPValue::ShortString(value) => Some((key.to_string(), value.to_string())),
            _ => None,
        })
        .collect()
}

struct AmqpAcker {
    queue: String,
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::acknowledge(&self.queue, e))
    }

    async fn reject(&self) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| TransportError::acknowledge(&self.queue, e))
    }
}

#[async_trait]
impl Publisher for RabbitMqTransport {
    async fn publish(&self, queue: &str, message: OutboundMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(message.message_id.to_string().into())
            .with_headers(header_table(&message.headers));

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::publish(queue, e))?;

        let confirmation = confirm
            .await
            .map_err(|e| TransportError::publish(queue, format!("confirmation failed: {}", e)))?;
        check_confirmation(queue, confirmation)?;

        metrics::counter!("transport_published_total", "queue" => queue.to_string()).increment(1);
        tracing::debug!(queue, message_id = %message.message_id, "message published");
        Ok(())
    }
}

#[async_trait]
impl Broker for RabbitMqTransport {
    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        if let Some(dead_letter) = &spec.dead_letter {
            self.declare_dead_letter(dead_letter).await?;
        }

        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map_err(|e| TransportError::declare(&spec.name, e))?;

        tracing::info!(queue = %spec.name, "queue declared");
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::consume(queue, e))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::consume(queue, format!("failed to set QoS: {}", e)))?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("order-worker.{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::consume(queue, e))?;

        let queue = queue.to_string();
        let stream = consumer.map(move |result| {
            // The stream owns the channel so it stays open while consuming.
            let _channel = &channel;
            match result {
                Ok(delivery) => {
                    let headers = string_headers(&delivery.properties);
                    let acker = AmqpAcker {
                        queue: queue.clone(),
                        acker: delivery.acker,
                    };
                    Ok(Delivery::new(
                        queue.clone(),
                        delivery.data,
                        headers,
                        delivery.redelivered,
                        Box::new(acker),
                    ))
                }
                Err(e) => Err(TransportError::consume(&queue, e)),
            }
        });

        Ok(Box::pin(stream))
    }
}
