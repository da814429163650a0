use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Broker, BrokerChannel, Delivery, DeliveryStream, PublishOutcome, QueueOptions};
use crate::error::{FluxError, Result};
use crate::message::{Envelope, MessageType};

/// RabbitMQ connection through lapin
pub struct AmqpBroker {
    connection: Connection,
}

impl AmqpBroker {
    /// Connect to `uri`, giving up after `timeout`
    pub async fn connect(uri: &str, timeout: Duration) -> Result<Self> {
        debug!("Attempting to connect to {}", uri);

        let properties = ConnectionProperties::default()
            .with_connection_name(format!("rabbitflux-{}", Uuid::new_v4()).into());

        let connection = tokio::time::timeout(timeout, Connection::connect(uri, properties))
            .await
            .map_err(|_| {
                FluxError::Connection(format!("timed out after {}ms connecting to {}", timeout.as_millis(), uri))
            })?
            .map_err(|e| FluxError::Connection(e.to_string()))?;

        let lost = uri.to_string();
        connection.on_error(move |err| {
            error!("Lost connection to RabbitMQ at {}: {}", lost, err);
        });

        info!("Connected to RabbitMQ at {}", uri);
        Ok(Self { connection })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;
        // confirms are how lapin hands back messages returned as unroutable
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        debug!(channel_id = channel.id(), "Opened channel");
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "Goodbye").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared queue: {}", name);
        Ok(())
    }

    async fn declare_topic_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!("Declared topic exchange: {}", name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        debug!("Bound {} to {} with {}", queue, exchange, routing_key);
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, no_ack: bool) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let queue = queue.to_string();
        let deliveries = consumer.filter_map(move |delivery| {
            let queue = queue.clone();
            async move {
                match delivery {
                    Ok(delivery) => Some(Delivery {
                        delivery_tag: delivery.delivery_tag,
                        redelivered: delivery.redelivered,
                        envelope: envelope_from_amqp(&delivery.properties, delivery.data),
                    }),
                    Err(e) => {
                        warn!(queue = %queue, "Error receiving message: {}", e);
                        None
                    }
                }
            }
        });

        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel.basic_cancel(consumer_tag, BasicCancelOptions::default()).await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<PublishOutcome> {
        let options = BasicPublishOptions {
            mandatory: envelope.mandatory,
            ..Default::default()
        };
        let properties = amqp_properties(&envelope);

        let confirmation = self
            .channel
            .basic_publish(exchange, routing_key, options, &envelope.payload, properties)
            .await?
            .await?;

        match confirmation.take_message() {
            Some(returned) => {
                debug!(
                    routing_key,
                    reply_code = returned.reply_code,
                    "Message {} returned: {}",
                    envelope.message_id,
                    returned.reply_text.as_str()
                );
                Ok(PublishOutcome::Returned)
            }
            None => Ok(PublishOutcome::Routed),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel.basic_ack(delivery_tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "Bye").await?;
        }
        Ok(())
    }
}

fn amqp_properties(envelope: &Envelope) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_type(ShortString::from(envelope.kind.as_str()))
        .with_content_encoding(ShortString::from(envelope.content_encoding.clone()))
        .with_content_type(ShortString::from(envelope.content_type.clone()));

    if let Some(correlation_id) = &envelope.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &envelope.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = envelope.expiration {
        properties = properties.with_expiration(ShortString::from(expiration.as_millis().to_string()));
    }
    properties
}

fn envelope_from_amqp(properties: &BasicProperties, payload: Vec<u8>) -> Envelope {
    let text = |field: &Option<ShortString>| field.as_ref().map(|value| value.as_str().to_string());

    Envelope {
        message_id: text(properties.message_id()).unwrap_or_default(),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
        kind: text(properties.kind())
            .map(|kind| MessageType::from(kind.as_str()))
            .unwrap_or(MessageType::Request),
        content_encoding: text(properties.content_encoding()).unwrap_or_default(),
        content_type: text(properties.content_type()).unwrap_or_default(),
        expiration: text(properties.expiration())
            .and_then(|ms| ms.parse::<u64>().ok())
            .map(Duration::from_millis),
        // mandatory is a publish flag, it does not travel with the message
        mandatory: false,
        payload,
    }
}
