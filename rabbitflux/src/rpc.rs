//! Outbound side: publishing messages and correlating replies.

use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::broker::{BrokerChannel, DeliveryStream, PublishOutcome, DEFAULT_EXCHANGE};
use crate::connection::SharedConnection;
use crate::error::Result;
use crate::message::{decode_response, encode_request, new_message_id, Envelope, Request, Response};
use crate::router::path_to_routing_key;
use crate::topology::RESOURCES_EXCHANGE;

/// How a request ended. Exactly one is delivered per request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The target replied
    Response(Response),
    /// The broker had nowhere to route the request
    NotDelivered,
    /// No reply arrived within the configured timeout
    Timeout,
}

impl Resolution {
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_not_delivered(&self) -> bool {
        matches!(self, Self::NotDelivered)
    }
}

/// Pending outbound requests keyed by message id.
///
/// An entry exists exactly while its request is outstanding. Whoever removes
/// it (reply, broker return or timer) delivers the resolution; later
/// resolvers find nothing and do nothing.
#[derive(Debug, Default)]
pub struct Transactions {
    pending: DashMap<String, oneshot::Sender<Resolution>>,
}

impl Transactions {
    /// Register a request and get the rendezvous its resolution arrives on
    pub fn open(&self, message_id: &str) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(message_id.to_string(), tx);
        rx
    }

    /// Resolve a pending request. Returns false when it was already resolved.
    pub fn resolve(&self, message_id: &str, resolution: Resolution) -> bool {
        match self.pending.remove(message_id) {
            Some((_, tx)) => {
                // the caller may have given up on the receiver; the entry is gone either way
                let _ = tx.send(resolution);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Where an outbound message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A service queue, addressed by name through the default exchange
    Service(String),
    /// A resource path, addressed through the resources topic exchange
    Resource(String),
}

impl Target {
    /// Exchange and exact routing key
    pub fn route(&self) -> (&'static str, String) {
        match self {
            Self::Service(name) => (DEFAULT_EXCHANGE, name.clone()),
            Self::Resource(path) => (RESOURCES_EXCHANGE, path_to_routing_key(path)),
        }
    }
}

/// Times a request out when dropped: when its timer fires, or when the
/// reactor shuts down before it could.
struct Expiry {
    transactions: Arc<Transactions>,
    message_id: String,
    timeout: Duration,
}

impl Drop for Expiry {
    fn drop(&mut self) {
        if self.transactions.resolve(&self.message_id, Resolution::Timeout) {
            debug!(
                message_id = %self.message_id,
                "Request timed out after {}ms",
                self.timeout.as_millis()
            );
        }
    }
}

/// Outbound half of a service instance
#[derive(Debug)]
pub(crate) struct Correlator {
    service_name: String,
    /// This instance's private response queue
    reply_to: String,
    timeout: Duration,
    transactions: Arc<Transactions>,
}

impl Correlator {
    pub(crate) fn new(
        service_name: impl Into<String>,
        reply_to: impl Into<String>,
        timeout: Duration,
        transactions: Arc<Transactions>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            reply_to: reply_to.into(),
            timeout,
            transactions,
        }
    }

    /// Publish without waiting for anything; the returned future completes once the broker has it
    pub(crate) fn fire_and_forget(
        &self,
        channel: Arc<dyn BrokerChannel>,
        target: &Target,
        request: &Request,
    ) -> Result<impl std::future::Future<Output = ()> + Send + 'static> {
        let (exchange, routing_key) = target.route();
        let envelope = Envelope::new_request(new_message_id(), None, self.timeout, encode_request(request)?);
        let message_id = envelope.message_id.clone();
        let service = self.service_name.clone();

        debug!(service = %service, message_id = %message_id, routing_key = %routing_key, "Sending message");

        Ok(async move {
            match channel.publish(exchange, &routing_key, envelope).await {
                Ok(PublishOutcome::Routed) => {}
                Ok(PublishOutcome::Returned) => {
                    warn!(service = %service, message_id = %message_id, "Message to '{}' was not delivered", routing_key);
                }
                Err(e) => {
                    warn!(service = %service, message_id = %message_id, "Failed to publish message to '{}': {}", routing_key, e);
                }
            }
        })
    }

    /// Register and publish a request, arming its timeout.
    ///
    /// The returned receiver yields the single [`Resolution`] of the request.
    pub(crate) fn begin_request(
        &self,
        connection: &SharedConnection,
        channel: Arc<dyn BrokerChannel>,
        target: &Target,
        request: &Request,
    ) -> Result<oneshot::Receiver<Resolution>> {
        let (exchange, routing_key) = target.route();
        let payload = encode_request(request)?;
        let message_id = new_message_id();
        let envelope = Envelope::new_request(message_id.clone(), Some(self.reply_to.clone()), self.timeout, payload);

        let receiver = self.transactions.open(&message_id);
        debug!(
            service = %self.service_name,
            message_id = %message_id,
            routing_key = %routing_key,
            "Sending request"
        );

        let transactions = self.transactions.clone();
        let id = message_id.clone();
        connection.spawn(async move {
            match channel.publish(exchange, &routing_key, envelope).await {
                Ok(PublishOutcome::Routed) => {}
                Ok(PublishOutcome::Returned) => {
                    if transactions.resolve(&id, Resolution::NotDelivered) {
                        debug!(message_id = %id, "Request to '{}' was not delivered", routing_key);
                    }
                }
                Err(e) => {
                    warn!(message_id = %id, "Failed to publish request to '{}': {}", routing_key, e);
                    transactions.resolve(&id, Resolution::NotDelivered);
                }
            }
        });

        let expiry = Expiry {
            transactions: self.transactions.clone(),
            message_id,
            timeout: self.timeout,
        };
        connection.spawn(async move {
            tokio::time::sleep(expiry.timeout).await;
            drop(expiry);
        });

        Ok(receiver)
    }

    /// Consume the private response queue until it is closed
    pub(crate) async fn run_responses(self: Arc<Self>, mut deliveries: DeliveryStream) {
        debug!(service = %self.service_name, "📤 Response processor started");

        while let Some(delivery) = deliveries.next().await {
            let envelope = delivery.envelope;
            let Some(correlation_id) = envelope.correlation_id else {
                debug!(service = %self.service_name, "Dropping reply without correlation id");
                continue;
            };

            let response = match decode_response(&envelope.payload) {
                Ok(response) => response,
                Err(e) => {
                    warn!(message_id = %correlation_id, "Undecodable reply: {}", e);
                    Response::fault(&correlation_id)
                }
            };

            if !self.transactions.resolve(&correlation_id, Resolution::Response(response)) {
                debug!(message_id = %correlation_id, "Dropping reply for a request that already resolved");
            }
        }

        debug!(service = %self.service_name, "Response processor stopped");
    }
}
