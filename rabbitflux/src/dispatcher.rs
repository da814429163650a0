//! Inbound side: turns service-queue deliveries into handler calls and replies.

use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerChannel, Delivery, DeliveryStream, DEFAULT_EXCHANGE};
use crate::handler::{Handler, Outcome};
use crate::message::{decode_request, encode_response, new_message_id, Envelope, Response};
use crate::service::WeakService;

/// Number of inbound messages currently being handled
#[derive(Debug, Default)]
pub(crate) struct InFlight(AtomicUsize);

impl InFlight {
    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }
}

/// Counts one message as in flight until dropped
struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct Dispatcher {
    service_name: String,
    handler: Arc<dyn Handler>,
    channel: Arc<dyn BrokerChannel>,
    in_flight: Arc<InFlight>,
    service: WeakService,
}

impl Dispatcher {
    pub(crate) fn new(
        service_name: impl Into<String>,
        handler: Arc<dyn Handler>,
        channel: Arc<dyn BrokerChannel>,
        in_flight: Arc<InFlight>,
        service: WeakService,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            handler,
            channel,
            in_flight,
            service,
        }
    }

    /// Dispatch every delivery concurrently until the consumer is cancelled
    pub(crate) async fn run(self: Arc<Self>, mut deliveries: DeliveryStream) {
        info!(
            "📥 Request processor started for {} (handler: {})",
            self.service_name,
            self.handler.name()
        );

        while let Some(delivery) = deliveries.next().await {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.process(delivery).await });
        }

        debug!(service = %self.service_name, "Request processor stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let guard = self.in_flight.enter();
        let Delivery {
            delivery_tag,
            redelivered,
            envelope,
        } = delivery;
        let message_id = envelope.message_id;
        let reply_to = envelope.reply_to;

        debug!(
            service = %self.service_name,
            message_id = %message_id,
            redelivered,
            "📨 Processing request"
        );

        let Some(service) = self.service.upgrade() else {
            // the owning service is gone; let another instance take it
            self.nack(delivery_tag, &message_id).await;
            return;
        };

        let handler = self.handler.clone();
        let payload = envelope.payload;
        let outcome = match tokio::task::spawn_blocking(move || match decode_request(&payload) {
            Ok(request) => handler.handle(request, &service),
            Err(e) => Outcome::Fault(format!("undecodable request: {e}")),
        })
        .await
        {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Outcome::Fault("handler panicked".to_string()),
            Err(e) => Outcome::Fault(format!("handler did not complete: {e}")),
        };

        let response = match outcome {
            Outcome::Reject => {
                debug!(service = %self.service_name, message_id = %message_id, "Request rejected by handler");
                self.nack(delivery_tag, &message_id).await;
                return;
            }
            Outcome::Respond(response) => response.with_defaults(),
            Outcome::Fault(reason) => {
                error!(
                    service = %self.service_name,
                    message_id = %message_id,
                    "❌ Handler failed: {}",
                    reason
                );
                Response::fault(&message_id)
            }
        };

        if let Some(reply_to) = reply_to {
            self.reply(&reply_to, &message_id, &response).await;
        }

        drop(guard);
        if let Err(e) = self.channel.ack(delivery_tag).await {
            warn!(message_id = %message_id, "Failed to acknowledge request: {}", e);
        }
    }

    async fn reply(&self, reply_to: &str, message_id: &str, response: &Response) {
        let payload = match encode_response(response) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(message_id = %message_id, "Failed to encode reply: {}", e);
                return;
            }
        };

        let envelope = Envelope::new_response(new_message_id(), message_id, payload);
        match self.channel.publish(DEFAULT_EXCHANGE, reply_to, envelope).await {
            Ok(_) => debug!(
                message_id = %message_id,
                status = response.status_code,
                "✅ Replied to {}",
                reply_to
            ),
            Err(e) => warn!(message_id = %message_id, "Failed to publish reply to {}: {}", reply_to, e),
        }
    }

    async fn nack(&self, delivery_tag: u64, message_id: &str) {
        if let Err(e) = self.channel.nack(delivery_tag, true).await {
            warn!(message_id = %message_id, "Failed to reject request: {}", e);
        }
    }
}
