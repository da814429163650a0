//! Per-service queues, exchanges and resource bindings.

use futures_util::future::try_join_all;
use tracing::{debug, info};

use crate::broker::{BrokerChannel, DeliveryStream, QueueOptions};
use crate::error::Result;
use crate::router::binding_key;

/// Shared durable topic exchange that routes messages to resources by path
pub const RESOURCES_EXCHANGE: &str = "resources.exchange";

/// Names making up one service instance's topology
#[derive(Debug, Clone)]
pub struct TopologyPlan {
    /// Durable queue shared by every instance of the service
    pub service_queue: String,
    /// Exclusive, auto-deleted queue receiving this instance's replies
    pub response_queue: String,
    /// Resource paths bound to the service queue
    pub resource_paths: Vec<String>,
    pub prefetch: u16,
    pub service_consumer_tag: String,
    pub response_consumer_tag: String,
}

impl TopologyPlan {
    pub fn new(service_name: &str, instance_id: &str, resource_paths: Vec<String>, prefetch: u16) -> Self {
        Self {
            service_queue: service_name.to_string(),
            response_queue: format!("{service_name}.{instance_id}"),
            resource_paths,
            prefetch,
            service_consumer_tag: format!("{service_name}-service-{instance_id}"),
            response_consumer_tag: format!("{service_name}-responses-{instance_id}"),
        }
    }
}

/// Consumers opened by [`declare`]
pub struct Subscriptions {
    /// Inbound requests, acknowledged manually
    pub service_deliveries: DeliveryStream,
    /// Replies to this instance's requests, auto-acknowledged
    pub response_deliveries: DeliveryStream,
}

/// Declare and subscribe the service and response queues, then bind every resource path.
///
/// Returns once all bindings are confirmed by the broker.
pub async fn declare(channel: &dyn BrokerChannel, plan: &TopologyPlan) -> Result<Subscriptions> {
    channel.set_prefetch(plan.prefetch).await?;

    channel.declare_queue(&plan.service_queue, QueueOptions::durable()).await?;
    channel.declare_queue(&plan.response_queue, QueueOptions::private()).await?;
    info!("✅ Declared queues: {}, {}", plan.service_queue, plan.response_queue);

    let service_deliveries = channel
        .consume(&plan.service_queue, &plan.service_consumer_tag, false)
        .await?;
    let response_deliveries = channel
        .consume(&plan.response_queue, &plan.response_consumer_tag, true)
        .await?;

    channel.declare_topic_exchange(RESOURCES_EXCHANGE).await?;

    let bindings: Vec<String> = plan.resource_paths.iter().map(|path| binding_key(path)).collect();
    try_join_all(
        bindings
            .iter()
            .map(|key| channel.bind_queue(&plan.service_queue, RESOURCES_EXCHANGE, key)),
    )
    .await?;
    debug!(
        "Bound {} resource(s) for {}: {:?}",
        bindings.len(),
        plan.service_queue,
        bindings
    );

    Ok(Subscriptions {
        service_deliveries,
        response_deliveries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, PublishOutcome};
    use crate::message::Envelope;
    use crate::router::path_to_routing_key;
    use futures_util::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_plan_names() {
        let plan = TopologyPlan::new("fluxa.service", "abc", vec![], 20);
        assert_eq!(plan.service_queue, "fluxa.service");
        assert_eq!(plan.response_queue, "fluxa.service.abc");
        assert_ne!(plan.service_consumer_tag, plan.response_consumer_tag);
    }

    #[tokio::test]
    async fn test_declare_binds_every_resource() {
        let broker = MemoryBroker::new("topology");
        let channel = broker.open_channel().await.unwrap();
        let plan = TopologyPlan::new(
            "users.service",
            "i1",
            vec!["/v1/users".to_string(), "/v1/groups/".to_string()],
            20,
        );

        let mut subscriptions = declare(channel.as_ref(), &plan).await.unwrap();

        let publisher = broker.open_channel().await.unwrap();
        for path in ["/v1/users/42", "/v1/groups"] {
            let envelope = Envelope::new_request(path, None, Duration::from_secs(1), vec![]);
            let outcome = publisher
                .publish(RESOURCES_EXCHANGE, &path_to_routing_key(path), envelope)
                .await
                .unwrap();
            assert_eq!(outcome, PublishOutcome::Routed);
            let delivery = subscriptions.service_deliveries.next().await.unwrap();
            assert_eq!(delivery.envelope.message_id, path);
        }

        assert_eq!(broker.queue_depth("users.service.i1"), Some(0));
    }
}
