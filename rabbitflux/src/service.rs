use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::BrokerChannel;
use crate::connection::{ConnectionConfig, ConnectionManager, SharedConnection};
use crate::dispatcher::{Dispatcher, InFlight};
use crate::error::{FluxError, Result};
use crate::handler::{default_handler, FunctionHandler, Handler, Outcome};
use crate::message::Request;
use crate::rpc::{Correlator, Resolution, Target, Transactions};
use crate::topology::{self, TopologyPlan};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for a service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Broker address: `amqp://`, `amqps://` or `memory://<name>`
    pub broker_url: String,
    /// Maximum unacknowledged inbound deliveries
    pub prefetch: u16,
    /// Request timeout, also used as message expiration and stop drain deadline
    pub timeout_ms: u64,
    /// Worker pool size of the shared connection
    pub worker_pool_size: usize,
    pub connection_timeout_ms: u64,
    /// Resource paths routed to this service, sub-paths included
    pub resource_paths: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        Self {
            broker_url: connection.url,
            prefetch: 20,
            timeout_ms: 1000,
            worker_pool_size: connection.worker_pool_size,
            connection_timeout_ms: connection.connection_timeout_ms,
            resource_paths: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Self::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_worker_pool_size(mut self, worker_pool_size: usize) -> Self {
        self.worker_pool_size = worker_pool_size;
        self
    }

    pub fn with_connection_timeout_ms(mut self, connection_timeout_ms: u64) -> Self {
        self.connection_timeout_ms = connection_timeout_ms;
        self
    }

    /// Register a resource path
    pub fn with_resource(mut self, path: impl Into<String>) -> Self {
        self.resource_paths.push(path.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.broker_url.clone(),
            worker_pool_size: self.worker_pool_size,
            connection_timeout_ms: self.connection_timeout_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.connection_config().validate()?;
        if self.timeout_ms == 0 {
            return Err(FluxError::validation_error("timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Lifecycle state of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    /// Intake is closed and in-flight work is draining
    Stopping,
}

/// Resources held while a service is started
struct Running {
    connection: Arc<SharedConnection>,
    channel: Arc<dyn BrokerChannel>,
    correlator: Arc<Correlator>,
    service_consumer_tag: String,
}

struct ServiceInner {
    name: String,
    instance_id: String,
    config: ServiceConfig,
    handler: Arc<dyn Handler>,
    state: RwLock<ServiceState>,
    running: RwLock<Option<Arc<Running>>>,
    /// Serializes start and stop
    lifecycle: Mutex<()>,
    transactions: Arc<Transactions>,
    in_flight: Arc<InFlight>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        // the last handle went away while started: release the consumers,
        // the channel and the private response queue without blocking
        let Some(running) = self.running.get_mut().take() else {
            return;
        };
        if !running.connection.is_open() {
            return;
        }

        debug!("Service {} dropped while started, closing its channel", self.name);
        let name = self.name.clone();
        let channel = running.channel.clone();
        let tag = running.service_consumer_tag.clone();
        running.connection.spawn(async move {
            if let Err(e) = channel.cancel(&tag).await {
                debug!("Could not cancel consumer of dropped service {}: {}", name, e);
            }
            if let Err(e) = channel.close().await {
                debug!("Could not close channel of dropped service {}: {}", name, e);
            }
        });
    }
}

/// A named service instance on the broker
///
/// A service consumes requests from the durable queue named after it (and
/// from every resource path it registers), runs its handler on the shared
/// worker pool and replies to the sender. It also sends messages and
/// requests to other services through its own private response queue.
///
/// `Service` is a cheap handle; clones refer to the same instance.
///
/// Blocking methods (`start`, `stop`, `send_request_*`) must not be called
/// from async code. Handlers run on worker threads and may call them freely.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

/// Non-owning handle held by the dispatcher
#[derive(Clone)]
pub(crate) struct WeakService(Weak<ServiceInner>);

impl WeakService {
    pub(crate) fn upgrade(&self) -> Option<Service> {
        self.0.upgrade().map(|inner| Service { inner })
    }
}

impl Service {
    /// Create a stopped service answering requests with `handler`
    pub fn new<F>(name: impl Into<String>, config: ServiceConfig, handler: F) -> Self
    where
        F: Fn(Request, &Service) -> Outcome + Send + Sync + 'static,
    {
        Self::with_handler(name, config, Arc::new(FunctionHandler::new("FunctionHandler", handler)))
    }

    pub fn with_handler(name: impl Into<String>, config: ServiceConfig, handler: Arc<dyn Handler>) -> Self {
        let name = name.into();
        let instance_id = Uuid::new_v4().simple().to_string();
        debug!("Created service {} ({})", name, instance_id);

        Self {
            inner: Arc::new(ServiceInner {
                name,
                instance_id,
                config,
                handler,
                state: RwLock::new(ServiceState::Stopped),
                running: RwLock::new(None),
                lifecycle: Mutex::new(()),
                transactions: Arc::new(Transactions::default()),
                in_flight: Arc::new(InFlight::default()),
            }),
        }
    }

    /// Create a service that answers every request with the default response
    pub fn without_handler(name: impl Into<String>, config: ServiceConfig) -> Self {
        Self::with_handler(name, config, default_handler())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.read()
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Name of this instance's private response queue
    pub fn response_queue(&self) -> String {
        format!("{}.{}", self.inner.name, self.inner.instance_id)
    }

    /// Outbound requests awaiting resolution
    pub fn pending_transactions(&self) -> usize {
        self.inner.transactions.len()
    }

    /// Inbound messages currently being handled
    pub fn processing_messages(&self) -> usize {
        self.inner.in_flight.count()
    }

    /// Connect (sharing the process-wide connection), declare the topology and begin consuming.
    ///
    /// Starting a started service is a no-op. On failure the service stays stopped.
    pub fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        if self.state() != ServiceState::Stopped {
            debug!("Service {} already started", self.inner.name);
            return Ok(());
        }

        self.inner.config.validate()?;
        info!("🏁 Starting service: {}", self.inner.name);
        self.set_state(ServiceState::Starting);

        match self.open() {
            Ok(running) => {
                *self.inner.running.write() = Some(running);
                self.set_state(ServiceState::Started);
                info!(
                    "🎯 Service {} is running (instance {}, prefetch {})",
                    self.inner.name, self.inner.instance_id, self.inner.config.prefetch
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                warn!("Failed to start service {}: {}", self.inner.name, e);
                Err(e)
            }
        }
    }

    fn open(&self) -> Result<Arc<Running>> {
        let inner = &self.inner;
        let connection = ConnectionManager::ensure_started(&inner.config.connection_config())?;

        let plan = TopologyPlan::new(
            &inner.name,
            &inner.instance_id,
            inner.config.resource_paths.clone(),
            inner.config.prefetch,
        );
        let declared = plan.clone();
        let broker = connection.broker();
        let (channel, subscriptions) = connection.block_on(async move {
            let channel = broker.open_channel().await?;
            match topology::declare(channel.as_ref(), &plan).await {
                Ok(subscriptions) => Ok::<_, FluxError>((channel, subscriptions)),
                Err(e) => {
                    if let Err(close_err) = channel.close().await {
                        debug!("Error closing channel after failed declare: {}", close_err);
                    }
                    Err(e)
                }
            }
        })??;

        let correlator = Arc::new(Correlator::new(
            inner.name.clone(),
            declared.response_queue,
            inner.config.timeout(),
            inner.transactions.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            inner.name.clone(),
            inner.handler.clone(),
            channel.clone(),
            inner.in_flight.clone(),
            self.downgrade(),
        ));

        connection.spawn(dispatcher.run(subscriptions.service_deliveries));
        connection.spawn(correlator.clone().run_responses(subscriptions.response_deliveries));

        Ok(Arc::new(Running {
            connection,
            channel,
            correlator,
            service_consumer_tag: declared.service_consumer_tag,
        }))
    }

    /// Stop consuming, wait for in-flight work and close the channel.
    ///
    /// The wait ends when no request is outstanding and no message is being
    /// handled, or after the configured timeout. The service is stopped
    /// either way.
    pub fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock();
        let Some(running) = self.inner.running.read().clone() else {
            self.set_state(ServiceState::Stopped);
            return Ok(());
        };

        info!("🛑 Stopping service: {}", self.inner.name);
        self.set_state(ServiceState::Stopping);

        let channel = running.channel.clone();
        let tag = running.service_consumer_tag.clone();
        if let Err(e) = running
            .connection
            .block_on(async move { channel.cancel(&tag).await })
            .and_then(|cancelled| cancelled)
        {
            debug!("Could not cancel consumer of {}: {}", self.inner.name, e);
        }

        let deadline = Instant::now() + self.inner.config.timeout();
        while !self.is_drained() && Instant::now() < deadline {
            thread::sleep(DRAIN_POLL_INTERVAL);
        }
        if !self.is_drained() {
            warn!(
                "Service {} stopped with {} pending request(s) and {} message(s) in flight",
                self.inner.name,
                self.pending_transactions(),
                self.processing_messages()
            );
        }

        *self.inner.running.write() = None;
        let channel = running.channel.clone();
        if let Err(e) = running
            .connection
            .block_on(async move { channel.close().await })
            .and_then(|closed| closed)
        {
            debug!("Could not close channel of {}: {}", self.inner.name, e);
        }

        self.set_state(ServiceState::Stopped);
        info!("Service {} stopped", self.inner.name);
        Ok(())
    }

    fn is_drained(&self) -> bool {
        self.pending_transactions() == 0 && self.processing_messages() == 0
    }

    /// Send a message to a service by name without waiting for a reply
    pub fn send_message_to_service(&self, service_name: &str, request: &Request) -> Result<()> {
        self.send_message(Target::Service(service_name.to_string()), request, None::<fn()>)
    }

    /// Send a message without waiting, then run `continuation` on the worker pool once it is published
    pub fn send_message_to_service_async<F>(&self, service_name: &str, request: &Request, continuation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_message(Target::Service(service_name.to_string()), request, Some(continuation))
    }

    /// Send a message to whichever service serves `request.path`
    pub fn send_message_to_resource(&self, request: &Request) -> Result<()> {
        self.send_message(Target::Resource(request.path.clone()), request, None::<fn()>)
    }

    pub fn send_message_to_resource_async<F>(&self, request: &Request, continuation: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.send_message(Target::Resource(request.path.clone()), request, Some(continuation))
    }

    /// Send a request to a service by name and block until it resolves
    pub fn send_request_to_service(&self, service_name: &str, request: &Request) -> Result<Resolution> {
        self.send_request(Target::Service(service_name.to_string()), request)
    }

    /// Send a request without blocking; `callback` runs on the worker pool with the resolution
    pub fn send_request_to_service_async<F>(&self, service_name: &str, request: &Request, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Resolution>) + Send + 'static,
    {
        self.send_request_async(Target::Service(service_name.to_string()), request, callback)
    }

    /// Send a request to whichever service serves `request.path` and block until it resolves
    pub fn send_request_to_resource(&self, request: &Request) -> Result<Resolution> {
        self.send_request(Target::Resource(request.path.clone()), request)
    }

    pub fn send_request_to_resource_async<F>(&self, request: &Request, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Resolution>) + Send + 'static,
    {
        self.send_request_async(Target::Resource(request.path.clone()), request, callback)
    }

    fn send_message<F>(&self, target: Target, request: &Request, continuation: Option<F>) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let running = self.running()?;
        let publish = running
            .correlator
            .fire_and_forget(running.channel.clone(), &target, request)?;
        running.connection.spawn(async move {
            publish.await;
            if let Some(continuation) = continuation {
                tokio::task::spawn_blocking(continuation);
            }
        });
        Ok(())
    }

    fn send_request(&self, target: Target, request: &Request) -> Result<Resolution> {
        let running = self.running()?;
        let receiver = running
            .correlator
            .begin_request(&running.connection, running.channel.clone(), &target, request)?;
        drop(running);
        receiver.blocking_recv().map_err(Self::unresolved)
    }

    fn send_request_async<F>(&self, target: Target, request: &Request, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Resolution>) + Send + 'static,
    {
        let running = self.running()?;
        let receiver = running
            .correlator
            .begin_request(&running.connection, running.channel.clone(), &target, request)?;
        running.connection.spawn(async move {
            let resolution = receiver.await.map_err(Self::unresolved);
            tokio::task::spawn_blocking(move || callback(resolution));
        });
        Ok(())
    }

    fn unresolved(_: oneshot::error::RecvError) -> FluxError {
        FluxError::internal_error("connection stopped before the request resolved")
    }

    fn running(&self) -> Result<Arc<Running>> {
        let running = self
            .inner
            .running
            .read()
            .clone()
            .ok_or_else(|| FluxError::NotStarted {
                service: self.inner.name.clone(),
            })?;
        if !running.connection.is_open() {
            return Err(FluxError::Connection(format!(
                "shared connection to {} is stopped",
                running.connection.address()
            )));
        }
        Ok(running)
    }

    fn set_state(&self, state: ServiceState) {
        *self.inner.state.write() = state;
    }

    pub(crate) fn downgrade(&self) -> WeakService {
        WeakService(Arc::downgrade(&self.inner))
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("state", &self.state())
            .field("handler", &self.inner.handler.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Response;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.broker_url, "amqp://localhost");
        assert_eq!(config.prefetch, 20);
        assert_eq!(config.timeout(), Duration::from_millis(1000));
        assert_eq!(config.worker_pool_size, 500);
        assert_eq!(config.connection_timeout_ms, 10_000);
        assert!(config.resource_paths.is_empty());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ServiceConfig = serde_json::from_str(
            r#"{"broker_url": "memory://config", "timeout_ms": 250, "resource_paths": ["/v1/users"]}"#,
        )
        .unwrap();

        assert_eq!(config.broker_url, "memory://config");
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.prefetch, 20);
        assert_eq!(config.resource_paths, vec!["/v1/users".to_string()]);
    }

    #[test]
    fn test_config_validation() {
        assert!(ServiceConfig::new("memory://ok").validate().is_ok());
        assert!(matches!(
            ServiceConfig::new("bad_uri").validate(),
            Err(FluxError::Validation(_))
        ));
        assert!(matches!(
            ServiceConfig::new("memory://ok").with_timeout_ms(0).validate(),
            Err(FluxError::Validation(_))
        ));
        assert!(matches!(
            ServiceConfig::new("memory://ok").with_worker_pool_size(0).validate(),
            Err(FluxError::Validation(_))
        ));
    }

    #[test]
    fn test_timeout_from_duration_saturates() {
        let config = ServiceConfig::default().with_timeout(Duration::from_millis(1500));
        assert_eq!(config.timeout_ms, 1500);

        let config = ServiceConfig::default().with_timeout(Duration::MAX);
        assert_eq!(config.timeout_ms, u64::MAX);
    }

    #[test]
    fn test_new_service_is_stopped() {
        let service = Service::new("fluxa.service", ServiceConfig::new("memory://unit"), |request: Request, _service: &Service| {
            Outcome::Respond(Response::ok(request.path))
        });

        assert_eq!(service.state(), ServiceState::Stopped);
        assert_eq!(service.pending_transactions(), 0);
        assert_eq!(service.processing_messages(), 0);
        assert_eq!(
            service.response_queue(),
            format!("fluxa.service.{}", service.instance_id())
        );

        let other = Service::without_handler("fluxa.service", ServiceConfig::default());
        assert_ne!(service.instance_id(), other.instance_id());
    }

    #[test]
    fn test_sending_requires_start() {
        let service = Service::without_handler("idle.service", ServiceConfig::new("memory://unit"));

        let err = service
            .send_request_to_service("fluxb.service", &Request::new())
            .unwrap_err();
        assert!(matches!(err, FluxError::NotStarted { .. }));
        assert!(matches!(
            service.send_message_to_resource(&Request::to_path("/v1/users")),
            Err(FluxError::NotStarted { .. })
        ));
    }

    #[test]
    fn test_invalid_config_keeps_service_stopped() {
        let service = Service::without_handler("broken.service", ServiceConfig::new("bad_uri"));

        assert!(matches!(service.start(), Err(FluxError::Validation(_))));
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(service.stop().is_ok());
    }
}
