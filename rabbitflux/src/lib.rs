//! # rabbitflux - RPC and messaging between services over RabbitMQ
//!
//! Services address each other by name or by resource path. A request is
//! published with a private reply address and resolves exactly once: with
//! the reply, with `NotDelivered` when nothing is bound to its target, or
//! with `Timeout`. All services in a process share one broker connection.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rabbitflux::{Outcome, Request, Resolution, Response, Service, ServiceConfig};
//!
//! fn main() -> rabbitflux::Result<()> {
//!     let config = ServiceConfig::new("amqp://localhost").with_resource("/v1/greetings");
//!     let greeter = Service::new("greeter.service", config.clone(), |request: Request, _: &Service| {
//!         let name = request.body["name"].as_str().unwrap_or("stranger").to_string();
//!         Outcome::Respond(Response::ok(format!("hi {name}")))
//!     });
//!     greeter.start()?;
//!
//!     let caller = Service::without_handler("caller.service", config);
//!     caller.start()?;
//!
//!     let request = Request::new().with_body(serde_json::json!({ "name": "Bob" }));
//!     if let Resolution::Response(response) = caller.send_request_to_service("greeter.service", &request)? {
//!         println!("{:?}", response.body);
//!     }
//!
//!     caller.stop()?;
//!     greeter.stop()?;
//!     rabbitflux::ConnectionManager::stop_all();
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod connection;
mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod router;
pub mod rpc;
pub mod service;
pub mod topology;

pub use broker::{AmqpBroker, Broker, BrokerChannel, MemoryBroker};
pub use connection::{BrokerAddress, ConnectionConfig, ConnectionManager, SharedConnection};
pub use error::{FluxError, Result};
pub use handler::{DefaultHandler, FunctionHandler, Handler, Outcome};
pub use message::{Envelope, ErrorBody, MessageType, Request, Response};
pub use rpc::{Resolution, Target, Transactions};
pub use service::{Service, ServiceConfig, ServiceState};
