use std::fmt::Display;
use std::sync::Arc;

use crate::message::{Request, Response};
use crate::service::Service;

/// What a handler decided to do with a request
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Reply with this response
    Respond(Response),
    /// Hand the message back to the broker without replying
    Reject,
    /// The handler failed; the caller gets a structured 500 response
    Fault(String),
}

impl Outcome {
    /// Map a fallible handler result: `Ok` responds, `Err` is a fault
    pub fn from_result<E: Display>(result: std::result::Result<Response, E>) -> Self {
        match result {
            Ok(response) => Self::Respond(response),
            Err(e) => Self::Fault(e.to_string()),
        }
    }
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        Self::Respond(response)
    }
}

/// Trait for implementing service handlers
///
/// Handlers run on the worker pool and may block, including on requests to
/// other services made through the `service` they are given.
pub trait Handler: Send + Sync {
    /// Handle a request received by `service`
    fn handle(&self, request: Request, service: &Service) -> Outcome;

    /// Get handler name for debugging
    fn name(&self) -> &'static str {
        "Handler"
    }
}

/// Simple function-based handler
pub struct FunctionHandler<F> {
    name: &'static str,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: &'static str, handler: F) -> Self {
        Self { name, handler }
    }
}

impl<F> Handler for FunctionHandler<F>
where
    F: Fn(Request, &Service) -> Outcome + Send + Sync,
{
    fn handle(&self, request: Request, service: &Service) -> Outcome {
        (self.handler)(request, service)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Handler used when a service is created without one: every request gets the default response
pub struct DefaultHandler;

impl Handler for DefaultHandler {
    fn handle(&self, _request: Request, _service: &Service) -> Outcome {
        Outcome::Respond(Response::default())
    }

    fn name(&self) -> &'static str {
        "DefaultHandler"
    }
}

pub(crate) fn default_handler() -> Arc<dyn Handler> {
    Arc::new(DefaultHandler)
}
