use thiserror::Error;

/// Result type alias for RabbitFlux operations
pub type Result<T> = std::result::Result<T, FluxError>;

/// Error types for RabbitFlux services.
///
/// Request timeouts and unroutable requests are not errors: they come back as
/// [`Resolution`](crate::rpc::Resolution) values from the request call.
#[derive(Error, Debug)]
pub enum FluxError {
    /// Malformed configuration, e.g. an unparsable broker address
    #[error("Invalid configuration: {0}")]
    Validation(String),

    /// The broker could not be reached while starting the shared connection
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// AMQP protocol errors raised by lapin after the connection is up
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Payload serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The service must be started before it can send messages
    #[error("Service '{service}' is not started")]
    NotStarted { service: String },

    /// Broker-side refusal (unknown queue, closed channel, locked queue)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Internal framework errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors, e.g. failing to spawn the reactor thread
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FluxError {
    /// Create a new validation error
    pub fn validation_error<T: ToString>(message: T) -> Self {
        Self::Validation(message.to_string())
    }

    /// Create a new broker error
    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    /// Create a new internal error
    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    /// Check if error is recoverable (the operation may succeed if retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Amqp(_) | Self::Io(_))
    }
}
