//! Error taxonomy for bus operations.

use crate::command::Shape;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Boxed error returned by a command handler.
///
/// The bus propagates it to the caller unmodified; no wrapping, retry or
/// defaulting is applied.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed error returned by an event subscriber.
///
/// Routed to the failing subscription's own error slot; other subscribers
/// are unaffected.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during dispatch or broadcast.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The supplied value is not usable for the requested operation.
    ///
    /// Rust's ownership model removes the null-command case; this surfaces
    /// only when a type-erased payload does not match the adapter it was
    /// routed to.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No handler is bound for the command type. Surfaced immediately,
    /// never retried, never replaced by a default value.
    #[error("no handler bound for command type '{0}'")]
    Unhandled(String),

    /// A command reached the API of the opposite capability shape.
    ///
    /// The typed API rules this out at compile time; type-erased call sites
    /// fail fast here instead of blocking a thread or fabricating asynchrony.
    #[error("command type '{type_name}' is {declared}-shaped but was routed through the {routed} API")]
    ShapeMismatch {
        /// Command type that was dispatched.
        type_name: String,
        /// Shape the command type declares.
        declared: Shape,
        /// Shape of the API the caller used.
        routed: Shape,
    },

    /// The bound handler failed. Carries the handler's own error unmodified.
    #[error("{0}")]
    Handler(#[source] HandlerError),

    /// The event type is produced externally; direct notify of it would
    /// violate the single-writer invariant.
    #[error("event type '{0}' is produced externally; direct notify is rejected")]
    ExternallyProduced(String),
}

impl BusError {
    /// Recover the handler's original error, if this is a handler failure.
    pub fn into_handler_error(self) -> std::result::Result<HandlerError, Self> {
        match self {
            Self::Handler(source) => Ok(source),
            other => Err(other),
        }
    }
}
