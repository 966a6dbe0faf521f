//! Command types and handler contracts.
//!
//! A command declares exactly one capability shape at the type level: it is
//! either [`SyncCommand`] or [`AsyncCommand`], and its [`Command::Output`]
//! is `()` for fire-and-forget commands. The typed bus API enforces the
//! sync/async split through these bounds; the type-erased API checks it at
//! runtime and fails fast with a shape mismatch.

use std::any::Any;
use std::fmt;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::HandlerError;

pub mod adapter;

/// A request routed to exactly one handler.
pub trait Command: Any + Send + Sync + 'static {
    /// Value produced by the bound handler. `()` for fire-and-forget
    /// commands.
    type Output: Send + 'static;
}

/// Capability marker: the command's handler contract is synchronous.
pub trait SyncCommand: Command {}

/// Capability marker: the command's handler contract is asynchronous.
pub trait AsyncCommand: Command {}

/// Declared capability shape of a command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Executed inline on the caller's thread.
    Sync,
    /// Executed through a future; cancellation is forwarded to the handler.
    Async,
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync => write!(f, "sync"),
            Self::Async => write!(f, "async"),
        }
    }
}

/// Handler contract for synchronous commands.
pub trait Handler<C: SyncCommand>: Send + Sync + 'static {
    /// Whether the handler is currently willing to execute this command.
    fn can_execute(&self, _command: &C) -> bool {
        true
    }

    /// Execute the command, producing its declared output.
    ///
    /// The returned error reaches the dispatching caller unmodified.
    fn execute(&self, command: C) -> Result<C::Output, HandlerError>;
}

/// Handler contract for asynchronous commands.
#[async_trait]
pub trait AsyncHandler<C: AsyncCommand>: Send + Sync + 'static {
    /// Whether the handler is currently willing to execute this command.
    fn can_execute(&self, _command: &C) -> bool {
        true
    }

    /// Execute the command. The cancellation token is forwarded verbatim
    /// from the caller; the bus neither inspects nor acts on it.
    async fn execute(&self, command: C, cancel: CancelToken) -> Result<C::Output, HandlerError>;
}
