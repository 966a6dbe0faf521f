//! Crossbus - in-process typed message bus.
//!
//! Two decoupled delivery mechanisms share one bus instance:
//!
//! - **Command dispatch**: a typed request is routed to exactly one bound
//!   handler; its result or failure propagates to the caller unmodified.
//! - **Event notification**: immutable occurrences are broadcast to zero or
//!   more observers, including observers declared against capability trait
//!   objects rather than concrete event types.
//!
//! A third mechanism, the structural adapter, delivers commands and events
//! that are defined in different modules but share the same shape, without
//! a shared type dependency between the modules.
//!
//! Handlers and external event producers are owned by the host application
//! and reached through a read-only [`ServiceLocator`]; the bus owns only its
//! caches and subjects, so independent bus instances are fully isolated.
//!
//! ```
//! use std::sync::Arc;
//! use crossbus::{Command, Handler, HandlerError, HandlerRegistry, MessageBus, SyncCommand};
//!
//! struct Greet(String);
//! impl Command for Greet {
//!     type Output = String;
//! }
//! impl SyncCommand for Greet {}
//!
//! struct GreetHandler;
//! impl Handler<Greet> for GreetHandler {
//!     fn execute(&self, command: Greet) -> Result<String, HandlerError> {
//!         Ok(command.0)
//!     }
//! }
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.bind::<Greet, _>(GreetHandler).unwrap();
//!
//! let bus = MessageBus::new(registry);
//! assert!(bus.can_handle::<Greet>());
//! assert_eq!(bus.execute(Greet("hi".to_string())).unwrap(), "hi");
//! ```

pub mod bus;
pub mod cancel;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod locator;
pub mod structural;
mod sync;

pub use bus::MessageBus;
pub use cancel::{CancelSource, CancelToken};
pub use command::adapter::{AnyMessage, AnyOutput};
pub use command::{AsyncCommand, AsyncHandler, Command, Handler, Shape, SyncCommand};
pub use config::BusOptions;
pub use error::{BusError, HandlerError, Result, SubscriberError};
pub use event::subject::{EventStream, Subscription};
pub use event::{Event, EventCast, EventSource};
pub use locator::{HandlerRegistry, RegistryError, ServiceLocator};
pub use structural::{ConvertFn, MappingProvider, NoMapping, StructuralAdapters, StructuralMap};
