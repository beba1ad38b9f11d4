//! Service dispatch.
//!
//! An event for a route flows through:
//!
//! 1. **Queue** (`queue`): holds events until an instance of the route is idle
//! 2. **Dispatcher** (`worker`): decodes the event and builds handler input
//! 3. **Executor** (`executor`): runs the handler with the route's strategy
//! 4. **Adapter** (`adapter`): turns the result into a reply, a deferred
//!    completion or a stream, then closes the trace and frees the instance
//!
//! Failures are mapped to status codes by `classify`.

pub(crate) mod adapter;
pub mod classify;
pub mod executor;
pub mod handler;
pub mod queue;
pub mod registry;
pub mod stream;
pub(crate) mod worker;

pub use classify::{classify, Classified};
pub use executor::Executors;
pub use handler::{
    handler_fn, CustomSerializer, ErrorHandler, FnHandler, Handler, HandlerInput, HandlerResult,
    Headers, Reply,
};
pub use queue::ReadySignal;
pub use registry::{ExecutionModel, Registration, ServiceDef, ServiceRegistry};
pub use stream::{StreamConsumer, StreamFrame, StreamRegistry};

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
