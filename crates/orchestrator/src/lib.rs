//! Event-driven pipeline orchestration.
//!
//! Tracks job/variant progress through the fixed stage order, advances
//! entities on change notifications, retries failed stages within a
//! bounded budget, and repairs entities whose event-driven advance was
//! missed.

pub mod context;
pub mod dispatcher;
pub mod invoker;
pub mod listener;
pub mod orchestrator;
pub mod recovery;
pub mod retry;

pub use dispatcher::StageDispatcher;
pub use invoker::{NatsInvoker, RecordingInvoker, StageInvoker};
pub use listener::ChangeListener;
pub use orchestrator::Orchestrator;
pub use recovery::RecoveryScanner;
pub use retry::RetryCoordinator;
