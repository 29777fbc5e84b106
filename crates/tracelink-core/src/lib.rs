//! Trace-and-event matching engine.
//!
//! A background producer ingests bytes from a transport, frames them into
//! timestamped line records, and appends them to a bus that retains a bounded
//! backlog and broadcasts to live subscribers. Waiters combine a backlog
//! replay with the live stream and evaluate multi-pattern accept/reject
//! predicates until an acceptance, rejection, or timeout condition fires.

mod bus;
mod error;
mod events;
mod framer;
pub mod matcher;
mod process;
mod runner;
mod session;
pub mod transport;
mod waiter;

pub use bus::{NextRecord, Subscription, TraceBus};
pub use error::TracelinkError;
pub use events::{CompiledPattern, EventMap, PatternRef, ResolvedPattern};
pub use framer::{FramedLine, LineFramer};
pub use process::{ChildExit, ProcessController, SpawnedChild};
pub use runner::{ProcessRunner, RunnerOptions};
pub use session::{Session, SessionConfig};
pub use waiter::WaitOptions;

/// Result type for tracelink operations.
pub type Result<T> = std::result::Result<T, TracelinkError>;
