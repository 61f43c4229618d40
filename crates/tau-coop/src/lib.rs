//! tau-coop: single-threaded cooperative task runtime.
//!
//! Tasks ("callees") are futures driven explicitly by the runtime: a task only
//! makes progress when [`Runtime::call`] resumes it, and it only suspends at
//! the wait primitives on [`Cx`] (`readable`, `writable`, `sleep`, `sigwait`,
//! `await_children`, `later`) or at `exit`. The run queue decides which tasks
//! resume next; the reactor reports readiness and resumes waiting tasks with
//! the event that fired.
//!
//! Everything lives on one thread. The runtime is `Rc`-based and `!Send`.

mod callee;
mod config;
mod coroutine;
mod error;
pub mod reactor;
mod runq;
mod runtime;
pub mod status;
mod value;

#[cfg(test)]
mod test_utils;

pub use callee::{CalleeId, Cx, Resume};
pub use config::Config;
pub use coroutine::{Coroutine, Resumed};
pub use error::{Error, TaskResult};
pub use reactor::{Direction, Event, LabReactor, PollReactor, Reactor, Token};
pub use runq::RunQ;
pub use runtime::Runtime;
pub use status::Status;
pub use value::Value;
