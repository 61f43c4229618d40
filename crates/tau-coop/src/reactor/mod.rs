//! Readiness multiplexer seam.
//!
//! The runtime talks to the reactor through [`Reactor`] only. Registrations
//! are made on behalf of a callee and reported back as [`Event`]s naming that
//! callee, so the driver can resume it with the event that fired.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::callee::CalleeId;

mod lab;
mod poll;
mod signal;

pub use lab::LabReactor;
pub use poll::PollReactor;

/// Opaque registration handle. The serial makes handles of recycled slots
/// distinct from their predecessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    key: usize,
    serial: u64,
}

impl Token {
    pub const fn new(key: usize, serial: u64) -> Self {
        Token { key, serial }
    }

    pub const fn key(self) -> usize {
        self.key
    }

    pub const fn serial(self) -> u64 {
        self.serial
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token#{}.{}", self.key, self.serial)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// A registration fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub callee: CalleeId,
    pub token: Token,
    /// The watched resource hung up.
    pub hup: bool,
}

pub trait Reactor {
    /// Watch `fd` for readiness in `direction`. The registration starts armed.
    fn register_io(&self, callee: CalleeId, fd: RawFd, direction: Direction)
        -> io::Result<Token>;

    /// Fire `after` from now; repeat every `after` unless `oneshot`.
    fn register_timer(&self, callee: CalleeId, after: Duration, oneshot: bool)
        -> io::Result<Token>;

    /// Fire when `signo` is delivered to the process.
    fn register_signal(&self, callee: CalleeId, signo: i32, oneshot: bool) -> io::Result<Token>;

    /// Arm a registration again after it fired or was disarmed.
    fn rearm(&self, token: Token) -> io::Result<()>;

    /// Keep the registration but stop reporting it until re-armed.
    fn disarm(&self, token: Token);

    /// The descriptor or signal number behind a registration.
    fn ident(&self, token: Token) -> Option<i32>;

    /// Drop a registration. Unknown tokens are ignored.
    fn revoke(&self, token: Token);

    /// Wait up to `timeout` (`None`: indefinitely) and append fired
    /// registrations to `events`. Returns how many were appended.
    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize>;

    /// No registration is live.
    fn is_empty(&self) -> bool;
}
