use std::io;

/// Numeric codes shared with composition layers.
pub mod code {
    pub const FAILED: i32 = -3;
    pub const HANGUP: i32 = -2;
    pub const NOTHING: i32 = -1;
    pub const OK: i32 = 0;
    pub const TIMEOUT: i32 = 1;
}

/// Outcome of a wait primitive.
#[derive(Debug)]
pub enum Status {
    /// Registration with the reactor failed; nothing is left registered.
    Failed(io::Error),
    /// The watched resource was closed.
    HangUp,
    /// There was nothing to wait for; the task did not suspend.
    Nothing,
    Ready,
    /// `sigwait` returned because this signal arrived.
    Signal(i32),
    /// Reserved for callers racing a wait against a timer.
    /// Never produced by the primitives themselves.
    TimedOut,
}

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Status::Failed(_) => code::FAILED,
            Status::HangUp => code::HANGUP,
            Status::Nothing => code::NOTHING,
            Status::Ready | Status::Signal(_) => code::OK,
            Status::TimedOut => code::TIMEOUT,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.code() == code::OK
    }

    pub fn signal(&self) -> Option<i32> {
        match self {
            Status::Signal(signo) => Some(*signo),
            _ => None,
        }
    }

    pub fn into_error(self) -> Option<io::Error> {
        match self {
            Status::Failed(err) => Some(err),
            _ => None,
        }
    }
}
