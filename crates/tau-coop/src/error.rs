use std::io;

use thiserror::Error;

use crate::callee::CalleeId;
use crate::value::Value;

/// Result of a finished task, delivered to a parent blocked in
/// [`Cx::await_children`](crate::Cx::await_children).
pub type TaskResult = Result<Value, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The reactor refused a registration.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A waiting callee was resumed with something other than what it waits
    /// on. Only a scheduler or reactor defect produces this.
    #[error("callee {callee} waiting on {expected} was resumed with {got}")]
    Protocol {
        callee: CalleeId,
        expected: &'static str,
        got: String,
    },

    #[error("task panicked: {0}")]
    Panicked(String),

    /// Torn down together with its parent.
    #[error("task cancelled")]
    Cancelled,

    /// `block_on` ran out of work before its task finished.
    #[error("runtime stalled with {live} live callees")]
    Stalled { live: usize },

    #[error("{0}")]
    Task(String),

    #[error("{0}")]
    Other(Box<dyn std::error::Error + 'static>),
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Task(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol { .. })
    }
}

/// Turn a panic payload into something loggable.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let err = Error::Protocol {
            callee: CalleeId::new(2, 9),
            expected: "its timer",
            got: "a wake-up".into(),
        };
        assert_eq!(
            err.to_string(),
            "callee callee#2.9 waiting on its timer was resumed with a wake-up"
        );
        assert!(err.is_protocol());
        assert!(Error::Cancelled.is_cancelled());
        assert_eq!(Error::msg("boom").to_string(), "boom");

        let io: Error = io::Error::other("refused").into();
        assert_eq!(io.to_string(), "refused");
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(3u8)), "non-string panic payload");
    }
}
