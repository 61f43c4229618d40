use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;

use crate::error::{panic_message, TaskResult};

pub(crate) type TaskFuture = Pin<Box<dyn Future<Output = TaskResult>>>;

/// Outcome of one resumption.
#[derive(Debug)]
pub enum Resumed {
    /// The body is parked at a wait point.
    Suspended,
    Finished(TaskResult),
}

/// A resumable computation.
///
/// The body is a future that is only ever polled by [`Coroutine::resume`]:
/// nothing wakes it, so the waker is a no-op. A panic in the body finishes
/// the coroutine with [`Error::Panicked`](crate::Error::Panicked).
pub struct Coroutine {
    body: Option<TaskFuture>,
    resumes: u64,
}

impl Coroutine {
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = TaskResult> + 'static,
    {
        Coroutine {
            body: Some(Box::pin(body)),
            resumes: 0,
        }
    }

    /// Run the body until it suspends or finishes. Resuming a finished
    /// coroutine reports `Suspended` and does nothing.
    pub fn resume(&mut self) -> Resumed {
        let Some(body) = self.body.as_mut() else {
            return Resumed::Suspended;
        };
        self.resumes += 1;

        let mut cx = Context::from_waker(noop_waker_ref());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx)));
        let result = match polled {
            Ok(Poll::Pending) => return Resumed::Suspended,
            Ok(Poll::Ready(result)) => result,
            Err(payload) => Err(crate::Error::Panicked(panic_message(payload))),
        };
        self.body = None;
        Resumed::Finished(result)
    }

    pub fn is_finished(&self) -> bool {
        self.body.is_none()
    }

    /// Number of times the body was polled.
    pub fn resumes(&self) -> u64 {
        self.resumes
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("finished", &self.is_finished())
            .field("resumes", &self.resumes)
            .finish()
    }
}
