//! The task execution context.
//!
//! A callee is a [`Frame`] in the runtime arena plus the [`Cx`] handle its
//! task body holds. The wait primitives on `Cx` register interest with the
//! reactor (or the run queue), suspend, and check that the resumption they
//! get is the one they asked for. Anything else is a scheduler or reactor
//! defect: the frame is faulted and torn down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::{self, Future};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tracing::trace;

use crate::coroutine::Coroutine;
use crate::error::{Error, TaskResult};
use crate::reactor::{Direction, Event, Token};
use crate::runtime::Runtime;
use crate::status::Status;

/// Handle to a callee. Ids of disposed callees never resolve again, even
/// once their arena slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CalleeId {
    key: usize,
    generation: u64,
}

impl CalleeId {
    pub(crate) const fn new(key: usize, generation: u64) -> Self {
        CalleeId { key, generation }
    }

    /// Arena slot.
    pub const fn key(self) -> usize {
        self.key
    }

    pub const fn generation(self) -> u64 {
        self.generation
    }
}

impl fmt::Display for CalleeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callee#{}.{}", self.key, self.generation)
    }
}

/// What a callee is resumed with.
#[derive(Debug)]
pub enum Resume {
    /// Run-queue wake-up; also the input of a task's first resumption.
    Wake,
    /// A reactor registration fired.
    Event(Event),
    /// A child finished disposal.
    Joined { child: CalleeId, result: TaskResult },
}

impl Resume {
    pub(crate) fn describe(&self) -> String {
        match self {
            Resume::Wake => "a wake-up".to_string(),
            Resume::Event(ev) if ev.hup => format!("{} (hang-up) for {}", ev.token, ev.callee),
            Resume::Event(ev) => format!("{} for {}", ev.token, ev.callee),
            Resume::Joined { child, .. } => format!("the result of {child}"),
        }
    }

    fn matches(&self, id: CalleeId, token: Token) -> Option<&Event> {
        match self {
            Resume::Event(ev) if ev.callee == id && ev.token == token => Some(ev),
            _ => None,
        }
    }
}

pub(crate) type ExitHook = Box<dyn FnOnce() -> Result<(), Error>>;

/// Per-callee state kept in the runtime arena.
#[derive(Default)]
pub(crate) struct Frame {
    pub(crate) generation: u64,
    /// Taken out while the task is being resumed.
    pub(crate) task: Option<Coroutine>,
    pub(crate) running: bool,
    /// Input of the resumption in progress.
    pub(crate) input: Option<Resume>,
    /// In spawn order.
    pub(crate) children: Vec<CalleeId>,
    pub(crate) pending_io: HashSet<Token>,
    pub(crate) read_map: HashMap<RawFd, Token>,
    pub(crate) write_map: HashMap<RawFd, Token>,
    pub(crate) parent: Option<CalleeId>,
    pub(crate) waiting_children: bool,
    /// Children that finished while the callee waited, in completion order.
    pub(crate) joined: Vec<(CalleeId, TaskResult)>,
    pub(crate) terminating: bool,
    pub(crate) exit_value: Option<TaskResult>,
    pub(crate) fault: Option<Error>,
    /// Never set together with `signals`.
    pub(crate) timer: Option<Token>,
    pub(crate) signals: Option<Vec<Token>>,
    pub(crate) exit_hook: Option<ExitHook>,
}

impl Frame {
    pub(crate) fn map(&self, direction: Direction) -> &HashMap<RawFd, Token> {
        match direction {
            Direction::Read => &self.read_map,
            Direction::Write => &self.write_map,
        }
    }

    pub(crate) fn map_mut(&mut self, direction: Direction) -> &mut HashMap<RawFd, Token> {
        match direction {
            Direction::Read => &mut self.read_map,
            Direction::Write => &mut self.write_map,
        }
    }

    /// Reset for reuse, keeping allocations.
    pub(crate) fn recycle(&mut self) {
        self.generation = 0;
        self.task = None;
        self.running = false;
        self.input = None;
        self.children.clear();
        self.pending_io.clear();
        self.read_map.clear();
        self.write_map.clear();
        self.parent = None;
        self.waiting_children = false;
        self.joined.clear();
        self.terminating = false;
        self.exit_value = None;
        self.fault = None;
        self.timer = None;
        self.signals = None;
        self.exit_hook = None;
    }

    fn is_waiting_on_reactor(&self) -> bool {
        self.timer.is_some() || self.signals.is_some()
    }
}

/// Parks the task until the next `call` hands it an input.
struct Suspend<'a> {
    cx: &'a Cx,
    parked: bool,
}

impl Future for Suspend<'_> {
    type Output = Resume;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Resume> {
        if !self.parked {
            self.parked = true;
            return Poll::Pending;
        }
        match self.cx.with_frame(|frame| frame.input.take()).flatten() {
            Some(input) => Poll::Ready(input),
            None => Poll::Pending,
        }
    }
}

fn disposed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "callee disposed")
}

fn busy() -> io::Error {
    io::Error::new(
        io::ErrorKind::WouldBlock,
        "callee already waits on a timer or signals",
    )
}

/// Task-side handle of a callee, passed to the task body.
///
/// The wait primitives must be awaited one at a time: a callee waits on a
/// single thing between two resumptions.
pub struct Cx {
    rt: Runtime,
    id: CalleeId,
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx").field("id", &self.id).finish()
    }
}

impl Cx {
    pub(crate) fn new(rt: Runtime, id: CalleeId) -> Self {
        Cx { rt, id }
    }

    pub fn id(&self) -> CalleeId {
        self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Spawn a child of this callee and queue it.
    pub fn spawn<F, Fut>(&self, f: F) -> CalleeId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.rt.spawn_child(self.id, f)
    }

    /// Run `hook` during disposal. Replaces any previously set hook.
    pub fn atexit<H>(&self, hook: H)
    where
        H: FnOnce() -> Result<(), Error> + 'static,
    {
        self.with_frame(|frame| frame.exit_hook = Some(Box::new(hook)));
    }

    /// Terminate with `result`. Never returns: the callee is disposed as
    /// soon as the current resumption ends.
    pub async fn exit<T>(&self, result: TaskResult) -> T {
        self.with_frame(|frame| {
            frame.terminating = true;
            frame.exit_value = Some(result);
        });
        future::pending().await
    }

    /// Wait until every child has finished disposal.
    ///
    /// Returns `None` right away when there are no children. Otherwise
    /// suspends once and returns the child that finished last, with its
    /// result.
    pub async fn await_children(&self) -> Option<(CalleeId, TaskResult)> {
        self.await_all().await.pop()
    }

    /// Like [`Cx::await_children`], keeping every child's result in
    /// completion order. Children that finished before the call are not
    /// included.
    pub async fn await_all(&self) -> Vec<(CalleeId, TaskResult)> {
        let has_children = self
            .with_frame(|frame| {
                frame.joined.clear();
                frame.waiting_children = !frame.children.is_empty();
                frame.waiting_children
            })
            .unwrap_or(false);
        if !has_children {
            return Vec::new();
        }

        match self.suspend().await {
            Resume::Joined { child, result } => {
                let mut results = self
                    .with_frame(|frame| mem::take(&mut frame.joined))
                    .unwrap_or_default();
                results.push((child, result));
                results
            }
            other => {
                self.with_frame(|frame| {
                    frame.waiting_children = false;
                    frame.joined.clear();
                });
                self.fault("a child result", other).await
            }
        }
    }

    /// Requeue this callee, optionally after `delay`, and suspend until the
    /// run queue resumes it.
    pub async fn later(&self, delay: Option<Duration>) {
        if !self.rt.schedule(self.id, delay) {
            trace!(callee = %self.id, "already queued");
        }
        match self.suspend().await {
            Resume::Wake => {}
            other => {
                self.rt.unschedule(self.id);
                self.fault("a wake-up", other).await
            }
        }
    }

    /// Wait until `fd` is readable. `deadline` is accepted but not applied;
    /// race [`Cx::sleep`] against it one level up for bounded waits.
    pub async fn readable(&self, fd: RawFd, _deadline: Option<Duration>) -> Status {
        self.ioable(Direction::Read, fd).await
    }

    /// Wait until `fd` is writable. `deadline` is not applied, see
    /// [`Cx::readable`].
    pub async fn writable(&self, fd: RawFd, _deadline: Option<Duration>) -> Status {
        self.ioable(Direction::Write, fd).await
    }

    /// Suspend for `after`.
    pub async fn sleep(&self, after: Duration) -> Status {
        let Some(waiting) = self.with_frame(|frame| frame.is_waiting_on_reactor()) else {
            return Status::Failed(disposed());
        };
        if waiting {
            return Status::Failed(busy());
        }

        let reactor = self.rt.reactor();
        let token = match reactor.register_timer(self.id, after, true) {
            Ok(token) => token,
            Err(err) => return Status::Failed(err),
        };
        self.with_frame(|frame| frame.timer = Some(token));

        let input = self.suspend().await;
        self.with_frame(|frame| frame.timer = None);
        reactor.revoke(token);

        match input.matches(self.id, token) {
            Some(ev) if ev.hup => Status::HangUp,
            Some(_) => Status::Ready,
            None => self.fault("its timer", input).await,
        }
    }

    /// Wait for any of `signals`. `None` entries are skipped; with nothing
    /// left to wait on this returns [`Status::Nothing`] without suspending.
    /// `deadline` is not applied.
    pub async fn sigwait<I>(&self, _deadline: Option<Duration>, signals: I) -> Status
    where
        I: IntoIterator,
        I::Item: Into<Option<i32>>,
    {
        let Some(waiting) = self.with_frame(|frame| frame.is_waiting_on_reactor()) else {
            return Status::Failed(disposed());
        };
        if waiting {
            return Status::Failed(busy());
        }

        let reactor = self.rt.reactor();
        let mut tokens = Vec::new();
        for signo in signals.into_iter().filter_map(Into::<Option<i32>>::into) {
            match reactor.register_signal(self.id, signo, true) {
                Ok(token) => tokens.push(token),
                Err(err) => {
                    for token in tokens {
                        reactor.revoke(token);
                    }
                    return Status::Failed(err);
                }
            }
        }
        if tokens.is_empty() {
            return Status::Nothing;
        }
        self.with_frame(|frame| frame.signals = Some(tokens.clone()));

        let input = self.suspend().await;
        self.with_frame(|frame| frame.signals = None);
        let signo = match &input {
            Resume::Event(ev) if ev.callee == self.id && tokens.contains(&ev.token) => {
                reactor.ident(ev.token)
            }
            _ => None,
        };
        for token in tokens {
            reactor.revoke(token);
        }

        match signo {
            Some(signo) => Status::Signal(signo),
            None => self.fault("a signal", input).await,
        }
    }

    async fn ioable(&self, direction: Direction, fd: RawFd) -> Status {
        let Some(existing) = self.with_frame(|frame| frame.map(direction).get(&fd).copied()) else {
            return Status::Failed(disposed());
        };

        let reactor = self.rt.reactor();
        let token = match existing {
            Some(token) => {
                if let Err(err) = reactor.rearm(token) {
                    self.forget_io(direction, fd, token);
                    return Status::Failed(err);
                }
                token
            }
            None => match reactor.register_io(self.id, fd, direction) {
                Ok(token) => {
                    self.with_frame(|frame| {
                        frame.map_mut(direction).insert(fd, token);
                        frame.pending_io.insert(token);
                    });
                    token
                }
                Err(err) => return Status::Failed(err),
            },
        };

        let input = self.suspend().await;
        match input.matches(self.id, token) {
            Some(ev) if ev.hup => {
                self.forget_io(direction, fd, token);
                Status::HangUp
            }
            Some(_) => {
                // Keep the registration for the next wait on this fd.
                reactor.disarm(token);
                Status::Ready
            }
            None => {
                self.forget_io(direction, fd, token);
                let expected = match direction {
                    Direction::Read => "readability",
                    Direction::Write => "writability",
                };
                self.fault(expected, input).await
            }
        }
    }

    /// Drop the tracking entry for `fd` and revoke its registration.
    fn forget_io(&self, direction: Direction, fd: RawFd, token: Token) {
        self.with_frame(|frame| {
            frame.map_mut(direction).remove(&fd);
            frame.pending_io.remove(&token);
        });
        self.rt.reactor().revoke(token);
    }

    /// Record a protocol violation and park forever; the runtime disposes
    /// the frame with the error once this resumption returns.
    async fn fault<T>(&self, expected: &'static str, got: Resume) -> T {
        let err = Error::Protocol {
            callee: self.id,
            expected,
            got: got.describe(),
        };
        self.with_frame(|frame| {
            frame.fault.get_or_insert(err);
        });
        future::pending().await
    }

    fn suspend(&self) -> Suspend<'_> {
        Suspend {
            cx: self,
            parked: false,
        }
    }

    fn with_frame<R>(&self, f: impl FnOnce(&mut Frame) -> R) -> Option<R> {
        self.rt.with_frame(self.id, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::lab_runtime;
    use crate::Value;
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    /// A log shared between the test and a task body.
    fn recorder<T>() -> (Rc<RefCell<Vec<T>>>, Rc<RefCell<Vec<T>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (log.clone(), log)
    }

    #[test]
    fn readable_twice_rearms_the_same_registration() {
        let (rt, lab) = lab_runtime();
        let (log, sink) = recorder::<i32>();
        let id = rt.spawn(move |cx| async move {
            for _ in 0..2 {
                let status = cx.readable(5, None).await;
                sink.borrow_mut().push(status.code());
            }
            Ok(Value::unit())
        });

        rt.consume();
        let token = lab.token_for(5, Direction::Read).unwrap();
        assert_eq!(lab.registrations(), 1);
        assert_eq!(lab.ready(5, Direction::Read, false), 1);
        rt.turn(Some(Duration::ZERO)).unwrap();

        // Second wait re-armed the same token instead of registering anew.
        assert_eq!(lab.token_for(5, Direction::Read), Some(token));
        assert_eq!(lab.rearms(), 1);
        assert_eq!(lab.registrations(), 1);
        assert!(lab.is_armed(token));

        assert_eq!(lab.ready(5, Direction::Read, false), 1);
        rt.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(*log.borrow(), vec![0, 0]);
        assert!(!rt.is_alive(id));
        // Disposal revoked the kept registration.
        assert_eq!(lab.revoked(), vec![token]);
        assert_eq!(lab.registrations(), 0);
    }

    #[test]
    fn rearm_failure_forgets_and_revokes_once() {
        let (rt, lab) = lab_runtime();
        let (log, sink) = recorder::<i32>();
        let id = rt.spawn(move |cx| async move {
            let first = cx.readable(3, None).await;
            sink.borrow_mut().push(first.code());
            let second = cx.readable(3, None).await;
            sink.borrow_mut().push(second.code());
            Ok(Value::unit())
        });

        rt.consume();
        let token = lab.token_for(3, Direction::Read).unwrap();
        lab.fail_rearm(token);
        lab.ready(3, Direction::Read, false);
        rt.turn(Some(Duration::ZERO)).unwrap();

        assert_eq!(*log.borrow(), vec![0, -3]);
        assert!(!rt.is_alive(id));
        assert_eq!(lab.revoked(), vec![token]);
    }

    #[test]
    fn hangup_revokes_registration() {
        let (rt, lab) = lab_runtime();
        let seen = Rc::new(Cell::new(0));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            out.set(cx.writable(9, None).await.code());
            // The map entry is gone, so this registers afresh.
            out.set(out.get() * 10 + cx.writable(9, None).await.code());
            Ok(Value::unit())
        });

        rt.consume();
        let first = lab.token_for(9, Direction::Write).unwrap();
        lab.ready(9, Direction::Write, true);
        rt.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(seen.get(), -2);
        assert_eq!(lab.revoked(), vec![first]);

        let second = lab.token_for(9, Direction::Write).unwrap();
        assert_ne!(first, second);
        assert_eq!(lab.rearms(), 0);
        lab.ready(9, Direction::Write, false);
        rt.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(seen.get(), -20);
    }

    #[test]
    fn registration_failure_does_not_suspend() {
        let (rt, lab) = lab_runtime();
        lab.poison_fd(4);
        let seen = Rc::new(Cell::new(1));
        let out = seen.clone();
        let id = rt.spawn(move |cx| async move {
            out.set(cx.readable(4, None).await.code());
            Ok(Value::unit())
        });
        rt.consume();
        assert_eq!(seen.get(), -3);
        assert!(!rt.is_alive(id));
        assert_eq!(lab.registrations(), 0);
    }

    #[test]
    fn mismatched_event_faults_the_frame() {
        let (rt, lab) = lab_runtime();
        let (results, sink) = recorder::<bool>();
        let spawned = Rc::new(Cell::new(None));
        let waiter_id = spawned.clone();
        rt.spawn(move |cx| async move {
            let waiter = cx.spawn(|cx| async move {
                cx.readable(7, None).await;
                Ok(Value::unit())
            });
            waiter_id.set(Some(waiter));
            let (child, result) = cx.await_children().await.unwrap();
            assert_eq!(child, waiter);
            sink.borrow_mut().push(result.unwrap_err().is_protocol());
            Ok(Value::unit())
        });

        rt.consume();
        rt.consume();
        let token = lab.token_for(7, Direction::Read).unwrap();
        let waiter = spawned.get().unwrap();
        assert_eq!(rt.parent_of(waiter).map(|p| p.key()), Some(0));
        // Event for a token the waiter never registered.
        lab.inject(Event {
            callee: waiter,
            token: Token::new(token.key() + 100, 1),
            hup: false,
        });
        rt.turn(Some(Duration::ZERO)).unwrap();

        assert_eq!(*results.borrow(), vec![true]);
        assert_eq!(lab.revoked(), vec![token]);
        assert_eq!(rt.live(), 0);
    }

    #[test]
    fn sleep_fires_on_virtual_time() {
        let (rt, lab) = lab_runtime();
        let seen = Rc::new(Cell::new(1));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            out.set(cx.sleep(Duration::from_secs(30)).await.code());
            Ok(Value::unit())
        });

        rt.consume();
        assert_eq!(lab.timers().len(), 1);
        rt.run().unwrap();
        assert_eq!(seen.get(), 0);
        assert_eq!(lab.now(), Duration::from_secs(30));
        assert_eq!(lab.registrations(), 0);
    }

    #[test]
    fn sigwait_without_signals_returns_nothing() {
        let (rt, lab) = lab_runtime();
        let seen = Rc::new(Cell::new(0));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            let status = cx.sigwait(None, [None::<i32>, None]).await;
            out.set(status.code());
            Ok(Value::unit())
        });
        rt.consume();
        assert_eq!(seen.get(), -1);
        assert_eq!(lab.registrations(), 0);
        assert!(lab.revoked().is_empty());
        assert_eq!(rt.live(), 0);
    }

    #[test]
    fn sigwait_failure_revokes_earlier_registrations() {
        let (rt, lab) = lab_runtime();
        lab.poison_signal(SIGHUP);
        let seen = Rc::new(Cell::new(0));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            let status = cx
                .sigwait(
                    None,
                    [
                        Some(SIGUSR1),
                        None,
                        Some(SIGUSR2),
                        Some(SIGHUP),
                        Some(SIGTERM),
                    ],
                )
                .await;
            out.set(status.code());
            Ok(Value::unit())
        });
        rt.consume();
        assert_eq!(seen.get(), -3);
        assert_eq!(lab.revoked().len(), 2);
        assert_eq!(lab.registrations(), 0);
        assert_eq!(rt.live(), 0);
    }

    #[test]
    fn sigwait_reports_the_delivered_signal() {
        let (rt, lab) = lab_runtime();
        let seen = Rc::new(Cell::new(None));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            let status = cx
                .sigwait(None, [SIGINT, SIGTERM])
                .await;
            out.set(status.signal());
            Ok(Value::unit())
        });
        rt.consume();
        assert_eq!(lab.signals().len(), 2);
        assert_eq!(lab.raise(SIGTERM), 1);
        rt.turn(Some(Duration::ZERO)).unwrap();
        assert_eq!(seen.get(), Some(SIGTERM));
        // Matched and unmatched registrations alike.
        assert_eq!(lab.revoked().len(), 2);
        assert_eq!(lab.registrations(), 0);
    }

    #[test]
    fn await_without_children_does_not_suspend() {
        let (rt, _lab) = lab_runtime();
        let done = Rc::new(Cell::new(false));
        let out = done.clone();
        rt.spawn(move |cx| async move {
            assert!(cx.await_children().await.is_none());
            assert!(cx.await_all().await.is_empty());
            out.set(true);
            Ok(Value::unit())
        });
        rt.consume();
        assert!(done.get());
        assert_eq!(rt.live(), 0);
    }

    #[test]
    fn atexit_keeps_only_the_last_hook() {
        let (rt, _lab) = lab_runtime();
        let (log, sink) = recorder::<&'static str>();
        let first = sink.clone();
        rt.spawn(move |cx| async move {
            cx.atexit(move || {
                first.borrow_mut().push("first");
                Ok(())
            });
            cx.atexit(move || {
                sink.borrow_mut().push("second");
                Err(Error::msg("hook failure is only logged"))
            });
            Ok(Value::unit())
        });
        rt.consume();
        assert_eq!(*log.borrow(), vec!["second"]);
        assert_eq!(rt.live(), 0);
    }

    #[test]
    fn panicking_exit_hook_does_not_stop_teardown() {
        let (rt, lab) = lab_runtime();
        let id = rt.spawn(|cx| async move {
            cx.atexit(|| panic!("hook"));
            cx.readable(11, None).await;
            Ok(Value::unit())
        });
        rt.consume();
        rt.dispose(id, Err(Error::Cancelled));
        assert!(!rt.is_alive(id));
        assert_eq!(lab.registrations(), 0);
        assert_eq!(lab.revoked().len(), 1);
    }

    #[test]
    fn dispose_revokes_timer_or_signals_never_both() {
        let (rt, lab) = lab_runtime();
        let sleeper = rt.spawn(|cx| async move {
            cx.sleep(Duration::from_secs(1)).await;
            Ok(Value::unit())
        });
        let waiter = rt.spawn(|cx| async move {
            cx.sigwait(None, [SIGUSR1, SIGUSR2]).await;
            Ok(Value::unit())
        });
        rt.consume();
        let timer = lab.timers();
        let signals = lab.signals();
        assert_eq!((timer.len(), signals.len()), (1, 2));

        rt.dispose(sleeper, Err(Error::Cancelled));
        assert_eq!(lab.revoked(), timer);
        rt.dispose(waiter, Err(Error::Cancelled));
        assert_eq!(lab.revoked()[1..], signals[..]);

        // Idempotent.
        rt.dispose(waiter, Err(Error::Cancelled));
        assert_eq!(lab.revoked().len(), 3);
    }

    #[test]
    fn exit_delivers_its_value_to_the_parent() {
        let (rt, _lab) = lab_runtime();
        let seen = Rc::new(Cell::new(0u32));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            cx.spawn(|cx| async move {
                cx.exit::<TaskResult>(Ok(Value::new(99u32))).await
            });
            let (_, result) = cx.await_children().await.unwrap();
            out.set(result.unwrap().downcast::<u32>().unwrap());
            Ok(Value::unit())
        });
        rt.run().unwrap();
        assert_eq!(seen.get(), 99);
    }

    #[test]
    fn later_requeues_behind_other_work() {
        let (rt, _lab) = lab_runtime();
        let (log, sink) = recorder::<&'static str>();
        let other = sink.clone();
        rt.spawn(move |cx| async move {
            sink.borrow_mut().push("a1");
            cx.later(None).await;
            sink.borrow_mut().push("a2");
            Ok(Value::unit())
        });
        rt.spawn(move |_cx| async move {
            other.borrow_mut().push("b");
            Ok(Value::unit())
        });
        rt.run().unwrap();
        assert_eq!(*log.borrow(), vec!["a1", "b", "a2"]);
    }

    #[test]
    fn second_timer_wait_is_refused() {
        let (rt, _lab) = lab_runtime();
        let seen = Rc::new(Cell::new(0));
        let out = seen.clone();
        rt.spawn(move |cx| async move {
            let first = cx.sleep(Duration::from_secs(1));
            let second = cx.sigwait(None, [SIGUSR1]);
            futures::pin_mut!(first);
            // Park the first wait, then try to start another one.
            assert!(futures::poll!(first.as_mut()).is_pending());
            out.set(second.await.code());
            Ok(Value::unit())
        });
        rt.consume();
        assert_eq!(seen.get(), -3);
    }
}
