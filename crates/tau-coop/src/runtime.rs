use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;

use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::callee::{CalleeId, Cx, Frame, Resume};
use crate::config::Config;
use crate::coroutine::{Coroutine, Resumed};
use crate::error::{panic_message, Error, TaskResult};
use crate::reactor::{Event, PollReactor, Reactor};
use crate::runq::RunQ;
use crate::value::Value;

struct Shared {
    reactor: Rc<dyn Reactor>,
    runq: RefCell<RunQ<CalleeId>>,
    frames: RefCell<Slab<Frame>>,
    /// Released frames kept for reuse.
    pool: RefCell<Vec<Frame>>,
    /// Callee whose task is being resumed.
    current: Cell<Option<CalleeId>>,
    generation: Cell<u64>,
    /// Reactor output buffer, reused across turns.
    events: RefCell<Vec<Event>>,
    config: Config,
}

/// Why `call` could not resume a live callee.
enum Unavailable {
    Running,
    /// The task body is still being built by `create`.
    Unstarted,
}

/// Single-threaded runtime: callee arena, run queue and reactor.
///
/// Cloning is cheap and yields another handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    shared: Rc<Shared>,
}

impl Runtime {
    /// Runtime over the OS poller with default settings.
    pub fn new() -> io::Result<Self> {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> io::Result<Self> {
        Ok(Self::with_reactor(Rc::new(PollReactor::new()?), config))
    }

    pub fn with_reactor(reactor: Rc<dyn Reactor>, config: Config) -> Self {
        Runtime {
            shared: Rc::new(Shared {
                reactor,
                runq: RefCell::new(RunQ::new()),
                frames: RefCell::new(Slab::new()),
                pool: RefCell::new(Vec::with_capacity(config.pool_capacity)),
                current: Cell::new(None),
                generation: Cell::new(0),
                events: RefCell::new(Vec::with_capacity(config.event_capacity)),
                config,
            }),
        }
    }

    pub fn reactor(&self) -> &Rc<dyn Reactor> {
        &self.shared.reactor
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The callee being resumed right now.
    pub fn current(&self) -> Option<CalleeId> {
        self.shared.current.get()
    }

    pub fn is_alive(&self, id: CalleeId) -> bool {
        self.with_frame(id, |_| ()).is_some()
    }

    /// Number of live callees.
    pub fn live(&self) -> usize {
        self.shared.frames.borrow().len()
    }

    /// Number of callees in the run queue.
    pub fn pending(&self) -> usize {
        self.shared.runq.borrow().len()
    }

    /// Number of released frames waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.shared.pool.borrow().len()
    }

    pub fn parent_of(&self, id: CalleeId) -> Option<CalleeId> {
        self.with_frame(id, |frame| frame.parent).flatten()
    }

    pub fn children_of(&self, id: CalleeId) -> Vec<CalleeId> {
        self.with_frame(id, |frame| frame.children.clone())
            .unwrap_or_default()
    }

    /// Create a callee running `f`. The callee being resumed, if any,
    /// becomes its parent. Nothing runs until the callee is called or
    /// scheduled.
    pub fn new_callee<F, Fut>(&self, f: F) -> CalleeId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.create(self.current(), f)
    }

    /// Like [`Runtime::new_callee`], with `this` bound ahead of the `Cx`.
    pub fn new_callee_with<S, F, Fut>(&self, this: S, f: F) -> CalleeId
    where
        F: FnOnce(S, Cx) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        self.new_callee(move |cx| f(this, cx))
    }

    /// Create a callee and queue it.
    pub fn spawn<F, Fut>(&self, f: F) -> CalleeId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let id = self.new_callee(f);
        self.schedule(id, None);
        id
    }

    pub(crate) fn spawn_child<F, Fut>(&self, parent: CalleeId, f: F) -> CalleeId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let id = self.create(Some(parent), f);
        self.schedule(id, None);
        id
    }

    fn create<F, Fut>(&self, parent: Option<CalleeId>, f: F) -> CalleeId
    where
        F: FnOnce(Cx) -> Fut,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let generation = self.shared.generation.get() + 1;
        self.shared.generation.set(generation);

        let parent = parent.filter(|parent| self.is_alive(*parent));
        let mut frame = self.shared.pool.borrow_mut().pop().unwrap_or_default();
        frame.generation = generation;
        frame.parent = parent;
        let key = self.shared.frames.borrow_mut().insert(frame);
        let id = CalleeId::new(key, generation);

        if let Some(parent) = parent {
            self.with_frame(parent, |frame| frame.children.push(id));
        }

        let task = Coroutine::new(f(Cx::new(self.clone(), id)));
        self.with_frame(id, |frame| frame.task = Some(task));

        debug!(callee = %id, parent = ?parent, "callee created");
        id
    }

    /// Queue `id` for resumption, now or after `delay`. Returns false for
    /// dead or already queued callees.
    pub fn schedule(&self, id: CalleeId, delay: Option<Duration>) -> bool {
        self.is_alive(id) && self.shared.runq.borrow_mut().push(id, delay)
    }

    /// Cancel a queued resumption.
    pub fn unschedule(&self, id: CalleeId) -> bool {
        self.shared.runq.borrow_mut().remove(&id)
    }

    /// Resume `id` with `input`. Stale ids are ignored; so are callees that
    /// are already running or whose task is not installed yet. Disposes the
    /// callee if its task finished, faulted or asked to terminate.
    pub fn call(&self, id: CalleeId, input: Resume) {
        let begun = self.with_frame(id, |frame| {
            if frame.running {
                return Err(Unavailable::Running);
            }
            let task = frame.task.take().ok_or(Unavailable::Unstarted)?;
            frame.running = true;
            frame.input = Some(input);
            Ok(task)
        });
        let mut task = match begun {
            Some(Ok(task)) => task,
            Some(Err(Unavailable::Running)) => {
                warn!(callee = %id, "callee is already running");
                return;
            }
            Some(Err(Unavailable::Unstarted)) => {
                trace!(callee = %id, "callee has no task yet");
                return;
            }
            None => {
                trace!(callee = %id, "stale callee");
                return;
            }
        };

        let previous = self.shared.current.replace(Some(id));
        trace!(callee = %id, "resume");
        let resumed = task.resume();
        self.shared.current.set(previous);

        let finished = self
            .with_frame(id, move |frame| {
                frame.running = false;
                frame.input = None;
                let result = if let Some(err) = frame.fault.take() {
                    Err(err)
                } else if frame.terminating {
                    frame.exit_value.take().unwrap_or_else(|| Ok(Value::unit()))
                } else {
                    match resumed {
                        Resumed::Finished(result) => result,
                        Resumed::Suspended => {
                            frame.task = Some(task);
                            return None;
                        }
                    }
                };
                Some((result, task))
            })
            .flatten();

        if let Some((result, task)) = finished {
            // Drop the body before teardown so its locals go first.
            drop(task);
            self.dispose(id, result);
        }
    }

    /// Tear `id` down with `result`: revoke its registrations, run its exit
    /// hook, cancel its children and report `result` to its parent. A parent
    /// blocked in `await_children` is resumed once its last child is gone.
    ///
    /// Idempotent. A callee that is running right now is only marked; it is
    /// torn down when its resumption returns.
    pub fn dispose(&self, id: CalleeId, result: TaskResult) {
        let deferred = self.with_frame(id, |frame| {
            if frame.running {
                frame.terminating = true;
                if frame.exit_value.is_none() {
                    frame.exit_value = Some(result);
                }
                None
            } else {
                Some(result)
            }
        });
        let Some(Some(result)) = deferred else {
            return;
        };

        let mut frame = self.shared.frames.borrow_mut().remove(id.key());
        let reactor = &self.shared.reactor;

        if let Some(token) = frame.timer.take() {
            reactor.revoke(token);
        } else if let Some(tokens) = frame.signals.take() {
            for token in tokens {
                reactor.revoke(token);
            }
        }
        for token in frame.pending_io.drain() {
            reactor.revoke(token);
        }
        frame.read_map.clear();
        frame.write_map.clear();

        if let Some(hook) = frame.exit_hook.take() {
            match panic::catch_unwind(AssertUnwindSafe(hook)) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(callee = %id, error = %err, "exit hook failed"),
                Err(payload) => {
                    warn!(callee = %id, panic = %panic_message(payload), "exit hook panicked")
                }
            }
        }

        let children = mem::take(&mut frame.children);
        let parent = frame.parent.take();
        let task = frame.task.take();
        frame.recycle();
        {
            let mut pool = self.shared.pool.borrow_mut();
            if pool.len() < self.shared.config.pool_capacity {
                pool.push(frame);
            }
        }
        drop(task);
        self.shared.runq.borrow_mut().remove(&id);

        {
            let mut runq = self.shared.runq.borrow_mut();
            for child in &children {
                runq.remove(child);
            }
        }
        for child in children {
            self.with_frame(child, |frame| frame.parent = None);
            self.dispose(child, Err(Error::Cancelled));
        }

        match &result {
            Ok(_) => debug!(callee = %id, "callee finished"),
            Err(Error::Cancelled) => debug!(callee = %id, "callee cancelled"),
            Err(err) => error!(callee = %id, error = %err, "callee failed"),
        }

        let Some(parent) = parent else {
            return;
        };
        let last = self
            .with_frame(parent, |frame| {
                frame.children.retain(|child| *child != id);
                if !frame.waiting_children {
                    return None;
                }
                if !frame.children.is_empty() {
                    frame.joined.push((id, result));
                    return None;
                }
                frame.waiting_children = false;
                Some(result)
            })
            .flatten();
        if let Some(result) = last {
            self.call(parent, Resume::Joined { child: id, result });
        }
    }

    /// Resume everything due in the run queue. Returns the time until the
    /// next delayed entry.
    pub fn consume(&self) -> Option<Duration> {
        RunQ::consume(&self.shared.runq, |id| self.call(id, Resume::Wake))
    }

    /// Resume the callees named by `events`.
    ///
    /// A callee waits on one registration at a time, so only its first event
    /// in a batch can be the one it waits for; later ones belong to
    /// registrations its first resumption already dropped.
    pub fn dispatch<I>(&self, events: I)
    where
        I: IntoIterator<Item = Event>,
    {
        let mut resumed = Vec::new();
        for event in events {
            if resumed.contains(&event.callee) {
                trace!(callee = %event.callee, token = %event.token, "dropping stale event");
                continue;
            }
            resumed.push(event.callee);
            self.call(event.callee, Resume::Event(event));
        }
    }

    /// One scheduling round: drain the run queue, wait on the reactor for at
    /// most `timeout` (less if queued work is due sooner), and resume the
    /// callees whose registrations fired. Returns the number of events.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        self.turn_inner(timeout).map(|(n, _)| n)
    }

    fn turn_inner(&self, timeout: Option<Duration>) -> io::Result<(usize, Option<Duration>)> {
        let next_due = self.consume();
        let wait = if self.shared.runq.borrow().has_ready() {
            Some(Duration::ZERO)
        } else {
            let wanted = match (timeout, next_due) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            self.shared.config.clamp_timeout(wanted)
        };

        let mut events = mem::take(&mut *self.shared.events.borrow_mut());
        let polled = self.shared.reactor.poll(&mut events, wait);
        let n = match polled {
            Ok(n) => {
                self.dispatch(events.drain(..));
                n
            }
            Err(err) => {
                events.clear();
                *self.shared.events.borrow_mut() = events;
                return Err(err);
            }
        };
        *self.shared.events.borrow_mut() = events;
        Ok((n, wait))
    }

    /// Nothing can make progress: the run queue is empty and the reactor has
    /// nothing that will fire.
    fn is_stalled(&self, turned: Option<(usize, Option<Duration>)>) -> bool {
        if !self.shared.runq.borrow().is_empty() {
            return false;
        }
        match turned {
            None => self.shared.reactor.is_empty(),
            // An unbounded wait that came back empty.
            Some((n, wait)) => n == 0 && wait.is_none(),
        }
    }

    /// Drive the runtime until no callee is alive.
    pub fn run(&self) -> io::Result<()> {
        let mut turned = None;
        while self.live() > 0 {
            if self.is_stalled(None) || turned.is_some_and(|t| self.is_stalled(Some(t))) {
                warn!(live = self.live(), "runtime stalled");
                return Ok(());
            }
            turned = Some(self.turn_inner(None)?);
        }
        Ok(())
    }

    /// Run `f` as a new root callee and drive the runtime until it is gone.
    /// Returns its result.
    ///
    /// Must not be called from inside a task.
    pub fn block_on<F, Fut>(&self, f: F) -> TaskResult
    where
        F: FnOnce(Cx) -> Fut + 'static,
        Fut: Future<Output = TaskResult> + 'static,
    {
        let out = Rc::new(RefCell::new(None));
        let sink = out.clone();
        self.spawn(move |cx| async move {
            cx.spawn(f);
            if let Some((_, result)) = cx.await_children().await {
                *sink.borrow_mut() = Some(result);
            }
            Ok(Value::unit())
        });

        let mut turned = None;
        loop {
            if let Some(result) = out.borrow_mut().take() {
                return result;
            }
            if self.is_stalled(None) || turned.is_some_and(|t| self.is_stalled(Some(t))) {
                return Err(Error::Stalled { live: self.live() });
            }
            turned = Some(self.turn_inner(None)?);
        }
    }

    pub(crate) fn with_frame<R>(&self, id: CalleeId, f: impl FnOnce(&mut Frame) -> R) -> Option<R> {
        let mut frames = self.shared.frames.borrow_mut();
        let frame = frames
            .get_mut(id.key())
            .filter(|frame| frame.generation == id.generation())?;
        Some(f(frame))
    }
}
