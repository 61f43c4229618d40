use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use polling::{Event as Interest, Events, Poller};
use slab::Slab;

use super::signal::SignalSource;
use super::{Direction, Event, Reactor, Token};
use crate::callee::CalleeId;

/// A descriptor known to the poller. Every registration on the fd, in
/// either direction and from any callee, shares one poller entry keyed by
/// the fd.
struct Source {
    read: Vec<usize>,
    write: Vec<usize>,
    /// Whether we've called poller.add() for this fd.
    registered: bool,
}

impl Source {
    fn keys(&mut self, direction: Direction) -> &mut Vec<usize> {
        match direction {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }

    fn is_unused(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

/// A signal source plus the number of registrations watching it.
struct Watched {
    source: SignalSource,
    watchers: usize,
}

enum Kind {
    Io {
        fd: RawFd,
        direction: Direction,
    },
    Timer {
        deadline: Instant,
        after: Duration,
        oneshot: bool,
    },
    Signal {
        signo: i32,
        oneshot: bool,
    },
}

struct Registration {
    serial: u64,
    callee: CalleeId,
    kind: Kind,
    armed: bool,
}

/// Reactor over the OS poller: owns the poller, descriptor interest, the
/// timer heap and one signal source per watched signal.
pub struct PollReactor {
    poller: Poller,
    regs: RefCell<Slab<Registration>>,
    sources: RefCell<HashMap<RawFd, Source>>,
    /// Armed timers ordered by (deadline, slab key).
    timers: RefCell<BTreeSet<(Instant, usize)>>,
    signals: RefCell<HashMap<i32, Watched>>,
    events: RefCell<Events>,
    serial: Cell<u64>,
}

impl PollReactor {
    pub fn new() -> io::Result<Self> {
        Ok(PollReactor {
            poller: Poller::new()?,
            regs: RefCell::new(Slab::new()),
            sources: RefCell::new(HashMap::new()),
            timers: RefCell::new(BTreeSet::new()),
            signals: RefCell::new(HashMap::new()),
            events: RefCell::new(Events::new()),
            serial: Cell::new(0),
        })
    }

    fn insert(&self, regs: &mut Slab<Registration>, callee: CalleeId, kind: Kind) -> Token {
        let serial = self.serial.get() + 1;
        self.serial.set(serial);
        let key = regs.insert(Registration {
            serial,
            callee,
            kind,
            armed: true,
        });
        Token::new(key, serial)
    }

    /// Sync OS poller interest with the armed registrations of `fd`.
    fn update_interest(
        &self,
        fd: RawFd,
        source: &mut Source,
        regs: &Slab<Registration>,
    ) -> io::Result<()> {
        let armed = |keys: &[usize]| {
            keys.iter()
                .any(|key| regs.get(*key).is_some_and(|reg| reg.armed))
        };
        let interest = Interest::new(fd as usize, armed(&source.read), armed(&source.write));

        if source.registered {
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            // modify() re-arms oneshot interest.
            self.poller.modify(&borrowed, interest)
        } else {
            // add() is unsafe because we must delete before the fd is closed;
            // revoke() takes care of that.
            unsafe { self.poller.add(fd, interest)? };
            source.registered = true;
            Ok(())
        }
    }

    /// Route `signo` into the poller, or count one more watcher of it.
    fn watch_signal(&self, signo: i32) -> io::Result<()> {
        let mut signals = self.signals.borrow_mut();
        if let Some(watched) = signals.get_mut(&signo) {
            watched.watchers += 1;
            return Ok(());
        }
        let source = SignalSource::new(signo)?;
        let fd = source.read_fd();
        unsafe { self.poller.add(fd, Interest::readable(fd as usize))? };
        signals.insert(signo, Watched { source, watchers: 1 });
        Ok(())
    }

    /// Drop one watcher of `signo`; the last one unhooks the signal.
    fn unwatch_signal(&self, signo: i32) {
        let mut signals = self.signals.borrow_mut();
        let Some(watched) = signals.get_mut(&signo) else {
            return;
        };
        watched.watchers -= 1;
        if watched.watchers > 0 {
            return;
        }
        if let Some(watched) = signals.remove(&signo) {
            let borrowed = unsafe { BorrowedFd::borrow_raw(watched.source.read_fd()) };
            let _ = self.poller.delete(&borrowed);
        }
    }

    /// The signal whose source sits behind poller key `key`.
    fn signal_at(&self, key: usize) -> Option<i32> {
        self.signals
            .borrow()
            .values()
            .find(|watched| watched.source.read_fd() as usize == key)
            .map(|watched| watched.source.signo())
    }

    /// Queue expired timers. Returns the time until the next one.
    fn fire_timers(&self, events: &mut Vec<Event>) -> Option<Duration> {
        let now = Instant::now();
        let mut regs = self.regs.borrow_mut();
        let mut timers = self.timers.borrow_mut();

        let due: Vec<(Instant, usize)> = timers.range(..=(now, usize::MAX)).copied().collect();
        for (deadline, key) in due {
            timers.remove(&(deadline, key));
            let Some(reg) = regs.get_mut(key) else {
                continue;
            };
            let Kind::Timer {
                deadline: next,
                after,
                oneshot,
            } = &mut reg.kind
            else {
                continue;
            };
            if *oneshot {
                reg.armed = false;
            } else {
                *next = deadline + (*after).max(Duration::from_nanos(1));
                timers.insert((*next, key));
            }
            events.push(Event {
                callee: reg.callee,
                token: Token::new(key, reg.serial),
                hup: false,
            });
        }

        timers
            .first()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    fn fire_io(&self, fd: RawFd, readable: bool, writable: bool, hup: bool, events: &mut Vec<Event>) {
        let mut regs = self.regs.borrow_mut();
        let mut sources = self.sources.borrow_mut();
        let Some(source) = sources.get_mut(&fd) else {
            return;
        };

        for (keys, ready) in [(&source.read, readable || hup), (&source.write, writable || hup)] {
            if !ready {
                continue;
            }
            for &key in keys {
                let Some(reg) = regs.get_mut(key).filter(|reg| reg.armed) else {
                    continue;
                };
                reg.armed = false;
                events.push(Event {
                    callee: reg.callee,
                    token: Token::new(key, reg.serial),
                    hup,
                });
            }
        }

        // The poller dropped all interest for this fd when it fired; restore
        // whatever is still armed.
        let _ = self.update_interest(fd, source, &regs);
    }

    fn fire_signal(&self, signo: i32, events: &mut Vec<Event>) -> io::Result<()> {
        let delivered = {
            let signals = self.signals.borrow();
            let Some(watched) = signals.get(&signo) else {
                return Ok(());
            };
            let delivered = watched.source.drain();
            let fd = watched.source.read_fd();
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            self.poller
                .modify(&borrowed, Interest::readable(fd as usize))?;
            delivered
        };
        if !delivered {
            return Ok(());
        }

        let mut regs = self.regs.borrow_mut();
        for (key, reg) in regs.iter_mut() {
            let Kind::Signal { signo: watched, oneshot } = reg.kind else {
                continue;
            };
            if !reg.armed || watched != signo {
                continue;
            }
            reg.armed = !oneshot;
            events.push(Event {
                callee: reg.callee,
                token: Token::new(key, reg.serial),
                hup: false,
            });
        }
        Ok(())
    }
}

fn lookup(regs: &mut Slab<Registration>, token: Token) -> Option<&mut Registration> {
    regs.get_mut(token.key())
        .filter(|reg| reg.serial == token.serial())
}

impl Reactor for PollReactor {
    fn register_io(
        &self,
        callee: CalleeId,
        fd: RawFd,
        direction: Direction,
    ) -> io::Result<Token> {
        let mut regs = self.regs.borrow_mut();
        let mut sources = self.sources.borrow_mut();
        let source = sources.entry(fd).or_insert(Source {
            read: Vec::new(),
            write: Vec::new(),
            registered: false,
        });

        let token = self.insert(&mut regs, callee, Kind::Io { fd, direction });
        source.keys(direction).push(token.key());

        if let Err(err) = self.update_interest(fd, source, &regs) {
            source.keys(direction).retain(|key| *key != token.key());
            regs.remove(token.key());
            if source.is_unused() && !source.registered {
                sources.remove(&fd);
            }
            return Err(err);
        }
        Ok(token)
    }

    fn register_timer(
        &self,
        callee: CalleeId,
        after: Duration,
        oneshot: bool,
    ) -> io::Result<Token> {
        let deadline = Instant::now() + after;
        let mut regs = self.regs.borrow_mut();
        let token = self.insert(
            &mut regs,
            callee,
            Kind::Timer {
                deadline,
                after,
                oneshot,
            },
        );
        self.timers.borrow_mut().insert((deadline, token.key()));
        Ok(token)
    }

    fn register_signal(&self, callee: CalleeId, signo: i32, oneshot: bool) -> io::Result<Token> {
        self.watch_signal(signo)?;
        let mut regs = self.regs.borrow_mut();
        Ok(self.insert(&mut regs, callee, Kind::Signal { signo, oneshot }))
    }

    fn rearm(&self, token: Token) -> io::Result<()> {
        let mut regs = self.regs.borrow_mut();
        let Some(reg) = lookup(&mut regs, token) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{token} is not registered"),
            ));
        };
        reg.armed = true;
        match &mut reg.kind {
            Kind::Io { fd, .. } => {
                let fd = *fd;
                let mut sources = self.sources.borrow_mut();
                match sources.get_mut(&fd) {
                    Some(source) => self.update_interest(fd, source, &regs),
                    None => Ok(()),
                }
            }
            Kind::Timer {
                deadline, after, ..
            } => {
                let mut timers = self.timers.borrow_mut();
                timers.remove(&(*deadline, token.key()));
                *deadline = Instant::now() + *after;
                timers.insert((*deadline, token.key()));
                Ok(())
            }
            Kind::Signal { .. } => Ok(()),
        }
    }

    fn disarm(&self, token: Token) {
        let mut regs = self.regs.borrow_mut();
        let Some(reg) = lookup(&mut regs, token) else {
            return;
        };
        reg.armed = false;
        match reg.kind {
            Kind::Io { fd, .. } => {
                if let Some(source) = self.sources.borrow_mut().get_mut(&fd) {
                    let _ = self.update_interest(fd, source, &regs);
                }
            }
            Kind::Timer { deadline, .. } => {
                self.timers.borrow_mut().remove(&(deadline, token.key()));
            }
            Kind::Signal { .. } => {}
        }
    }

    fn ident(&self, token: Token) -> Option<i32> {
        let mut regs = self.regs.borrow_mut();
        match lookup(&mut regs, token)?.kind {
            Kind::Io { fd, .. } => Some(fd),
            Kind::Signal { signo, .. } => Some(signo),
            Kind::Timer { .. } => None,
        }
    }

    fn revoke(&self, token: Token) {
        let mut regs = self.regs.borrow_mut();
        if lookup(&mut regs, token).is_none() {
            return;
        }
        let reg = regs.remove(token.key());
        match reg.kind {
            Kind::Io { fd, direction } => {
                let mut sources = self.sources.borrow_mut();
                let Some(source) = sources.get_mut(&fd) else {
                    return;
                };
                source.keys(direction).retain(|key| *key != token.key());
                if source.is_unused() {
                    if source.registered {
                        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                        // Ignore errors; the caller may have closed the fd.
                        let _ = self.poller.delete(&borrowed);
                    }
                    sources.remove(&fd);
                } else {
                    let _ = self.update_interest(fd, source, &regs);
                }
            }
            Kind::Timer { deadline, .. } => {
                self.timers.borrow_mut().remove(&(deadline, token.key()));
            }
            Kind::Signal { signo, .. } => self.unwatch_signal(signo),
        }
    }

    /// Process expired timers, wait for the OS, translate readiness into
    /// events for the registered callees.
    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let start = events.len();

        // 1. Expired timers.
        let next_timer = self.fire_timers(events);

        // 2. Effective timeout: min(caller, next timer), zero if we already
        //    have something to report.
        let timeout = if events.len() > start {
            Some(Duration::ZERO)
        } else {
            match (timeout, next_timer) {
                (None, None) => None,
                (Some(t), None) | (None, Some(t)) => Some(t),
                (Some(a), Some(b)) => Some(a.min(b)),
            }
        };

        // 3. Poll the OS.
        let fired: Vec<(usize, bool, bool, bool)> = {
            let mut os_events = self.events.borrow_mut();
            os_events.clear();
            match self.poller.wait(&mut os_events, timeout) {
                Ok(_) => {}
                // A signal landed mid-wait; its byte is in the socket now.
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    os_events.clear();
                    self.poller.wait(&mut os_events, Some(Duration::ZERO))?;
                }
                Err(err) => return Err(err),
            }
            os_events
                .iter()
                .map(|ev| (ev.key, ev.readable, ev.writable, ev.is_interrupt()))
                .collect()
        };

        // 4. Translate.
        for (key, readable, writable, hup) in fired {
            match self.signal_at(key) {
                Some(signo) => self.fire_signal(signo, events)?,
                None => self.fire_io(key as RawFd, readable, writable, hup, events),
            }
        }

        // 5. Timers that expired while we waited.
        self.fire_timers(events);

        Ok(events.len() - start)
    }

    /// Disarmed registrations cannot fire, so they do not count.
    fn is_empty(&self) -> bool {
        !self.regs.borrow().iter().any(|(_, reg)| reg.armed)
    }
}

impl Drop for PollReactor {
    fn drop(&mut self) {
        // Each source unhooks its signal when dropped with the map.
        for watched in self.signals.get_mut().values() {
            let borrowed = unsafe { BorrowedFd::borrow_raw(watched.source.read_fd()) };
            let _ = self.poller.delete(&borrowed);
        }
    }
}
