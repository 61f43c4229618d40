//! Deterministic reactor for tests.
//!
//! [`LabReactor`] never touches the OS. Time is virtual and only moves through
//! [`LabReactor::advance`] or a `poll` that would otherwise block; readiness
//! and signals are delivered on request; registration and re-arm failures can
//! be injected per descriptor, signal or token.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use slab::Slab;

use super::{Direction, Event, Reactor, Token};
use crate::callee::CalleeId;

enum Kind {
    Io { fd: RawFd, direction: Direction },
    Timer { deadline: Duration, after: Duration, oneshot: bool },
    Signal { signo: i32, oneshot: bool },
}

struct Registration {
    serial: u64,
    callee: CalleeId,
    kind: Kind,
    armed: bool,
}

#[derive(Default)]
struct LabState {
    regs: Slab<Registration>,
    serial: u64,
    now: Duration,
    timers: BTreeSet<(Duration, usize)>,
    pending: VecDeque<Event>,
    poisoned_fds: HashSet<RawFd>,
    poisoned_signals: HashSet<i32>,
    failing_rearms: HashSet<Token>,
    revoked: Vec<Token>,
    rearms: usize,
}

impl LabState {
    fn insert(&mut self, callee: CalleeId, kind: Kind) -> Token {
        self.serial += 1;
        let serial = self.serial;
        let key = self.regs.insert(Registration {
            serial,
            callee,
            kind,
            armed: true,
        });
        Token::new(key, serial)
    }

    fn get_mut(&mut self, token: Token) -> Option<&mut Registration> {
        self.regs
            .get_mut(token.key())
            .filter(|reg| reg.serial == token.serial())
    }

    /// Queue an event for an armed registration and disarm it if it is
    /// one-shot.
    fn fire(&mut self, token: Token, hup: bool) -> bool {
        let Some(reg) = self.get_mut(token) else {
            return false;
        };
        if !reg.armed {
            return false;
        }
        match reg.kind {
            Kind::Io { .. } => reg.armed = false,
            Kind::Signal { oneshot, .. } | Kind::Timer { oneshot, .. } => reg.armed = !oneshot,
        }
        let event = Event {
            callee: reg.callee,
            token,
            hup,
        };
        self.pending.push_back(event);
        true
    }

    fn fire_timers(&mut self) {
        let now = self.now;
        let due: Vec<(Duration, usize)> = self
            .timers
            .range(..=(now, usize::MAX))
            .copied()
            .collect();
        for (deadline, key) in due {
            self.timers.remove(&(deadline, key));
            let Some(reg) = self.regs.get_mut(key) else {
                continue;
            };
            let token = Token::new(key, reg.serial);
            if let Kind::Timer {
                deadline: next,
                after,
                oneshot: false,
            } = &mut reg.kind
            {
                *next = deadline + (*after).max(Duration::from_nanos(1));
                let next = *next;
                self.timers.insert((next, key));
            }
            self.fire(token, false);
        }
    }

    fn next_timer(&self) -> Option<Duration> {
        self.timers.first().map(|(deadline, _)| *deadline)
    }
}

/// Virtual-time reactor with failure injection.
#[derive(Default)]
pub struct LabReactor {
    state: RefCell<LabState>,
}

impl LabReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// Move the clock forward and queue every timer that became due.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.borrow_mut();
        state.now += by;
        state.fire_timers();
    }

    /// Report readiness for a registration. Returns false if the token is
    /// unknown or not armed.
    pub fn fire(&self, token: Token, hup: bool) -> bool {
        self.state.borrow_mut().fire(token, hup)
    }

    /// Report readiness to every registration watching `fd` in `direction`.
    /// Returns how many fired.
    pub fn ready(&self, fd: RawFd, direction: Direction, hup: bool) -> usize {
        let mut state = self.state.borrow_mut();
        let tokens: Vec<Token> = state
            .regs
            .iter()
            .filter(|(_, reg)| {
                matches!(reg.kind, Kind::Io { fd: f, direction: d } if f == fd && d == direction)
            })
            .map(|(key, reg)| Token::new(key, reg.serial))
            .collect();
        tokens
            .into_iter()
            .filter(|token| state.fire(*token, hup))
            .count()
    }

    /// Deliver a signal to every armed watcher. Returns how many fired.
    pub fn raise(&self, signo: i32) -> usize {
        let mut state = self.state.borrow_mut();
        let tokens: Vec<Token> = state
            .regs
            .iter()
            .filter(|(_, reg)| matches!(reg.kind, Kind::Signal { signo: s, .. } if s == signo))
            .map(|(key, reg)| Token::new(key, reg.serial))
            .collect();
        tokens
            .into_iter()
            .filter(|token| state.fire(*token, false))
            .count()
    }

    /// Queue an arbitrary event, bypassing registration checks.
    pub fn inject(&self, event: Event) {
        self.state.borrow_mut().pending.push_back(event);
    }

    /// Make every future registration of `fd` fail.
    pub fn poison_fd(&self, fd: RawFd) {
        self.state.borrow_mut().poisoned_fds.insert(fd);
    }

    /// Make every future registration of `signo` fail.
    pub fn poison_signal(&self, signo: i32) {
        self.state.borrow_mut().poisoned_signals.insert(signo);
    }

    /// Make the next re-arm of `token` fail.
    pub fn fail_rearm(&self, token: Token) {
        self.state.borrow_mut().failing_rearms.insert(token);
    }

    /// Live registrations.
    pub fn registrations(&self) -> usize {
        self.state.borrow().regs.len()
    }

    /// Every token revoked so far, in order.
    pub fn revoked(&self) -> Vec<Token> {
        self.state.borrow().revoked.clone()
    }

    /// Successful re-arms so far.
    pub fn rearms(&self) -> usize {
        self.state.borrow().rearms
    }

    pub fn is_armed(&self, token: Token) -> bool {
        self.state
            .borrow_mut()
            .get_mut(token)
            .is_some_and(|reg| reg.armed)
    }

    pub fn token_for(&self, fd: RawFd, direction: Direction) -> Option<Token> {
        let state = self.state.borrow();
        state
            .regs
            .iter()
            .find(|(_, reg)| {
                matches!(reg.kind, Kind::Io { fd: f, direction: d } if f == fd && d == direction)
            })
            .map(|(key, reg)| Token::new(key, reg.serial))
    }

    /// Tokens of live timer registrations.
    pub fn timers(&self) -> Vec<Token> {
        let state = self.state.borrow();
        state
            .regs
            .iter()
            .filter(|(_, reg)| matches!(reg.kind, Kind::Timer { .. }))
            .map(|(key, reg)| Token::new(key, reg.serial))
            .collect()
    }

    /// Tokens of live signal registrations.
    pub fn signals(&self) -> Vec<Token> {
        let state = self.state.borrow();
        state
            .regs
            .iter()
            .filter(|(_, reg)| matches!(reg.kind, Kind::Signal { .. }))
            .map(|(key, reg)| Token::new(key, reg.serial))
            .collect()
    }
}

impl Reactor for LabReactor {
    fn register_io(
        &self,
        callee: CalleeId,
        fd: RawFd,
        direction: Direction,
    ) -> io::Result<Token> {
        if self.state.borrow().poisoned_fds.contains(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("fd {fd} refused by lab reactor"),
            ));
        }
        Ok(self
            .state
            .borrow_mut()
            .insert(callee, Kind::Io { fd, direction }))
    }

    fn register_timer(
        &self,
        callee: CalleeId,
        after: Duration,
        oneshot: bool,
    ) -> io::Result<Token> {
        let mut state = self.state.borrow_mut();
        let deadline = state.now + after;
        let token = state.insert(
            callee,
            Kind::Timer {
                deadline,
                after,
                oneshot,
            },
        );
        state.timers.insert((deadline, token.key()));
        Ok(token)
    }

    fn register_signal(&self, callee: CalleeId, signo: i32, oneshot: bool) -> io::Result<Token> {
        let mut state = self.state.borrow_mut();
        if state.poisoned_signals.contains(&signo) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("signal {signo} refused by lab reactor"),
            ));
        }
        Ok(state.insert(callee, Kind::Signal { signo, oneshot }))
    }

    fn rearm(&self, token: Token) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.failing_rearms.remove(&token) {
            return Err(io::Error::other(format!("re-arm of {token} refused")));
        }
        let now = state.now;
        let Some(reg) = state.get_mut(token) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{token} is not registered"),
            ));
        };
        reg.armed = true;
        let rescheduled = match &mut reg.kind {
            Kind::Timer {
                deadline, after, ..
            } => {
                let old = *deadline;
                *deadline = now + *after;
                Some((old, *deadline))
            }
            _ => None,
        };
        if let Some((old, new)) = rescheduled {
            state.timers.remove(&(old, token.key()));
            state.timers.insert((new, token.key()));
        }
        state.rearms += 1;
        Ok(())
    }

    fn disarm(&self, token: Token) {
        let mut state = self.state.borrow_mut();
        let Some(reg) = state.get_mut(token) else {
            return;
        };
        reg.armed = false;
        if let Kind::Timer { deadline, .. } = reg.kind {
            state.timers.remove(&(deadline, token.key()));
        }
    }

    fn ident(&self, token: Token) -> Option<i32> {
        let mut state = self.state.borrow_mut();
        match state.get_mut(token)?.kind {
            Kind::Io { fd, .. } => Some(fd),
            Kind::Signal { signo, .. } => Some(signo),
            Kind::Timer { .. } => None,
        }
    }

    fn revoke(&self, token: Token) {
        let mut state = self.state.borrow_mut();
        if state.get_mut(token).is_none() {
            return;
        }
        let reg = state.regs.remove(token.key());
        if let Kind::Timer { deadline, .. } = reg.kind {
            state.timers.remove(&(deadline, token.key()));
        }
        state.revoked.push(token);
    }

    fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        state.fire_timers();

        // Nothing to deliver: let virtual time run to the next timer, as a
        // blocking wait would.
        if state.pending.is_empty() {
            if let Some(deadline) = state.next_timer() {
                let target = match timeout {
                    Some(t) => deadline.min(state.now + t),
                    None => deadline,
                };
                state.now = state.now.max(target);
                state.fire_timers();
            } else if let Some(t) = timeout {
                state.now += t;
            }
        }

        let n = state.pending.len();
        events.extend(state.pending.drain(..));
        Ok(n)
    }

    fn is_empty(&self) -> bool {
        !self.state.borrow().regs.iter().any(|(_, reg)| reg.armed)
    }
}
