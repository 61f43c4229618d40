use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Ready queue of callees due for resumption.
///
/// Every key is pending at most once. Removal is lazy: the membership map is
/// the source of truth, and queue slots whose sequence number no longer
/// matches their key's membership entry are skipped when drained.
pub struct RunQ<K> {
    /// Entries due now, in push order.
    ready: VecDeque<(K, u64)>,
    /// Entries due later, ordered by (deadline, seq).
    delayed: BTreeMap<(Instant, u64), K>,
    /// key → seq of its live entry (and deadline, if delayed).
    members: HashMap<K, Member>,
    seq: u64,
}

#[derive(Clone, Copy)]
struct Member {
    seq: u64,
    due: Option<Instant>,
}

impl<K> Default for RunQ<K>
where
    K: Copy + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> RunQ<K>
where
    K: Copy + Eq + Hash,
{
    pub fn new() -> Self {
        RunQ {
            ready: VecDeque::new(),
            delayed: BTreeMap::new(),
            members: HashMap::new(),
            seq: 0,
        }
    }

    /// Schedule `key` now, or once `delay` has elapsed. Returns false if the
    /// key is already pending; the existing entry is left untouched.
    pub fn push(&mut self, key: K, delay: Option<Duration>) -> bool {
        if self.members.contains_key(&key) {
            return false;
        }
        let seq = self.seq;
        self.seq += 1;

        let due = match delay {
            Some(d) if !d.is_zero() => {
                let at = Instant::now() + d;
                self.delayed.insert((at, seq), key);
                Some(at)
            }
            _ => {
                self.ready.push_back((key, seq));
                None
            }
        };
        self.members.insert(key, Member { seq, due });
        true
    }

    /// Cancel a pending entry. Returns whether one was pending.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.members.remove(key) {
            Some(Member { seq, due: Some(at) }) => {
                self.delayed.remove(&(at, seq));
                true
            }
            // Ready slot stays in the deque and is skipped on drain.
            Some(Member { due: None, .. }) => true,
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.members.contains_key(key)
    }

    /// Whether something can run without waiting.
    pub fn has_ready(&self) -> bool {
        let now = Instant::now();
        self.ready.iter().any(|(k, seq)| self.is_live(k, *seq))
            || self.delayed.keys().next().is_some_and(|(at, _)| *at <= now)
    }

    /// Time until the earliest delayed entry is due.
    pub fn next_due(&self) -> Option<Duration> {
        let now = Instant::now();
        self.delayed
            .keys()
            .next()
            .map(|(at, _)| at.saturating_duration_since(now))
    }

    /// Resume every entry due when the drain starts, in FIFO order, with
    /// delayed entries that became due appended in deadline order.
    ///
    /// The queue is only borrowed between resumptions, so `resume` may push
    /// and remove entries. Entries removed before their turn are skipped;
    /// entries pushed during the drain run on the next one.
    ///
    /// Returns the time until the next delayed entry is due, `None` when
    /// nothing is delayed.
    pub fn consume(queue: &RefCell<Self>, mut resume: impl FnMut(K)) -> Option<Duration> {
        let batch = queue.borrow_mut().take_due(Instant::now());
        for (key, seq) in batch {
            let claimed = queue.borrow_mut().claim(&key, seq);
            if claimed {
                resume(key);
            }
        }
        queue.borrow().next_due()
    }

    /// Detach everything due at `now`. Membership stays until each entry is
    /// claimed, so removals and duplicate pushes are still honoured.
    fn take_due(&mut self, now: Instant) -> Vec<(K, u64)> {
        let mut batch: Vec<(K, u64)> = self.ready.drain(..).collect();
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, seq), key) = entry.remove_entry();
            batch.push((key, seq));
        }
        batch
    }

    fn claim(&mut self, key: &K, seq: u64) -> bool {
        if self.is_live(key, seq) {
            self.members.remove(key);
            true
        } else {
            false
        }
    }

    fn is_live(&self, key: &K, seq: u64) -> bool {
        self.members.get(key).is_some_and(|m| m.seq == seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &RefCell<RunQ<u32>>) -> Vec<u32> {
        let mut order = Vec::new();
        RunQ::consume(q, |k| order.push(k));
        order
    }

    #[test]
    fn consume_runs_in_fifo_order() {
        let q = RefCell::new(RunQ::new());
        for k in [1, 2, 3] {
            assert!(q.borrow_mut().push(k, None));
        }
        assert_eq!(q.borrow().len(), 3);
        assert_eq!(drain(&q), vec![1, 2, 3]);
        assert_eq!(q.borrow().len(), 0);
        assert!(q.borrow().is_empty());
    }

    #[test]
    fn duplicate_push_runs_once() {
        let q = RefCell::new(RunQ::new());
        assert!(q.borrow_mut().push(7, None));
        assert!(!q.borrow_mut().push(7, None));
        assert_eq!(q.borrow().len(), 1);
        assert_eq!(drain(&q), vec![7]);
    }

    #[test]
    fn removed_entry_never_runs() {
        let q = RefCell::new(RunQ::new());
        q.borrow_mut().push(1, None);
        q.borrow_mut().push(2, None);
        assert!(q.borrow_mut().remove(&1));
        assert!(!q.borrow_mut().remove(&1));
        assert_eq!(q.borrow().len(), 1);
        assert_eq!(drain(&q), vec![2]);
    }

    #[test]
    fn remove_then_push_takes_new_position() {
        let q = RefCell::new(RunQ::new());
        q.borrow_mut().push(1, None);
        q.borrow_mut().push(2, None);
        q.borrow_mut().remove(&1);
        q.borrow_mut().push(1, None);
        assert_eq!(drain(&q), vec![2, 1]);
    }

    #[test]
    fn removal_during_drain_is_honoured() {
        let q = RefCell::new(RunQ::new());
        for k in [1, 2, 3] {
            q.borrow_mut().push(k, None);
        }
        let mut order = Vec::new();
        RunQ::consume(&q, |k| {
            order.push(k);
            if k == 1 {
                q.borrow_mut().remove(&3);
            }
        });
        assert_eq!(order, vec![1, 2]);
        assert!(q.borrow().is_empty());
    }

    #[test]
    fn push_during_drain_waits_for_next_drain() {
        let q = RefCell::new(RunQ::new());
        q.borrow_mut().push(1, None);
        let mut order = Vec::new();
        RunQ::consume(&q, |k| {
            order.push(k);
            // Re-scheduling the running entry and adding a new one.
            assert!(q.borrow_mut().push(k, None));
            assert!(q.borrow_mut().push(9, None));
        });
        assert_eq!(order, vec![1]);
        assert_eq!(q.borrow().len(), 2);
        assert_eq!(drain(&q), vec![1, 9]);
    }

    #[test]
    fn delayed_entries_wait_for_deadline() {
        let q = RefCell::new(RunQ::new());
        q.borrow_mut().push(1, Some(Duration::from_millis(20)));
        q.borrow_mut().push(2, None);
        assert_eq!(q.borrow().len(), 2);

        let next = RunQ::consume(&q, |k| assert_eq!(k, 2));
        assert!(next.is_some_and(|d| d <= Duration::from_millis(20)));
        assert_eq!(q.borrow().len(), 1);
        assert!(!q.borrow().has_ready());

        std::thread::sleep(Duration::from_millis(25));
        assert!(q.borrow().has_ready());
        assert_eq!(drain(&q), vec![1]);
        assert!(q.borrow().next_due().is_none());
    }

    #[test]
    fn removing_delayed_entry_cancels_it() {
        let q = RefCell::new(RunQ::new());
        q.borrow_mut().push(4, Some(Duration::from_millis(1)));
        assert!(q.borrow_mut().remove(&4));
        std::thread::sleep(Duration::from_millis(2));
        assert!(drain(&q).is_empty());
        assert!(q.borrow().next_due().is_none());
    }

    #[test]
    fn zero_delay_is_immediate() {
        let q = RefCell::new(RunQ::new());
        q.borrow_mut().push(5, Some(Duration::ZERO));
        assert!(q.borrow().has_ready());
        assert_eq!(drain(&q), vec![5]);
    }
}
