use super::ContextId;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

type Key = (u64, u64);

/// Per-context transaction deadlines on a millisecond clock owned by the list.
///
/// The clock only moves when [`TimerList::age`] is called, so the caller
/// decides what elapsed time means. Entries with equal deadlines expire in
/// insertion order.
#[derive(Debug, Default)]
pub struct TimerList {
    now_ms: u64,
    seq: u64,
    deadlines: BTreeMap<Key, ContextId>,
    index: HashMap<ContextId, Key>,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.index.contains_key(&id)
    }

    /// Arms a timer for `id`, replacing any existing one.
    pub fn add(&mut self, id: ContextId, timeout: Duration) {
        self.remove(id);
        let key = (self.now_ms.saturating_add(millis(timeout)), self.seq);
        self.seq = self.seq.wrapping_add(1);
        self.deadlines.insert(key, id);
        self.index.insert(id, key);
    }

    pub fn remove(&mut self, id: ContextId) -> bool {
        match self.index.remove(&id) {
            Some(key) => {
                self.deadlines.remove(&key);
                true
            }
            None => false,
        }
    }

    pub fn remaining(&self, id: ContextId) -> Option<Duration> {
        self.index.get(&id).map(|&(deadline, _)| {
            Duration::from_millis(deadline.saturating_sub(self.now_ms))
        })
    }

    /// Time until the earliest deadline.
    pub fn next_expiry(&self) -> Option<Duration> {
        self.deadlines
            .keys()
            .next()
            .map(|&(deadline, _)| Duration::from_millis(deadline.saturating_sub(self.now_ms)))
    }

    /// Advances the clock and removes every timer that ran out, earliest first.
    pub fn age(&mut self, elapsed: Duration) -> Vec<ContextId> {
        self.now_ms = self.now_ms.saturating_add(millis(elapsed));
        let mut expired = Vec::new();
        while let Some((&key, &id)) = self.deadlines.first_key_value() {
            if key.0 > self.now_ms {
                break;
            }
            self.deadlines.remove(&key);
            self.index.remove(&id);
            expired.push(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_elapsed_timers_expire() {
        let mut timers = TimerList::new();
        let (fast, slow) = (ContextId::from_raw(1), ContextId::from_raw(2));
        timers.add(slow, Duration::from_millis(500));
        timers.add(fast, Duration::from_millis(50));

        assert_eq!(timers.age(Duration::from_millis(100)), vec![fast]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.remaining(slow), Some(Duration::from_millis(400)));
        assert_eq!(timers.remaining(fast), None);

        assert_eq!(timers.age(Duration::from_millis(400)), vec![slow]);
        assert!(timers.is_empty());
    }

    #[test]
    fn re_adding_replaces_the_deadline() {
        let mut timers = TimerList::new();
        let id = ContextId::from_raw(7);
        timers.add(id, Duration::from_millis(10));
        timers.age(Duration::from_millis(5));
        timers.add(id, Duration::from_millis(10));
        assert_eq!(timers.len(), 1);
        assert!(timers.age(Duration::from_millis(6)).is_empty());
        assert_eq!(timers.next_expiry(), Some(Duration::from_millis(4)));
        assert_eq!(timers.age(Duration::from_millis(4)), vec![id]);
    }

    #[test]
    fn equal_deadlines_expire_in_insertion_order() {
        let mut timers = TimerList::new();
        let ids: Vec<_> = (10..14).map(ContextId::from_raw).collect();
        for &id in &ids {
            timers.add(id, Duration::from_millis(20));
        }
        assert!(timers.remove(ids[1]));
        assert!(!timers.remove(ids[1]));
        assert_eq!(timers.age(Duration::from_secs(1)), vec![ids[0], ids[2], ids[3]]);
    }
}
