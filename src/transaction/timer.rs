use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// Monotonic timer wheel.
///
/// Entries are ordered by deadline in a single map keyed by
/// `(deadline, id)`; the id disambiguates entries sharing an instant and
/// feeds a side index for cancellation. `poll` drains everything due at
/// or before the given instant.
pub struct Timer<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            entries: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, after: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + after, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().unwrap().insert((deadline, id), value);
        self.deadlines.write().unwrap().insert(id, deadline);
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.deadlines.write().unwrap().remove(&id)?;
        self.entries.write().unwrap().remove(&(deadline, id))
    }

    /// Remove and return every entry due at or before `now`, in deadline
    /// order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut entries = self.entries.write().unwrap();
        let mut deadlines = self.deadlines.write().unwrap();
        while let Some((&(deadline, id), _)) = entries.first_key_value() {
            if deadline > now {
                break;
            }
            if let Some(value) = entries.remove(&(deadline, id)) {
                due.push(value);
            }
            deadlines.remove(&id);
        }
        due
    }

    /// Drop every pending entry. Used on endpoint shutdown.
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
        self.deadlines.write().unwrap().clear();
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_returns_due_entries_in_order() {
        let timer = Timer::new();
        let now = Instant::now();
        timer.timeout_at(now + Duration::from_millis(20), "second");
        timer.timeout_at(now, "first");
        timer.timeout_at(now + Duration::from_secs(5), "later");

        let due = timer.poll(now + Duration::from_millis(100));
        assert_eq!(due, vec!["first", "second"]);
        assert_eq!(timer.len(), 1);

        let nothing = timer.poll(now + Duration::from_millis(100));
        assert!(nothing.is_empty());
    }

    #[test]
    fn cancel_removes_a_pending_entry() {
        let timer = Timer::new();
        let now = Instant::now();
        let id = timer.timeout_at(now, "gone");
        assert_eq!(timer.cancel(id), Some("gone"));
        assert_eq!(timer.cancel(id), None);
        assert!(timer.poll(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let timer = Timer::new();
        timer.timeout(Duration::from_secs(1), 1u32);
        timer.timeout(Duration::from_secs(2), 2u32);
        timer.clear();
        assert!(timer.is_empty());
    }
}
