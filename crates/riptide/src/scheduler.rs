use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use tokio::time::Instant;

/// Handle to an entry registered with a [`Scheduler`]. One entry belongs to
/// at most one scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u64);

#[derive(Debug)]
struct EntryState<T> {
    payload: T,

    // Generation of the live heap item; stale heap items are skipped.
    scheduled: Option<(Instant, u64)>,
}

/// Timed task queue: a min-heap of entries keyed by absolute time.
///
/// `perform` pops and returns everything due; each fired entry is unbound
/// before it is handed to the caller, so handling code may re-schedule the
/// same entry. Cancellation is lazy: `erase` unbinds the entry and its heap
/// item is skipped when it surfaces.
#[derive(Debug)]
pub struct Scheduler<T> {
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    entries: HashMap<u64, EntryState<T>>,
    next_id: u64,
    next_gen: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Scheduler {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
            next_gen: 0,
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entry without scheduling it.
    pub fn add(&mut self, payload: T) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            EntryState {
                payload,
                scheduled: None,
            },
        );
        EntryId(id)
    }

    /// Unregisters the entry entirely, returning its payload.
    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        self.entries.remove(&id.0).map(|e| e.payload)
    }

    /// Schedules an unscheduled entry. Scheduling an already scheduled entry
    /// moves it, same as `update`.
    pub fn insert(&mut self, id: EntryId, time: Instant) {
        self.update(id, time);
    }

    /// (Re)schedules the entry at `time`.
    pub fn update(&mut self, id: EntryId, time: Instant) {
        let Some(entry) = self.entries.get_mut(&id.0) else {
            return;
        };
        let generation = self.next_gen;
        self.next_gen += 1;
        entry.scheduled = Some((time, generation));
        self.heap.push(Reverse((time, generation, id.0)));
    }

    /// Unschedules without unregistering. Idempotent.
    pub fn erase(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.scheduled = None;
        }
    }

    pub fn is_scheduled(&self, id: EntryId) -> bool {
        self.entries
            .get(&id.0)
            .is_some_and(|e| e.scheduled.is_some())
    }

    pub fn scheduled_time(&self, id: EntryId) -> Option<Instant> {
        self.entries.get(&id.0)?.scheduled.map(|(t, _)| t)
    }

    pub fn payload(&self, id: EntryId) -> Option<&T> {
        self.entries.get(&id.0).map(|e| &e.payload)
    }

    /// Earliest scheduled time, skipping cancelled heap leftovers.
    pub fn next_time(&mut self) -> Option<Instant> {
        while let Some(Reverse((time, generation, id))) = self.heap.peek().copied() {
            if self.is_live(id, time, generation) {
                return Some(time);
            }
            self.heap.pop();
        }
        None
    }

    fn is_live(&self, id: u64, time: Instant, generation: u64) -> bool {
        self.entries
            .get(&id)
            .and_then(|e| e.scheduled)
            .is_some_and(|(t, g)| t == time && g == generation)
    }

    /// Pops and returns all entries with `time <= now` in time order, each
    /// unbound before it is returned.
    pub fn perform(&mut self, now: Instant) -> Vec<(EntryId, T)>
    where
        T: Clone,
    {
        let mut fired = Vec::new();
        while let Some(Reverse((time, generation, id))) = self.heap.peek().copied() {
            if time > now {
                if self.is_live(id, time, generation) {
                    break;
                }
                self.heap.pop();
                continue;
            }
            self.heap.pop();
            if !self.is_live(id, time, generation) {
                continue;
            }
            let entry = self
                .entries
                .get_mut(&id)
                .expect("live heap item implies a registered entry");
            entry.scheduled = None;
            fired.push((EntryId(id), entry.payload.clone()));
        }
        fired
    }

    pub fn scheduled_len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.scheduled.is_some())
            .count()
    }
}
