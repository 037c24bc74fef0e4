use std::sync::Arc;
use std::time::Instant;

/// A fixed-capacity ring of the last `N` distinct entries that were read.
///
/// The ring holds strong handles to its values. This keeps recently shown resources alive
/// after the memory tier evicted them, so that they can be re-admitted without going to disk.
/// It does not influence which entry the memory tier evicts.
#[derive(Debug)]
pub(super) struct RecencyRing<V> {
    slots: Vec<Option<RingEntry<V>>>,
    /// Index of the most recently written slot.
    head: usize,
}

#[derive(Debug)]
pub(super) struct RingEntry<V> {
    pub key: Arc<str>,
    pub value: V,
    pub read_at: Instant,
}

impl<V: Clone> RecencyRing<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Self::empty_slots(capacity),
            head: 0,
        }
    }

    fn empty_slots(capacity: usize) -> Vec<Option<RingEntry<V>>> {
        std::iter::repeat_with(|| None).take(capacity).collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Records a read of `key`.
    ///
    /// A key that is already in the ring keeps its slot and only refreshes its read time.
    pub fn touch(&mut self, key: &str, value: &V) {
        if self.slots.is_empty() {
            return;
        }
        let now = Instant::now();
        if let Some(entry) = self.entry_mut(key) {
            entry.read_at = now;
            return;
        }

        self.head = (self.head + 1) % self.slots.len();
        self.slots[self.head] = Some(RingEntry {
            key: Arc::from(key),
            value: value.clone(),
            read_at: now,
        });
    }

    pub fn get(&self, key: &str) -> Option<&RingEntry<V>> {
        self.slots
            .iter()
            .flatten()
            .find(|entry| &*entry.key == key)
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut RingEntry<V>> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|entry| &*entry.key == key)
    }

    /// Changes the capacity of the ring.
    ///
    /// The ring loses its history when the capacity actually changes, and is left untouched
    /// otherwise. Returns whether the ring was reinitialized.
    pub fn resize(&mut self, capacity: usize) -> bool {
        if capacity == self.slots.len() {
            return false;
        }
        self.slots = Self::empty_slots(capacity);
        self.head = 0;
        true
    }

    /// Drops every entry for which `f` returns `false`.
    pub fn retain(&mut self, mut f: impl FnMut(&RingEntry<V>) -> bool) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|entry| !f(entry)) {
                *slot = None;
            }
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }
}
