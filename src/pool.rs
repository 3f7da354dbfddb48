//! Fixed-capacity arena of control blocks, addressed by slot index.
//!
//! Reference numbers handed to callers are derived from the slot index, so
//! slots never move. Free slots are kept on a list and reused lowest-first
//! after startup, most-recently-freed first afterwards.

#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Option<T>>,
    /// Reserved slots are neither free nor filled.
    reserved: Vec<bool>,
    free: Vec<usize>,
}

impl<T> Pool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            reserved: vec![false; capacity],
            free: (0..capacity).rev().collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Filled slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a free slot without filling it yet. `None` when exhausted.
    pub fn reserve(&mut self) -> Option<usize> {
        let index = self.free.pop()?;
        self.reserved[index] = true;
        Some(index)
    }

    /// Fill a slot obtained from [`Pool::reserve`].
    pub fn fill(&mut self, index: usize, value: T) {
        debug_assert!(self.reserved[index]);
        self.reserved[index] = false;
        self.slots[index] = Some(value);
    }

    /// Return a reserved slot unused.
    pub fn unreserve(&mut self, index: usize) {
        if self.reserved[index] {
            self.reserved[index] = false;
            self.free.push(index);
        }
    }

    pub fn insert(&mut self, value: T) -> Option<usize> {
        let index = self.reserve()?;
        self.fill(index, value);
        Some(index)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take()?;
        self.free.push(index);
        Some(value)
    }

    /// Filled slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|value| (i, value)))
    }

    pub fn find(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<(usize, &T)> {
        self.iter().find(|(_, value)| predicate(value))
    }
}
