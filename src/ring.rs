//! Fixed-capacity ring buffer shared by the log and trace stores.

/// Circular buffer that overwrites its oldest slot once full.
#[derive(Debug)]
pub struct Ring<T> {
    slots: Vec<Option<T>>,
    next: usize,
}

impl<T: Clone> Ring<T> {
    /// Create a ring holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, next: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn push(&mut self, item: T) {
        let cap = self.slots.len();
        self.slots[self.next] = Some(item);
        self.next = (self.next + 1) % cap;
    }

    /// Up to `n` items, newest first. `n == 0` or `n > capacity` means all.
    pub fn newest_first(&self, n: usize) -> Vec<T> {
        let cap = self.slots.len();
        let n = if n == 0 || n > cap { cap } else { n };
        let mut out = Vec::with_capacity(n);
        let mut idx = (self.next + cap - 1) % cap;
        for _ in 0..cap {
            if out.len() >= n {
                break;
            }
            if let Some(item) = &self.slots[idx] {
                out.push(item.clone());
            }
            idx = (idx + cap - 1) % cap;
        }
        out
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}
