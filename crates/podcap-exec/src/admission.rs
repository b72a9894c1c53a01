//! Non-blocking admission slots.
//!
//! A [`Slot`] is a move-only token: the only way to give it back is
//! [`SlotPool::release`], which consumes it, so a slot is returned at most once no matter
//! how many paths race to tear a capture down.

#[must_use = "a slot that is dropped without release leaks pool capacity"]
#[derive(Debug)]
pub(crate) struct Slot {
    _private: (),
}

#[derive(Debug)]
pub(crate) struct SlotPool {
    capacity: usize,
    held: usize,
}

impl SlotPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, held: 0 }
    }

    /// Take a slot if one is free; never waits.
    pub(crate) fn try_acquire(&mut self) -> Option<Slot> {
        if self.held >= self.capacity {
            return None;
        }
        self.held += 1;
        Some(Slot { _private: () })
    }

    pub(crate) fn release(&mut self, slot: Slot) {
        let Slot { _private: () } = slot;
        self.held = self.held.saturating_sub(1);
    }

    pub(crate) fn held(&self) -> usize {
        self.held
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}
