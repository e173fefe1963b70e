use core::cell::Cell;

use critical_section::Mutex;

/// Single-element buffer shared between one producer and one consumer.
///
/// Producers and consumers run in different contexts (interrupt vs. main
/// loop), so every access goes through a critical section. The protocol never
/// re-arms a producer before the consumer emptied the slot; `put` on an
/// occupied slot is reported back instead of overwriting.
pub struct Slot<T: Copy> {
    inner: Mutex<Cell<Option<T>>>,
}

impl<T: Copy> Slot<T> {
    pub const fn new() -> Self {
        Self { inner: Mutex::new(Cell::new(None)) }
    }

    /// Stores `value`, handing it back if the slot is still occupied.
    pub fn put(&self, value: T) -> Result<(), T> {
        critical_section::with(|cs| {
            let cell = self.inner.borrow(cs);
            if cell.get().is_some() {
                Err(value)
            } else {
                cell.set(Some(value));
                Ok(())
            }
        })
    }

    /// Copies the content out without releasing the slot.
    pub fn peek(&self) -> Option<T> {
        critical_section::with(|cs| self.inner.borrow(cs).get())
    }

    pub fn clear(&self) {
        critical_section::with(|cs| self.inner.borrow(cs).set(None));
    }

    pub fn is_occupied(&self) -> bool {
        self.peek().is_some()
    }
}

impl<T: Copy> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}
