//! Admission slot table.
//!
//! A fixed table bounds concurrent connections; the slot index doubles
//! as the client identifier in every log line. Claim and release are
//! the only critical sections in the broker and both are a few loads
//! under one mutex.

use parking_lot::Mutex;

struct Slots {
    occupied: Vec<bool>,
    active: usize,
}

/// Bounded table of connection slots.
///
/// A connection occupies its slot from admission until its worker has
/// finished teardown, so `active() + free()` always equals the
/// configured capacity.
///
/// # Test
///
/// ```
/// use rdma_broker_service::SlotTable;
///
/// let table = SlotTable::new(2);
///
/// assert_eq!(table.claim(), Some(0));
/// assert_eq!(table.claim(), Some(1));
/// assert_eq!(table.claim(), None);
///
/// table.release(0);
/// assert_eq!(table.claim(), Some(0));
/// ```
pub struct SlotTable {
    slots: Mutex<Slots>,
    capacity: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);

        Self {
            slots: Mutex::new(Slots {
                occupied: vec![false; capacity],
                active: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim the lowest free slot, or `None` when the table is full.
    pub fn claim(&self) -> Option<usize> {
        let mut slots = self.slots.lock();

        let id = slots.occupied.iter().position(|used| !used)?;
        slots.occupied[id] = true;
        slots.active += 1;
        Some(id)
    }

    /// Return a slot to the free pool. Releasing a slot that is already
    /// free is a no-op, mirroring the idempotent teardown path.
    pub fn release(&self, id: usize) {
        assert!(id < self.capacity);

        let mut slots = self.slots.lock();
        if !slots.occupied[id] {
            return;
        }

        slots.occupied[id] = false;
        slots.active -= 1;
    }

    pub fn active(&self) -> usize {
        self.slots.lock().active
    }

    pub fn free(&self) -> usize {
        self.capacity - self.active()
    }
}

#[cfg(test)]
mod tests {
    use super::SlotTable;

    #[test]
    fn slot_conservation() {
        let table = SlotTable::new(10);

        let claimed: Vec<usize> = (0..7).map(|_| table.claim().unwrap()).collect();
        assert_eq!(table.active() + table.free(), table.capacity());
        assert_eq!(table.active(), 7);

        for id in &claimed[..3] {
            table.release(*id);
        }

        assert_eq!(table.active() + table.free(), table.capacity());
        assert_eq!(table.active(), 4);
    }

    #[test]
    fn claim_rejects_at_capacity() {
        let table = SlotTable::new(3);

        for expected in 0..3 {
            assert_eq!(table.claim(), Some(expected));
        }

        assert_eq!(table.claim(), None);
        assert_eq!(table.claim(), None);

        table.release(1);
        assert_eq!(table.claim(), Some(1));
        assert_eq!(table.claim(), None);
    }

    #[test]
    fn double_release_is_idempotent() {
        let table = SlotTable::new(2);

        let id = table.claim().unwrap();
        table.release(id);
        table.release(id);

        assert_eq!(table.active(), 0);
        assert_eq!(table.free(), 2);
    }
}
