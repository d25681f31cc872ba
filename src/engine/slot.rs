//! Per-slot state of a pipelined transfer.

use crate::runtime::DmaHandle;

/// State of one pipeline slot.
///
/// Slots cycle `Empty -> Filling -> InFlight -> Complete -> Empty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Free for the producer.
    Empty,
    /// Holds `len` staged bytes not yet handed to the engine.
    Filling(usize),
    /// Block transfer of `len` bytes outstanding.
    InFlight(DmaHandle, usize),
    /// Transfer of `len` bytes done, mailbox not yet updated.
    Complete(usize),
}

/// Ring of slots with a producer cursor and a consumer cursor.
///
/// The producer fills slots in order; the consumer retires them in the same
/// order, so chunk `k` always completes before chunk `k + 1` is signalled.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<SlotState>,
    producer: usize,
    consumer: usize,
    in_flight: usize,
}

impl SlotTable {
    /// A table of `split` empty slots.
    pub fn new(split: usize) -> Self {
        assert!(split > 0, "split must be non-zero");
        Self {
            slots: vec![SlotState::Empty; split],
            producer: 0,
            consumer: 0,
            in_flight: 0,
        }
    }

    /// Next slot the producer works on.
    #[inline]
    pub fn producer(&self) -> usize {
        self.producer
    }

    /// Oldest slot not yet retired.
    #[inline]
    pub fn consumer(&self) -> usize {
        self.consumer
    }

    /// Slots handed to the engine and not yet retired.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// State of slot `j`.
    #[inline]
    pub fn state(&self, j: usize) -> SlotState {
        self.slots[j]
    }

    /// Producer slot: `Empty -> Filling`.
    pub fn fill(&mut self, len: usize) {
        let j = self.producer;
        debug_assert_eq!(self.slots[j], SlotState::Empty);
        self.slots[j] = SlotState::Filling(len);
    }

    /// Producer slot: `Filling -> InFlight`, then advance the producer.
    pub fn launch(&mut self, handle: DmaHandle) -> usize {
        let j = self.producer;
        let SlotState::Filling(len) = self.slots[j] else {
            panic!("launching slot {j} in state {:?}", self.slots[j]);
        };
        self.slots[j] = SlotState::InFlight(handle, len);
        self.producer = (j + 1) % self.slots.len();
        self.in_flight += 1;
        len
    }

    /// Consumer slot: `InFlight -> Complete`.
    pub fn complete(&mut self) -> usize {
        let j = self.consumer;
        let SlotState::InFlight(_, len) = self.slots[j] else {
            panic!("completing slot {j} in state {:?}", self.slots[j]);
        };
        self.slots[j] = SlotState::Complete(len);
        len
    }

    /// Consumer slot: `Complete -> Empty`, then advance the consumer.
    pub fn release(&mut self) -> usize {
        let j = self.consumer;
        let SlotState::Complete(len) = self.slots[j] else {
            panic!("releasing slot {j} in state {:?}", self.slots[j]);
        };
        self.slots[j] = SlotState::Empty;
        self.consumer = (j + 1) % self.slots.len();
        self.in_flight -= 1;
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_cycle() {
        let mut table = SlotTable::new(2);
        table.fill(10);
        assert_eq!(table.state(0), SlotState::Filling(10));
        assert_eq!(table.launch(DmaHandle(1)), 10);
        table.fill(20);
        table.launch(DmaHandle(2));

        // Producer wrapped onto the oldest in-flight slot.
        assert_eq!(table.producer(), 0);
        assert_eq!(table.in_flight(), 2);
        assert_eq!(table.state(0), SlotState::InFlight(DmaHandle(1), 10));

        assert_eq!(table.complete(), 10);
        assert_eq!(table.release(), 10);
        assert_eq!(table.consumer(), 1);
        assert_eq!(table.state(0), SlotState::Empty);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    #[should_panic(expected = "releasing slot 0")]
    fn test_release_requires_complete() {
        let mut table = SlotTable::new(1);
        table.release();
    }
}
