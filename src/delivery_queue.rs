use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;
use tracing::warn;

/// One position in the delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// A message in its final position, ready to be handed to the application once it
    ///  reaches the front.
    Committed { payload: Bytes, reliable: bool },
    /// A placeholder preserving the in-order position of a reliable batch whose payload
    ///  has not arrived yet.
    Reserved { batch: u32 },
}

struct Reservation {
    /// Position of the reserved slot over the queue's lifetime, i.e. current index plus
    ///  the number of slots dequeued so far.
    position: u64,
    since: Instant,
}

/// Queue that admits packets in arrival order but delivers them in batch order.
///
/// Reliable packets may arrive out of order; when a batch is known to be pending (because
///  a later batch arrived first) its future position is reserved. Committing fills a
///  reserved slot in place and never reorders. Delivery consumes slots from the front
///  only, and only while the front is committed - a reserved front slot stalls delivery
///  until its payload arrives or the reservation is abandoned.
pub struct DeliveryQueue {
    slots: VecDeque<Slot>,
    reservations: BTreeMap<u32, Reservation>,
    /// Total number of slots dequeued so far; translates stored positions into indices.
    popped: u64,
}

impl DeliveryQueue {
    pub fn new() -> DeliveryQueue {
        DeliveryQueue {
            slots: VecDeque::new(),
            reservations: BTreeMap::new(),
            popped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    /// Append a committed slot at the back.
    pub fn push_back(&mut self, payload: Bytes, reliable: bool) {
        self.slots.push_back(Slot::Committed { payload, reliable });
    }

    /// Append an empty reserved slot for the given batch at the back.
    pub fn reserve_back(&mut self, batch: u32, now: Instant) {
        let position = self.popped + self.slots.len() as u64;
        self.slots.push_back(Slot::Reserved { batch });
        self.reservations.insert(
            batch,
            Reservation {
                position,
                since: now,
            },
        );
    }

    /// Fill the reserved slot for `batch` with its payload. Returns false if no such
    ///  reservation exists.
    pub fn commit(&mut self, batch: u32, payload: Bytes) -> bool {
        let Some(reservation) = self.reservations.remove(&batch) else {
            return false;
        };

        let index = (reservation.position - self.popped) as usize;
        match &self.slots[index] {
            Slot::Reserved { batch: b } if *b == batch => {
                self.slots[index] = Slot::Committed {
                    payload,
                    reliable: true,
                };
                true
            }
            other => {
                // the reservation table and the slots are updated together, so this
                //  cannot happen unless there is a bookkeeping bug
                warn!("reservation for batch {} points at slot {:?}", batch, other);
                false
            }
        }
    }

    /// Abandon the reservation for `batch`, removing its placeholder so later slots can
    ///  reach the front. Returns false if no such reservation exists.
    pub fn drop_reservation(&mut self, batch: u32) -> bool {
        let Some(reservation) = self.reservations.remove(&batch) else {
            return false;
        };

        let index = (reservation.position - self.popped) as usize;
        self.slots.remove(index);

        // slots behind the removed placeholder shifted forward by one
        for r in self.reservations.values_mut() {
            if r.position > reservation.position {
                r.position -= 1;
            }
        }
        true
    }

    pub fn is_reserved(&self, batch: u32) -> bool {
        self.reservations.contains_key(&batch)
    }

    /// Random-access read: whether the slot at `index` (0 is the front) is committed.
    pub fn is_committed(&self, index: usize) -> Option<bool> {
        self.slots
            .get(index)
            .map(|slot| matches!(slot, Slot::Committed { .. }))
    }

    /// Whether the front slot exists and is committed, i.e. a pop would succeed.
    pub fn front_committed(&self) -> bool {
        self.is_committed(0) == Some(true)
    }

    /// Dequeue the front slot if it is committed.
    pub fn pop_front(&mut self) -> Option<(Bytes, bool)> {
        if !self.front_committed() {
            return None;
        }
        self.popped += 1;
        match self.slots.pop_front() {
            Some(Slot::Committed { payload, reliable }) => Some((payload, reliable)),
            _ => unreachable!("front was checked to be committed"),
        }
    }

    /// The reservation that has been waiting the longest, for the timeout scan.
    pub fn oldest_reservation(&self) -> Option<(u32, Instant)> {
        self.reservations
            .iter()
            .min_by_key(|(_, r)| r.since)
            .map(|(&batch, r)| (batch, r.since))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.reservations.clear();
        self.popped = 0;
    }
}
