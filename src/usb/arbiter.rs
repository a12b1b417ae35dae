//! Endpoint arbiter (component C6).
//!
//! A USB context exposes a fixed pool of bulk endpoint couples. Couple 0
//! is permanently reserved for the control/attribute stream; the rest
//! are handed out one per opened device and returned to the pool on
//! close. `CoupleHandle` makes that release-on-close obligation
//! statically enforced: dropping the handle releases the couple even if
//! the caller never calls `close` explicitly.

use std::sync::{Arc, Mutex};

use crate::error::{IiodError, Result};

/// A paired (IN, OUT) bulk endpoint, addressed by its `pipe_id` for the
/// `OPEN_PIPE`/`CLOSE_PIPE` vendor control requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCouple {
    pub in_addr: u8,
    pub out_addr: u8,
    pub pipe_id: u8,
}

#[derive(Debug)]
struct Slot {
    couple: EndpointCouple,
    in_use: bool,
}

/// The pool of endpoint couples discovered on a USB interface.
///
/// Index 0 is never handed out by [`EndpointArbiter::acquire`]; it is
/// reserved for the control/attribute responder for the lifetime of the
/// context.
pub struct EndpointArbiter {
    slots: Mutex<Vec<Slot>>,
}

impl EndpointArbiter {
    /// Builds an arbiter from the couples discovered on the interface.
    /// `couples[0]` is treated as the permanent control/attribute
    /// couple and is marked in-use up front.
    pub fn new(couples: Vec<EndpointCouple>) -> Result<Arc<Self>> {
        if couples.is_empty() {
            return Err(IiodError::InvalidArgument(
                "USB interface exposes no endpoint couples".into(),
            ));
        }
        let mut slots: Vec<Slot> = couples
            .into_iter()
            .map(|couple| Slot { couple, in_use: false })
            .collect();
        slots[0].in_use = true; // pipe 0, reserved.

        Ok(Arc::new(EndpointArbiter {
            slots: Mutex::new(slots),
        }))
    }

    /// The permanently reserved control/attribute couple.
    pub fn control_couple(&self) -> EndpointCouple {
        self.slots.lock().unwrap()[0].couple
    }

    /// Reserves the first free couple (excluding index 0) for
    /// `owner_device`, returning a handle that releases it on drop.
    /// Fails with [`IiodError::Busy`] if every couple is taken.
    pub fn acquire(self: &Arc<Self>) -> Result<CoupleHandle> {
        let mut slots = self.slots.lock().unwrap();
        let found = slots
            .iter_mut()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| !slot.in_use);
        match found {
            Some((index, slot)) => {
                slot.in_use = true;
                Ok(CoupleHandle {
                    arbiter: self.clone(),
                    index,
                    couple: slot.couple,
                    released: false,
                })
            }
            None => Err(IiodError::Busy),
        }
    }

    fn release(&self, index: usize) {
        let mut slots = self.slots.lock().unwrap();
        slots[index].in_use = false;
    }
}

/// A reserved endpoint couple. Releases the couple back to the pool
/// when dropped, or when [`CoupleHandle::release`] is called explicitly
/// (e.g. after a successful `CLOSE_PIPE` control transfer).
pub struct CoupleHandle {
    arbiter: Arc<EndpointArbiter>,
    index: usize,
    couple: EndpointCouple,
    released: bool,
}

impl CoupleHandle {
    pub fn couple(&self) -> EndpointCouple {
        self.couple
    }

    /// Releases the couple early. Idempotent: calling this and then
    /// dropping the handle releases exactly once.
    pub fn release(&mut self) {
        if !self.released {
            self.arbiter.release(self.index);
            self.released = true;
        }
    }
}

impl Drop for CoupleHandle {
    fn drop(&mut self) {
        self.release();
    }
}
