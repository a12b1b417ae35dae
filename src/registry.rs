//! Client-id registry (component C3): a monotonically increasing
//! 16-bit id allocator, incremented under a single short critical
//! section (spec 4.5, the `lock` mutex in spec 5).

use std::sync::Mutex;

/// Allocates client ids for a single [`crate::responder::Responder`].
///
/// Wraparound is permitted by the protocol; the caller (the responder,
/// via its queues) is responsible for never holding more outstanding
/// slots than the id space can distinguish. In practice this never
/// happens: the concurrent-operations ceiling is far below 2^16.
pub struct ClientIdRegistry {
    next: Mutex<u16>,
}

impl ClientIdRegistry {
    /// Creates a registry starting at id 0.
    pub fn new() -> Self {
        ClientIdRegistry { next: Mutex::new(0) }
    }

    /// Allocates the next client id, wrapping on overflow.
    pub fn alloc(&self) -> u16 {
        let mut guard = self.next.lock().unwrap();
        let id = *guard;
        *guard = guard.wrapping_add(1);
        id
    }
}

impl Default for ClientIdRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_increase_monotonically() {
        let reg = ClientIdRegistry::new();
        assert_eq!(reg.alloc(), 0);
        assert_eq!(reg.alloc(), 1);
        assert_eq!(reg.alloc(), 2);
    }

    #[test]
    fn ids_wrap_around() {
        let reg = ClientIdRegistry::new();
        *reg.next.lock().unwrap() = u16::MAX;
        assert_eq!(reg.alloc(), u16::MAX);
        assert_eq!(reg.alloc(), 0);
    }
}
