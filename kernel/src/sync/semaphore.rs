use core::sync::atomic::{AtomicUsize, Ordering};

/// A counting semaphore.
///
/// `down` spins until a permit is available; `try_down` is the non-blocking
/// probe the frame eviction scan relies on. A semaphore initialized to 1 acts
/// as a binary gate.
pub struct Semaphore {
    value: AtomicUsize,
}

impl Semaphore {
    pub const fn new(value: usize) -> Self {
        Self {
            value: AtomicUsize::new(value),
        }
    }

    /// Waits until a permit is available and takes it.
    pub fn down(&self) {
        while !self.try_down() {
            core::hint::spin_loop();
        }
    }

    /// Takes a permit if one is available right now.
    pub fn try_down(&self) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Releases a permit.
    pub fn up(&self) {
        self.value.fetch_add(1, Ordering::Release);
    }

    /// Number of permits currently available.
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_gate() {
        let gate = Semaphore::new(1);
        assert_eq!(gate.value(), 1);
        assert!(gate.try_down());
        assert!(!gate.try_down());
        gate.up();
        assert!(gate.try_down());
        gate.up();
    }

    #[test]
    fn down_takes_available_permit() {
        let sema = Semaphore::new(2);
        sema.down();
        sema.down();
        assert!(!sema.try_down());
        sema.up();
        sema.down();
        assert_eq!(sema.value(), 0);
    }
}
