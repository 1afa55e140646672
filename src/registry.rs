use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::trace;

/// GPIO numbers currently exported by a live [`GpioLine`](crate::line::GpioLine).
///
/// Claims happen before the kernel is asked to export a line, so two owners
/// in the same process never race on a number.
#[derive(Debug, Default)]
pub struct LineRegistry {
    owned: Mutex<BTreeSet<u64>>,
}

impl LineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by everything in this process.
    pub fn global() -> Arc<LineRegistry> {
        static GLOBAL: OnceLock<Arc<LineRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(LineRegistry::new())))
    }

    /// Returns false if `gpio` is already owned.
    pub fn claim(&self, gpio: u64) -> bool {
        let claimed = self.lock().insert(gpio);
        trace!("claim gpio{}: {}", gpio, claimed);
        claimed
    }

    pub fn release(&self, gpio: u64) {
        self.lock().remove(&gpio);
        trace!("release gpio{}", gpio);
    }

    pub fn is_owned(&self, gpio: u64) -> bool {
        self.lock().contains(&gpio)
    }

    pub fn owned(&self) -> Vec<u64> {
        self.lock().iter().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u64>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_claim_fails_until_release() {
        let registry = LineRegistry::new();
        assert!(registry.claim(396));
        assert!(!registry.claim(396));
        registry.release(396);
        assert!(registry.claim(396));
        assert_eq!(registry.owned(), vec![396]);
    }

    #[test]
    fn global_is_shared() {
        let a = LineRegistry::global();
        let b = LineRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
