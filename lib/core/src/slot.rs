use parking_lot::RwLock;
use std::sync::Arc;

/// Holder for a published, immutable artifact that can be replaced atomically
///
/// Readers take an `Arc` snapshot and keep using it for the rest of their
/// query; a concurrent `publish` only affects later loads.
#[derive(Debug)]
pub struct Slot<T> {
    current: RwLock<Option<Arc<T>>>,
}

impl<T> Slot<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_value(value: T) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(value))),
        }
    }

    #[inline]
    pub fn load(&self) -> Option<Arc<T>> {
        self.current.read().clone()
    }

    /// Swap in a new value, returning the previous one
    pub fn publish(&self, value: Arc<T>) -> Option<Arc<T>> {
        self.current.write().replace(value)
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.current.read().is_some()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_survives_publish() {
        let slot = Slot::with_value(1u32);
        let before = slot.load().unwrap();
        let previous = slot.publish(Arc::new(2));
        assert_eq!(*before, 1);
        assert_eq!(previous.as_deref(), Some(&1));
        assert_eq!(*slot.load().unwrap(), 2);
    }

    #[test]
    fn test_empty_slot() {
        let slot: Slot<u32> = Slot::empty();
        assert!(!slot.is_set());
        assert!(slot.load().is_none());
    }
}
