//! Dedup window for counting unique track identities.

use std::collections::VecDeque;

use crate::frame::TrackId;

/// Default number of distinct identities remembered by the window.
pub const DEFAULT_COUNT_WINDOW: usize = 30;

/// Fixed-capacity FIFO of recently counted identities.
///
/// An identity already in the window is not counted again. When the window is
/// full the oldest identity is forgotten, so an identity that comes back after
/// enough distinct newcomers is counted a second time.
#[derive(Clone, Debug)]
pub struct TrackCountWindow {
    window: VecDeque<TrackId>,
    capacity: usize,
    total_count: u64,
}

impl TrackCountWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            total_count: 0,
        }
    }

    /// Record a sighting. Returns true when the identity was newly counted.
    pub fn observe(&mut self, id: TrackId) -> bool {
        if self.window.contains(&id) {
            return false;
        }
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(id);
        self.total_count += 1;
        true
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.window.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TrackCountWindow {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: TrackId = TrackId(1);
    const B: TrackId = TrackId(2);
    const C: TrackId = TrackId(3);
    const D: TrackId = TrackId(4);

    #[test]
    fn recounts_identity_after_eviction() {
        let mut window = TrackCountWindow::new(3);
        for id in [A, B, C] {
            assert!(window.observe(id));
        }
        assert_eq!(window.total_count(), 3);

        assert!(!window.observe(A));
        assert_eq!(window.total_count(), 3);

        assert!(window.observe(D));
        assert_eq!(window.total_count(), 4);
        assert!(!window.contains(A));
        assert_eq!(window.len(), 3);

        assert!(window.observe(A));
        assert_eq!(window.total_count(), 5);
    }

    #[test]
    fn repeated_sightings_do_not_increment() {
        let mut window = TrackCountWindow::default();
        for _ in 0..100 {
            window.observe(B);
        }
        assert_eq!(window.total_count(), 1);
        assert_eq!(window.len(), 1);
        assert_eq!(window.capacity(), DEFAULT_COUNT_WINDOW);
    }

    #[test]
    fn size_is_bounded_and_count_monotonic() {
        let mut window = TrackCountWindow::new(5);
        let mut last = 0;
        for i in 0..200u64 {
            window.observe(TrackId(i % 17));
            assert!(window.len() <= 5);
            assert!(window.total_count() >= last);
            last = window.total_count();
        }
    }
}
