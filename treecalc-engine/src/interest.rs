//! Interest counts
//!
//! A positive count keeps a controller's or node's cached data alive across
//! [`Session::collect_garbage`](crate::Session::collect_garbage).

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Shared count of interested parties
#[derive(Clone, Default)]
pub struct InterestCount(Rc<Cell<u32>>);

impl InterestCount {
    /// Count of zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current count
    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// Does anyone hold a guard?
    pub fn is_interesting(&self) -> bool {
        self.get() > 0
    }

    /// Increment for the lifetime of the returned guard
    pub fn guard(&self) -> InterestGuard {
        self.0.set(self.0.get() + 1);
        InterestGuard(Rc::clone(&self.0))
    }
}

impl fmt::Debug for InterestCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterestCount({})", self.get())
    }
}

/// RAII share of an [`InterestCount`]
pub struct InterestGuard(Rc<Cell<u32>>);

impl Clone for InterestGuard {
    fn clone(&self) -> Self {
        self.0.set(self.0.get() + 1);
        InterestGuard(Rc::clone(&self.0))
    }
}

impl Drop for InterestGuard {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

impl fmt::Debug for InterestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InterestGuard({})", self.0.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_count_and_release() {
        let count = InterestCount::new();
        assert!(!count.is_interesting());
        let a = count.guard();
        let b = a.clone();
        assert_eq!(count.get(), 2);
        drop(a);
        assert_eq!(count.get(), 1);
        drop(b);
        assert_eq!(count.get(), 0);
    }
}
