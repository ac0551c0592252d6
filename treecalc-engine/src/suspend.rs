//! Cooperative suspension
//!
//! Long walks (substitution, supplier visits, bulk element loops) poll
//! [`SuspendTrigger::must_suspend`] at checkpoints. A `true` answer means the
//! walk is abandoned and reported as [`Interrupt::Suspended`]; everything
//! committed so far stays cached and the next attempt picks up from there.
//!
//! [`Interrupt::Suspended`]: crate::error::Interrupt::Suspended

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Something a bulk loop can poll
pub trait Checkpoint {
    /// Should the loop stop now?
    fn must_suspend(&self) -> bool;
}

/// Checkpoint for code that must run to completion, e.g. on worker threads
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSuspend;

impl Checkpoint for NoSuspend {
    fn must_suspend(&self) -> bool {
        false
    }
}

type TriggerFn = Box<dyn FnMut() -> bool>;

#[derive(Default)]
struct TriggerState {
    blockers: Cell<u32>,
    last_result: Cell<bool>,
    progress: Cell<bool>,
    requested: Cell<bool>,
    checkpoints: Cell<u64>,
    trigger: RefCell<Option<TriggerFn>>,
}

/// Suspension latch of one session
///
/// Cloning yields another handle on the same latch.
#[derive(Clone, Default)]
pub struct SuspendTrigger {
    state: Rc<TriggerState>,
}

impl SuspendTrigger {
    /// Latch with no trigger installed
    pub fn new() -> Self {
        Self::default()
    }

    /// Should the current walk stop now?
    pub fn must_suspend(&self) -> bool {
        let s = &self.state;
        s.checkpoints.set(s.checkpoints.get() + 1);
        if s.blockers.get() > 0 {
            return false;
        }
        if s.last_result.get() {
            return true;
        }
        // nothing gained since the last resume: keep going
        if !s.progress.get() {
            return false;
        }
        if s.requested.replace(false) {
            s.last_result.set(true);
            return true;
        }
        let fired = match s.trigger.borrow_mut().as_mut() {
            Some(trigger) => trigger(),
            None => false,
        };
        if fired {
            s.last_result.set(true);
        }
        fired
    }

    /// Request that the next checkpoint after some progress suspends
    pub fn do_suspend(&self) {
        self.state.requested.set(true);
    }

    /// Clear the latch before retrying
    pub fn resume(&self) {
        let s = &self.state;
        s.last_result.set(false);
        s.progress.set(false);
        s.requested.set(false);
    }

    /// Outcome of the previous `must_suspend`, without polling again
    pub fn did_suspend(&self) -> bool {
        self.state.blockers.get() == 0 && self.state.last_result.get()
    }

    /// Note that a result was committed since the last resume
    pub fn mark_progress(&self) {
        if self.state.blockers.get() == 0 {
            self.state.progress.set(true);
        }
    }

    /// Inside a run-to-completion region?
    pub fn is_blocked(&self) -> bool {
        self.state.blockers.get() > 0
    }

    /// Run-to-completion region; released when the guard drops
    pub fn blocker(&self) -> Blocker {
        self.state.blockers.set(self.state.blockers.get() + 1);
        Blocker {
            state: Rc::clone(&self.state),
        }
    }

    /// Install a function consulted at checkpoints once progress was made
    pub fn install_trigger(&self, trigger: impl FnMut() -> bool + 'static) {
        *self.state.trigger.borrow_mut() = Some(Box::new(trigger));
    }

    /// Remove the installed trigger
    pub fn clear_trigger(&self) {
        *self.state.trigger.borrow_mut() = None;
    }

    /// Number of checkpoints polled so far
    pub fn checkpoints(&self) -> u64 {
        self.state.checkpoints.get()
    }
}

impl Checkpoint for SuspendTrigger {
    fn must_suspend(&self) -> bool {
        SuspendTrigger::must_suspend(self)
    }
}

impl fmt::Debug for SuspendTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.state;
        f.debug_struct("SuspendTrigger")
            .field("blockers", &s.blockers.get())
            .field("last_result", &s.last_result.get())
            .field("progress", &s.progress.get())
            .field("requested", &s.requested.get())
            .field("checkpoints", &s.checkpoints.get())
            .finish()
    }
}

/// Forces `must_suspend` to answer false while alive
#[must_use = "the region is only blocked while the guard lives"]
pub struct Blocker {
    state: Rc<TriggerState>,
}

impl Drop for Blocker {
    fn drop(&mut self) {
        self.state.blockers.set(self.state.blockers.get() - 1);
    }
}

impl fmt::Debug for Blocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blocker").finish()
    }
}

/// Trigger firing on its first `n` consultations
pub fn suspend_first(n: usize) -> impl FnMut() -> bool {
    let mut remaining = n;
    move || {
        if remaining == 0 {
            return false;
        }
        remaining -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_suspension_without_progress() {
        let t = SuspendTrigger::new();
        t.do_suspend();
        assert!(!t.must_suspend());
        t.mark_progress();
        assert!(t.must_suspend());
        assert!(t.did_suspend());
    }

    #[test]
    fn suspension_sticks_until_resume() {
        let t = SuspendTrigger::new();
        t.mark_progress();
        t.do_suspend();
        assert!(t.must_suspend());
        assert!(t.must_suspend());
        t.resume();
        assert!(!t.did_suspend());
        t.mark_progress();
        assert!(!t.must_suspend());
    }

    #[test]
    fn blockers_nest() {
        let t = SuspendTrigger::new();
        t.mark_progress();
        t.do_suspend();
        {
            let _outer = t.blocker();
            {
                let _inner = t.blocker();
                assert!(!t.must_suspend());
            }
            assert!(t.is_blocked());
            assert!(!t.must_suspend());
            assert!(!t.did_suspend());
        }
        assert!(!t.is_blocked());
        assert!(t.must_suspend());
    }

    #[test]
    fn progress_is_ignored_under_blocker() {
        let t = SuspendTrigger::new();
        {
            let _b = t.blocker();
            t.mark_progress();
        }
        t.do_suspend();
        assert!(!t.must_suspend());
    }

    #[test]
    fn installed_trigger_fires_a_bounded_number_of_times() {
        let t = SuspendTrigger::new();
        t.install_trigger(suspend_first(2));
        let mut suspensions = 0;
        for _ in 0..10 {
            t.mark_progress();
            if t.must_suspend() {
                suspensions += 1;
                t.resume();
            }
        }
        assert_eq!(suspensions, 2);
        assert_eq!(t.checkpoints(), 10);
    }

    #[test]
    fn clones_share_the_latch() {
        let t = SuspendTrigger::new();
        let other = t.clone();
        t.mark_progress();
        other.do_suspend();
        assert!(t.must_suspend());
    }
}
