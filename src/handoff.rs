//! Single-slot handoff between interrupt context and one blocked task.
//!
//! At most one task may wait on a port.  The interrupt handler deposits the outcome of the
//! operation the task armed and wakes it without blocking; the task collects the outcome, which
//! also frees the slot.  A second waiter is refused, never queued.

/// Handle to a task which can be woken from interrupt context.
pub trait TaskHandle {
    /// Make the task runnable.  Must not block.
    fn wake(&self);
}

#[cfg(feature = "std")]
impl TaskHandle for std::thread::Thread {
    fn wake(&self) {
        self.unpark();
    }
}

/// What a waiting task is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// Completion of a transmission.
    Send,
    /// The next received packet.
    Receive,
}

#[derive(Debug)]
struct Waiter<T, O> {
    task: T,
    intent: Intent,
    outcome: Option<O>,
}

/// Slot holding at most one waiting task and its outcome
#[derive(Debug)]
pub struct WaitSlot<T, O> {
    waiter: Option<Waiter<T, O>>,
}

impl<T: TaskHandle, O> WaitSlot<T, O> {
    pub const fn new() -> Self {
        Self { waiter: None }
    }

    /// Whether a task occupies the slot, including one which was woken but did not collect its
    /// outcome yet.
    #[inline(always)]
    pub fn is_occupied(&self) -> bool {
        self.waiter.is_some()
    }

    /// Intent of a waiter which is still waiting for its outcome.
    pub fn pending_intent(&self) -> Option<Intent> {
        match &self.waiter {
            Some(w) if w.outcome.is_none() => Some(w.intent),
            _ => None,
        }
    }

    pub fn register(&mut self, task: T, intent: Intent) -> Result<(), crate::Error> {
        if self.waiter.is_some() {
            return Err(crate::Error::WaiterConflict);
        }
        self.waiter = Some(Waiter {
            task,
            intent,
            outcome: None,
        });
        Ok(())
    }

    /// Deposit an outcome for a waiter with the given intent and wake it.
    ///
    /// Returns `false` when no such waiter is waiting; the outcome is dropped then.
    pub fn notify(&mut self, intent: Intent, outcome: O) -> bool {
        match self.waiter.as_mut() {
            Some(w) if w.intent == intent && w.outcome.is_none() => {
                w.outcome = Some(outcome);
                w.task.wake();
                true
            }
            _ => false,
        }
    }

    /// Collect the outcome, freeing the slot.  Returns `None` while there is none yet.
    pub fn take_outcome(&mut self) -> Option<O> {
        if self.waiter.as_ref()?.outcome.is_some() {
            self.waiter.take().and_then(|w| w.outcome)
        } else {
            None
        }
    }

    /// Give up waiting.  An outcome which arrived meanwhile is returned.
    pub fn unregister(&mut self) -> Option<O> {
        self.waiter.take().and_then(|w| w.outcome)
    }
}

impl<T: TaskHandle, O> Default for WaitSlot<T, O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct CountingTask(Rc<Cell<u32>>);

    impl TaskHandle for CountingTask {
        fn wake(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn second_waiter_is_refused() {
        let mut slot = WaitSlot::<CountingTask, u32>::new();
        let first = CountingTask::default();
        slot.register(first.clone(), Intent::Receive).unwrap();
        assert_eq!(
            slot.register(CountingTask::default(), Intent::Receive),
            Err(crate::Error::WaiterConflict)
        );

        assert!(slot.notify(Intent::Receive, 7));
        assert_eq!(first.0.get(), 1);
        // Still occupied until the outcome was collected
        assert!(slot.is_occupied());
        assert_eq!(slot.pending_intent(), None);
        assert_eq!(slot.take_outcome(), Some(7));
        assert!(!slot.is_occupied());
    }

    #[test]
    fn wakes_only_matching_intent_once() {
        let mut slot = WaitSlot::<CountingTask, u32>::new();
        let task = CountingTask::default();
        slot.register(task.clone(), Intent::Send).unwrap();

        assert!(!slot.notify(Intent::Receive, 1));
        assert_eq!(task.0.get(), 0);
        assert_eq!(slot.take_outcome(), None);

        assert!(slot.notify(Intent::Send, 2));
        assert!(!slot.notify(Intent::Send, 3));
        assert_eq!(task.0.get(), 1);
        assert_eq!(slot.take_outcome(), Some(2));
    }

    #[test]
    fn unregister_returns_late_outcome() {
        let mut slot = WaitSlot::<CountingTask, u32>::new();
        slot.register(CountingTask::default(), Intent::Receive).unwrap();
        assert_eq!(slot.unregister(), None);

        slot.register(CountingTask::default(), Intent::Receive).unwrap();
        slot.notify(Intent::Receive, 5);
        assert_eq!(slot.unregister(), Some(5));
        assert!(!slot.is_occupied());
    }
}
