//! Single-flight operation queue.
//!
//! The radio stack silently drops or corrupts results when more than one
//! operation is outstanding, so at most one queued item is ever current.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OperationQueue<T> {
    pending: VecDeque<T>,
    current: Option<T>,
    held: bool,
}

impl<T> Default for OperationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OperationQueue<T> {
    pub fn new() -> Self {
        OperationQueue {
            pending: VecDeque::new(),
            current: None,
            held: false,
        }
    }

    /// Append to the tail. Returns true if the queue is idle and the caller
    /// should dispatch.
    pub fn enqueue(&mut self, op: T) -> bool {
        self.pending.push_back(op);
        !self.is_busy()
    }

    /// Promote the head to current if nothing is in flight.
    pub fn start_next(&mut self) -> Option<&mut T> {
        if self.current.is_some() {
            return None;
        }
        self.current = self.pending.pop_front();
        self.current.as_mut()
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.current.as_mut()
    }

    /// Finish the current operation. Does nothing while held.
    pub fn complete_current(&mut self) -> Option<T> {
        if self.held {
            return None;
        }
        self.current.take()
    }

    /// Occupy the busy slot across a multi-step sequence.
    pub fn hold(&mut self) {
        if self.current.is_some() {
            self.held = true;
        }
    }

    /// End a hold and finish the current operation.
    pub fn release(&mut self) -> Option<T> {
        self.held = false;
        self.current.take()
    }

    /// Move the current operation back to the tail.
    pub fn requeue_current(&mut self) -> bool {
        self.held = false;
        match self.current.take() {
            Some(op) => {
                self.pending.push_back(op);
                true
            }
            None => false,
        }
    }

    /// Remove the first pending operation matching `pred`.
    pub fn remove_pending(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let idx = self.pending.iter().position(pred)?;
        self.pending.remove(idx)
    }

    pub fn any_pending(&self, pred: impl Fn(&T) -> bool) -> bool {
        self.pending.iter().any(pred)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.current = None;
        self.held = false;
    }

    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.current.is_none()
    }
}
