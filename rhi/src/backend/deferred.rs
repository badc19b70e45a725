//! Deferred release of native objects.
//!
//! Work is executed by the GPU up to `frames_in_flight` frames behind the CPU.
//! Destroying a resource while an in-flight frame still references it would
//! free memory the GPU is reading, so native objects are queued here instead
//! and only released once the frame that last used them has completed.
//!
//! # Epochs
//!
//! ```text
//! frame:      ... N-2   N-1   N (recording)
//! completed:  ... N-2 ─┘
//!
//! destroy() of a resource last used in frame N-1
//!   -> queued with epoch N-1
//!   -> released once completed >= N-1
//! ```
//!
//! The queue itself does no locking and never touches the backend. The owning
//! context drains it and hands the returned objects to the backend.

use std::collections::VecDeque;

use super::NativeObject;

#[derive(Debug)]
struct PendingRelease {
    epoch: u64,
    object: NativeObject,
}

/// Epoch-ordered queue of native objects awaiting release.
#[derive(Debug, Default)]
pub(crate) struct DeferredReleaseQueue {
    pending: VecDeque<PendingRelease>,
}

impl DeferredReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `object`, last referenced by frame `epoch`.
    pub fn push(&mut self, epoch: u64, object: NativeObject) {
        // Keep the queue sorted so draining can stop at the first young entry.
        let index = self
            .pending
            .iter()
            .rposition(|p| p.epoch <= epoch)
            .map_or(0, |i| i + 1);
        self.pending.insert(index, PendingRelease { epoch, object });
    }

    /// Remove every object whose epoch is at most `completed`.
    pub fn drain_completed(&mut self, completed: u64) -> Vec<NativeObject> {
        let count = self
            .pending
            .iter()
            .take_while(|p| p.epoch <= completed)
            .count();
        self.pending.drain(..count).map(|p| p.object).collect()
    }

    /// Remove everything regardless of epoch. Only valid once the device is idle.
    pub fn flush_all(&mut self) -> Vec<NativeObject> {
        self.pending.drain(..).map(|p| p.object).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NativeHandle;

    fn buffer(raw: u64) -> NativeObject {
        NativeObject::Buffer(NativeHandle::new(raw).unwrap())
    }

    #[test]
    fn test_drain_respects_epochs() {
        let mut queue = DeferredReleaseQueue::new();
        queue.push(3, buffer(1));
        queue.push(1, buffer(2));
        queue.push(2, buffer(3));
        assert_eq!(queue.pending_count(), 3);

        assert!(queue.drain_completed(0).is_empty());
        assert_eq!(queue.drain_completed(2), vec![buffer(2), buffer(3)]);
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.drain_completed(3), vec![buffer(1)]);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_flush_all() {
        let mut queue = DeferredReleaseQueue::new();
        queue.push(10, buffer(1));
        queue.push(20, buffer(2));
        assert_eq!(queue.flush_all().len(), 2);
        assert_eq!(queue.pending_count(), 0);
    }
}
