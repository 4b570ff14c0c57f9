//! Three-level FIFO queue shared by the ready list and mutex wait lists.

use std::collections::VecDeque;

use crate::thread::{Priority, ThreadId};

/// One FIFO per priority level, served HIGH first.
#[derive(Debug, Default, Clone)]
pub(crate) struct PriorityQueue {
    levels: [VecDeque<ThreadId>; Priority::COUNT],
}

impl PriorityQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends `id` at the tail of its level.
    pub(crate) fn push(&mut self, id: ThreadId, priority: Priority) {
        self.levels[priority.index()].push_back(id);
    }

    /// Head of the highest non-empty level.
    pub(crate) fn peek(&self) -> Option<(ThreadId, Priority)> {
        Priority::ALL_DESCENDING.iter().find_map(|&priority| {
            self.levels[priority.index()]
                .front()
                .map(|&id| (id, priority))
        })
    }

    pub(crate) fn pop(&mut self) -> Option<(ThreadId, Priority)> {
        let (id, priority) = self.peek()?;
        self.levels[priority.index()].pop_front();
        Some((id, priority))
    }

    /// Removes `id` wherever it is queued. Returns true if it was present.
    pub(crate) fn remove(&mut self, id: ThreadId) -> bool {
        for level in &mut self.levels {
            if let Some(pos) = level.iter().position(|&queued| queued == id) {
                level.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn contains(&self, id: ThreadId) -> bool {
        self.levels.iter().any(|level| level.contains(&id))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        for level in &mut self.levels {
            level.clear();
        }
    }
}
