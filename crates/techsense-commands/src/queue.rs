//! Pending command queue.
//!
//! Holds commands that were admitted but not yet dispatched. Admission
//! resolves priority conflicts: a newcomer is refused when an entry of the
//! same or higher priority is already waiting, and otherwise supersedes
//! every lower-priority entry.

use std::collections::BinaryHeap;

use tokio::sync::oneshot;

use crate::command::{Command, CommandResult};
use crate::error::CommandError;

/// Channel on which a submitter learns the final result.
pub type Responder = oneshot::Sender<Result<CommandResult, CommandError>>;

/// A pending command plus the submitter waiting for it.
#[derive(Debug)]
pub struct QueueItem {
    pub command: Command,
    pub responder: Responder,
    /// Sequence number for FIFO ordering within same priority
    sequence: u64,
}

impl QueueItem {
    /// Resolve the submitter with `result`, ignoring a dropped receiver.
    pub fn respond(self, result: Result<CommandResult, CommandError>) -> Command {
        let _ = self.responder.send(result);
        self.command
    }

    pub fn into_parts(self) -> (Command, Responder) {
        (self.command, self.responder)
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.command.priority == other.command.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then the earlier sequence.
        self.command
            .priority
            .cmp(&other.command.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Priority queue of pending commands.
#[derive(Debug, Default)]
pub struct PendingQueue {
    heap: BinaryHeap<QueueItem>,
    sequence: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `command`.
    ///
    /// On success returns the entries it superseded; the caller resolves
    /// them as canceled. On conflict the responder is handed back with the
    /// error so the caller can report it.
    pub fn admit(
        &mut self,
        command: Command,
        responder: Responder,
    ) -> Result<Vec<QueueItem>, (CommandError, Responder)> {
        if let Some(blocking) = self
            .heap
            .iter()
            .find(|item| item.command.priority >= command.priority)
        {
            let err = CommandError::StateConflict(format!(
                "a {} {} command is already pending",
                blocking.command.origin.type_name(),
                blocking.command.action
            ));
            return Err((err, responder));
        }

        // Everything left is lower priority than the newcomer.
        let superseded = std::mem::take(&mut self.heap).into_vec();

        let sequence = self.sequence;
        self.sequence += 1;
        self.heap.push(QueueItem {
            command,
            responder,
            sequence,
        });
        Ok(superseded)
    }

    /// Take the highest-priority pending command.
    pub fn pop(&mut self) -> Option<QueueItem> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Commands waiting, highest priority first.
    pub fn snapshot(&self) -> Vec<Command> {
        let mut items: Vec<&QueueItem> = self.heap.iter().collect();
        items.sort_by(|a, b| b.cmp(a));
        items.into_iter().map(|item| item.command.clone()).collect()
    }
}
