//! Coalescing FIFO of pending caller actions.
//!
//! While a subscription is transitioning (a request in flight, or parked for
//! a tag unsubscribe) caller intent accumulates here. Coalescing keeps the
//! queue minimal: a subscribe queued behind an unforced unsubscribe cancels
//! both, duplicate actions merge, and a queued unsubscribe makes everything
//! queued before it obsolete.

use std::collections::VecDeque;

use serde_json::Value;

/// A caller action awaiting execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingAction {
    Subscribe,
    Unsubscribe,
    ModifyPatch,
    UnsubscribeByTagPending,
}

/// Arguments attached to a queued action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionArgs {
    /// For unsubscribe: survive coalescing against a following subscribe.
    pub force: bool,
    /// For patch modify: the delta to send.
    pub patch_delta: Option<Value>,
}

/// One queue entry.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedAction {
    pub action: StreamingAction,
    pub args: ActionArgs,
}

impl QueuedAction {
    pub fn new(action: StreamingAction) -> Self {
        Self {
            action,
            args: ActionArgs::default(),
        }
    }

    pub fn unsubscribe(force: bool) -> Self {
        Self {
            action: StreamingAction::Unsubscribe,
            args: ActionArgs {
                force,
                patch_delta: None,
            },
        }
    }

    pub fn patch(delta: Value) -> Self {
        Self {
            action: StreamingAction::ModifyPatch,
            args: ActionArgs {
                force: false,
                patch_delta: Some(delta),
            },
        }
    }
}

/// Coalescing FIFO owned by a single subscription.
#[derive(Debug, Default)]
pub struct ActionQueue {
    items: VecDeque<QueuedAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action, coalescing against the tail until a fixed point.
    ///
    /// Each round compares the new item against the current tail:
    /// - same action (except patches): the new item is dropped, with `force`
    ///   OR-merged for unsubscribes;
    /// - a pair that cancels or supersedes (see the match below) removes the
    ///   tail and retries the new item against the next tail;
    /// - anything else appends.
    pub fn enqueue(&mut self, new: QueuedAction) {
        use StreamingAction::*;

        loop {
            let Some(tail) = self.items.back_mut() else {
                self.items.push_back(new);
                return;
            };

            if tail.action == new.action && new.action != ModifyPatch {
                if new.action == Unsubscribe {
                    tail.args.force |= new.args.force;
                }
                return;
            }

            let collapses = match (tail.action, new.action) {
                // An unforced unsubscribe followed by a subscribe is a no-op pair.
                (Unsubscribe, Subscribe) => !tail.args.force,
                (Subscribe, Unsubscribe | UnsubscribeByTagPending) => true,
                (ModifyPatch, Unsubscribe) => new.args.force,
                (ModifyPatch, UnsubscribeByTagPending) => true,
                (Unsubscribe, UnsubscribeByTagPending) => true,
                _ => false,
            };

            if collapses {
                self.items.pop_back();
                continue;
            }

            self.items.push_back(new);
            return;
        }
    }

    /// The head action without removing it.
    pub fn peek_action(&self) -> Option<StreamingAction> {
        self.items.front().map(|item| item.action)
    }

    /// Remove and return the head.
    ///
    /// If an unsubscribe (plain or by-tag) remains queued afterwards,
    /// everything queued before the last such item is discarded: that work
    /// would be torn down again immediately, so it is never worth doing.
    pub fn dequeue(&mut self) -> Option<QueuedAction> {
        use StreamingAction::*;

        let head = self.items.pop_front()?;
        if let Some(last_unsubscribe) = self
            .items
            .iter()
            .rposition(|item| matches!(item.action, Unsubscribe | UnsubscribeByTagPending))
        {
            self.items.drain(..last_unsubscribe);
        }
        Some(head)
    }

    /// Drop queued subscribes and patches.
    ///
    /// Called at the moment an actual subscribe is issued: anything that
    /// would subscribe or patch again is redundant, and only a terminal
    /// unsubscribe still matters. Afterwards the queue holds at most one
    /// item, and it is neither a subscribe nor a patch.
    pub fn clear_patches(&mut self) {
        use StreamingAction::*;

        let keep = self
            .items
            .iter()
            .find(|item| !matches!(item.action, Subscribe | ModifyPatch))
            .cloned();
        self.items.clear();
        if let Some(item) = keep {
            self.items.push_back(item);
        }
    }

    pub fn reset(&mut self) {
        self.items.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[cfg(test)]
    fn actions(&self) -> Vec<StreamingAction> {
        self.items.iter().map(|item| item.action).collect()
    }
}
