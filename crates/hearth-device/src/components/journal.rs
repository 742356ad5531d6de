use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use serde_json::Value;

/// How many diffs one component's journal holds before dropping the oldest.
pub const MAX_STATE_CHANGES_PER_COMPONENT: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StateChange {
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) changed_properties: Value,
}

// Bounded FIFO of the property diffs one component accumulated since the
// last drain.
#[derive(Debug, Default)]
pub(crate) struct StateChangeJournal {
    entries: VecDeque<StateChange>,
}

impl StateChangeJournal {
    pub(crate) fn record(&mut self, timestamp: DateTime<Utc>, changed_properties: Value) {
        if self.entries.len() >= MAX_STATE_CHANGES_PER_COMPONENT {
            self.entries.pop_front();
        }
        self.entries.push_back(StateChange {
            timestamp,
            changed_properties,
        });
    }

    pub(crate) fn drain(&mut self) -> VecDeque<StateChange> {
        std::mem::take(&mut self.entries)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// One journalled state diff, tagged with its component path.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentStateChange {
    /// When the diff was recorded.
    pub timestamp: DateTime<Utc>,
    /// The component the diff belongs to.
    pub component: String,
    /// The recorded property diff.
    pub changed_properties: Value,
}

/// Everything the cloud has not acknowledged yet: the current update id and
/// the drained journal entries of all components, sorted by timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    /// The frontier of recorded state changes.
    pub update_id: u64,
    /// Drained journal entries across all components, oldest first.
    pub state_changes: Vec<ComponentStateChange>,
}
