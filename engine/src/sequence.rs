//! Operation id generator.
//!
//! Ids are `{node_id}-{counter}`: unique per node, and the counter gives
//! the enqueue order used as the FIFO tie-breaker in the queue.

use crate::{NodeId, OperationId};
use serde::{Deserialize, Serialize};

/// A per-node monotonic operation sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpSequence {
    /// Unique identifier of this installation
    pub node_id: NodeId,
    /// Last issued counter value
    pub counter: u64,
}

impl OpSequence {
    /// Create a sequence for a node, starting at counter 0.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
        }
    }

    pub fn with_counter(node_id: impl Into<NodeId>, counter: u64) -> Self {
        Self {
            node_id: node_id.into(),
            counter,
        }
    }

    /// Issue the next operation id and its sequence number.
    pub fn next(&mut self) -> (OperationId, u64) {
        self.counter += 1;
        (format!("{}-{}", self.node_id, self.counter), self.counter)
    }

    /// Advance past a sequence number seen in restored state, so ids are
    /// never reused after a restart.
    pub fn observe(&mut self, seq: u64) {
        self.counter = self.counter.max(seq);
    }
}
