// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A `QueueDefinition` is recorded by the subscription registry and replayed verbatim
//! every time the consumer reconnects.

/// A queue the consumer declares and re-declares after every reconnect.
///
/// Two definitions with the same name must agree on every property, otherwise the
/// broker refuses the second declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) message_ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    /// Transient, shared and kept after its last consumer leaves.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn durable(self) -> Self {
        self.with_durability(true)
    }

    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// The broker deletes the queue once its last consumer is cancelled.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Exclusive queues die with their connection and are declared again on reconnect.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Per-message TTL in milliseconds (`x-message-ttl`).
    pub fn ttl(mut self, ttl_ms: i32) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }

    /// `x-max-length`
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether declaring `other` after `self` would be refused by the broker.
    pub(crate) fn conflicts_with(&self, other: &QueueDefinition) -> bool {
        self.name == other.name
            && (self.durable != other.durable
                || self.exclusive != other.exclusive
                || self.auto_delete != other.auto_delete
                || self.message_ttl != other.message_ttl
                || self.max_length != other.max_length)
    }
}

/// Handle to a queue declared through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub(crate) def: QueueDefinition,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_mismatch_conflicts() {
        let transient = QueueDefinition::new("jobs");
        let durable = QueueDefinition::new("jobs").durable();

        assert!(transient.conflicts_with(&durable));
        assert!(!transient.conflicts_with(&QueueDefinition::new("jobs")));
        assert!(!transient.conflicts_with(&QueueDefinition::new("other").durable()));
    }

    #[test]
    fn arguments_take_part_in_conflicts() {
        let a = QueueDefinition::new("jobs").ttl(1_000);
        let b = QueueDefinition::new("jobs").ttl(2_000);
        assert!(a.conflicts_with(&b));
    }
}
