//! Sequence keys and partition assignment.
//!
//! The sequence key gates intra-partition concurrency: events with equal
//! keys are delivered in source order, events with different keys may run
//! concurrently. Partition assignment hashes the key with md5 so that the
//! mapping is stable across processes and restarts.

use cqrs_engine_client::Event;

/// Maps an event to its sequence key.
pub trait EventSequenceResolver: Send + Sync {
    fn sequence_key(&self, event: &Event) -> String;
}

/// Constant key: one serial stream per partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEventSequenceResolver;

impl EventSequenceResolver for NoEventSequenceResolver {
    fn sequence_key(&self, _event: &Event) -> String {
        String::new()
    }
}

/// Key per exact subject.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerSubjectEventSequenceResolver;

impl EventSequenceResolver for PerSubjectEventSequenceResolver {
    fn sequence_key(&self, event: &Event) -> String {
        event.subject.clone()
    }
}

/// Key from the first `levels` path segments of the subject, so all
/// subjects below one prefix share a serial stream.
#[derive(Debug, Clone, Copy)]
pub struct PerLevelEventSequenceResolver {
    levels: usize,
}

impl PerLevelEventSequenceResolver {
    pub fn new(levels: usize) -> Self {
        Self { levels }
    }
}

impl EventSequenceResolver for PerLevelEventSequenceResolver {
    fn sequence_key(&self, event: &Event) -> String {
        let mut segments = event
            .subject
            .split('/')
            .filter(|segment| !segment.is_empty());
        let prefix: Vec<&str> = segments.by_ref().take(self.levels).collect();
        format!("/{}", prefix.join("/"))
    }
}

/// Stable partition assignment: `md5(key) mod partitions`.
pub fn partition_for(sequence_key: &str, partitions: u32) -> u32 {
    let digest = md5::compute(sequence_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.0[..8]);
    (u64::from_be_bytes(prefix) % u64::from(partitions.max(1))) as u32
}
