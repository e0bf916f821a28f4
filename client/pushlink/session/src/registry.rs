//! Subscription and message bookkeeping.
//!
//! Both registries are written from the application call path and the
//! network callback path, so they sit behind concurrent maps with every
//! read-modify-write done under a single entry lock.

use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use pushlink_dispatch::ItemUpdate;
use pushlink_wire::{FieldValue, SubscriptionMode};

/// Bookkeeping inconsistencies between server frames and local state.
///
/// Any of these while processing a frame means the server response is
/// malformed for our state and escalates to session recovery.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Frame referenced a subscription we do not hold
    #[error("unknown subscription {0}")]
    UnknownSubscription(u64),

    /// 1-based item position outside the subscribed group
    #[error("item position {item} out of range for subscription {sub_id}")]
    ItemOutOfRange {
        /// Subscription id
        sub_id: u64,
        /// Offending position
        item: u64,
    },

    /// Update carried a different field count than the schema
    #[error("subscription {sub_id}: update carries {got} fields, schema has {expected}")]
    SchemaMismatch {
        /// Subscription id
        sub_id: u64,
        /// Schema field count
        expected: usize,
        /// Update field count
        got: usize,
    },

    /// Frame referenced a message we never submitted
    #[error("unknown message progressive {0}")]
    UnknownMessage(u64),
}

/// What an application asked to subscribe to.
#[derive(Debug, Clone)]
pub struct SubscriptionSpec {
    /// Item group, in position order
    pub items: Vec<String>,
    /// Field schema, in position order
    pub fields: Vec<String>,
    /// Delivery mode
    pub mode: SubscriptionMode,
    /// Whether the initial snapshot was requested
    pub snapshot: bool,
}

#[derive(Debug, Default)]
struct ItemState {
    update_seq: u64,
    lost_updates: u64,
    snapshot_received: bool,
    values: Vec<Option<String>>,
}

struct SubscriptionEntry {
    spec: SubscriptionSpec,
    active: bool,
    items: Vec<ItemState>,
}

/// Per-subscription schema and update bookkeeping, keyed by subscription id.
pub struct SubscriptionRegistry {
    entries: DashMap<u64, SubscriptionEntry>,
}

impl SubscriptionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Register a requested subscription before its request is transmitted.
    pub fn insert(&self, sub_id: u64, spec: SubscriptionSpec) {
        let items = spec
            .items
            .iter()
            .map(|_| ItemState {
                values: vec![None; spec.fields.len()],
                ..ItemState::default()
            })
            .collect();
        self.entries.insert(
            sub_id,
            SubscriptionEntry {
                spec,
                active: false,
                items,
            },
        );
    }

    /// Drop a subscription; returns whether it existed.
    pub fn remove(&self, sub_id: u64) -> bool {
        self.entries.remove(&sub_id).is_some()
    }

    /// Mark a subscription active after the server confirms it.
    pub fn activate(&self, sub_id: u64) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(&sub_id)
            .ok_or(RegistryError::UnknownSubscription(sub_id))?;
        entry.active = true;
        debug!("subscription {} active", sub_id);
        Ok(())
    }

    /// Whether the registry holds this id.
    pub fn contains(&self, sub_id: u64) -> bool {
        self.entries.contains_key(&sub_id)
    }

    /// All registered ids, in no particular order.
    pub fn all_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Resolve a differential update against the item's previous state and
    /// return the fully resolved update value for dispatch.
    pub fn apply_update(
        &self,
        sub_id: u64,
        item_pos: u64,
        values: &[FieldValue],
    ) -> Result<ItemUpdate, RegistryError> {
        let mut entry = self
            .entries
            .get_mut(&sub_id)
            .ok_or(RegistryError::UnknownSubscription(sub_id))?;

        if values.len() != entry.spec.fields.len() {
            return Err(RegistryError::SchemaMismatch {
                sub_id,
                expected: entry.spec.fields.len(),
                got: values.len(),
            });
        }

        let idx = item_index(&entry.spec, sub_id, item_pos)?;
        let item_name = entry.spec.items[idx].clone();
        let fields = entry.spec.fields.clone();
        let snapshot_requested = entry.spec.snapshot;
        let item = &mut entry.items[idx];

        let is_snapshot = snapshot_requested && !item.snapshot_received;
        let mut changed = Vec::new();
        for (i, value) in values.iter().enumerate() {
            match value {
                FieldValue::Unchanged => {}
                FieldValue::Null => {
                    item.values[i] = None;
                    changed.push(fields[i].clone());
                }
                FieldValue::Value(v) => {
                    item.values[i] = Some(v.clone());
                    changed.push(fields[i].clone());
                }
            }
        }
        item.update_seq += 1;

        let resolved = fields
            .iter()
            .cloned()
            .zip(item.values.iter().cloned())
            .collect();
        Ok(ItemUpdate::new(item_name, item_pos, is_snapshot, resolved, changed))
    }

    /// Add to an item's lost-update count; the count is monotonic and only
    /// resets on a fresh snapshot.
    pub fn record_lost(
        &self,
        sub_id: u64,
        item_pos: u64,
        lost: u64,
    ) -> Result<String, RegistryError> {
        let mut entry = self
            .entries
            .get_mut(&sub_id)
            .ok_or(RegistryError::UnknownSubscription(sub_id))?;
        let idx = item_index(&entry.spec, sub_id, item_pos)?;
        let name = entry.spec.items[idx].clone();
        entry.items[idx].lost_updates += lost;
        Ok(name)
    }

    /// Mark an item's snapshot complete.
    pub fn end_of_snapshot(&self, sub_id: u64, item_pos: u64) -> Result<String, RegistryError> {
        let mut entry = self
            .entries
            .get_mut(&sub_id)
            .ok_or(RegistryError::UnknownSubscription(sub_id))?;
        let idx = item_index(&entry.spec, sub_id, item_pos)?;
        let name = entry.spec.items[idx].clone();
        entry.items[idx].snapshot_received = true;
        Ok(name)
    }

    /// Invalidate an item's snapshot: values, sequence, and lost-update
    /// count start over with the fresh snapshot that follows.
    pub fn clear_snapshot(&self, sub_id: u64, item_pos: u64) -> Result<String, RegistryError> {
        let mut entry = self
            .entries
            .get_mut(&sub_id)
            .ok_or(RegistryError::UnknownSubscription(sub_id))?;
        let idx = item_index(&entry.spec, sub_id, item_pos)?;
        let name = entry.spec.items[idx].clone();
        let fields = entry.spec.fields.len();
        entry.items[idx] = ItemState {
            values: vec![None; fields],
            ..ItemState::default()
        };
        Ok(name)
    }

    /// Current lost-update count for an item (observability).
    pub fn lost_count(&self, sub_id: u64, item_pos: u64) -> Option<u64> {
        let entry = self.entries.get(&sub_id)?;
        let idx = (item_pos as usize).checked_sub(1)?;
        entry.items.get(idx).map(|item| item.lost_updates)
    }

    /// Update sequence for an item (observability).
    pub fn update_seq(&self, sub_id: u64, item_pos: u64) -> Option<u64> {
        let entry = self.entries.get(&sub_id)?;
        let idx = (item_pos as usize).checked_sub(1)?;
        entry.items.get(idx).map(|item| item.update_seq)
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn item_index(
    spec: &SubscriptionSpec,
    sub_id: u64,
    item_pos: u64,
) -> Result<usize, RegistryError> {
    let idx = (item_pos as usize)
        .checked_sub(1)
        .ok_or(RegistryError::ItemOutOfRange { sub_id, item: item_pos })?;
    if idx >= spec.items.len() {
        return Err(RegistryError::ItemOutOfRange { sub_id, item: item_pos });
    }
    Ok(idx)
}

struct MessageEntry {
    sequence: String,
    needs_ack: bool,
    completed: bool,
}

/// Per-message acknowledgment bookkeeping, keyed by progressive number.
pub struct MessageRegistry {
    entries: DashMap<u64, MessageEntry>,
}

impl MessageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Track a submitted message.
    pub fn track(&self, prog: u64, sequence: &str, needs_ack: bool) {
        self.entries.insert(
            prog,
            MessageEntry {
                sequence: sequence.to_string(),
                needs_ack,
                completed: false,
            },
        );
    }

    /// Record a terminal outcome for a message. Returns `true` only the
    /// first time, so every message reaches exactly one outcome.
    pub fn complete(&self, prog: u64) -> Result<bool, RegistryError> {
        let mut entry = self
            .entries
            .get_mut(&prog)
            .ok_or(RegistryError::UnknownMessage(prog))?;
        if entry.completed {
            return Ok(false);
        }
        entry.completed = true;
        Ok(true)
    }

    /// Sequence a message was submitted on.
    pub fn sequence(&self, prog: u64) -> Option<String> {
        self.entries.get(&prog).map(|entry| entry.sequence.clone())
    }

    /// Whether the message asked for a server acknowledgment.
    pub fn needs_ack(&self, prog: u64) -> bool {
        self.entries
            .get(&prog)
            .map(|entry| entry.needs_ack)
            .unwrap_or(false)
    }

    /// Mark every uncompleted message completed and return their
    /// progressives, for abort fan-out on session close.
    pub fn abort_all(&self) -> Vec<u64> {
        let mut aborted = Vec::new();
        for mut entry in self.entries.iter_mut() {
            if !entry.completed {
                entry.completed = true;
                aborted.push(*entry.key());
            }
        }
        aborted.sort_unstable();
        aborted
    }

    /// Number of messages still awaiting an outcome.
    pub fn pending_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.completed)
            .count()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SubscriptionSpec {
        SubscriptionSpec {
            items: vec!["itemA".to_string(), "itemB".to_string()],
            fields: vec!["bid".to_string(), "ask".to_string()],
            mode: SubscriptionMode::Merge,
            snapshot: true,
        }
    }

    #[test]
    fn test_differential_update_resolution() {
        let registry = SubscriptionRegistry::new();
        registry.insert(1, spec());
        registry.activate(1).unwrap();

        let first = registry
            .apply_update(
                1,
                1,
                &[
                    FieldValue::Value("101.5".to_string()),
                    FieldValue::Value("101.7".to_string()),
                ],
            )
            .unwrap();
        assert!(first.is_snapshot());
        assert_eq!(first.value("bid"), Some("101.5"));
        assert_eq!(first.changed_fields(), ["bid", "ask"]);

        registry.end_of_snapshot(1, 1).unwrap();

        // Omitted ask keeps its previous value; explicit null clears bid.
        let second = registry
            .apply_update(1, 1, &[FieldValue::Null, FieldValue::Unchanged])
            .unwrap();
        assert!(!second.is_snapshot());
        assert_eq!(second.value("bid"), None);
        assert_eq!(second.value("ask"), Some("101.7"));
        assert_eq!(second.changed_fields(), ["bid"]);
        assert_eq!(registry.update_seq(1, 1), Some(2));
    }

    #[test]
    fn test_lost_updates_monotonic_until_fresh_snapshot() {
        let registry = SubscriptionRegistry::new();
        registry.insert(1, spec());

        registry.record_lost(1, 2, 3).unwrap();
        registry.record_lost(1, 2, 2).unwrap();
        assert_eq!(registry.lost_count(1, 2), Some(5));
        assert_eq!(registry.lost_count(1, 1), Some(0));

        registry.clear_snapshot(1, 2).unwrap();
        assert_eq!(registry.lost_count(1, 2), Some(0));
    }

    #[test]
    fn test_strict_errors_for_inconsistent_frames() {
        let registry = SubscriptionRegistry::new();
        registry.insert(1, spec());

        assert!(matches!(
            registry.apply_update(9, 1, &[FieldValue::Null, FieldValue::Null]),
            Err(RegistryError::UnknownSubscription(9))
        ));
        assert!(matches!(
            registry.apply_update(1, 3, &[FieldValue::Null, FieldValue::Null]),
            Err(RegistryError::ItemOutOfRange { item: 3, .. })
        ));
        assert!(matches!(
            registry.apply_update(1, 1, &[FieldValue::Null]),
            Err(RegistryError::SchemaMismatch { got: 1, .. })
        ));
        assert!(matches!(
            registry.apply_update(1, 0, &[FieldValue::Null, FieldValue::Null]),
            Err(RegistryError::ItemOutOfRange { item: 0, .. })
        ));
    }

    #[test]
    fn test_message_outcomes_are_exactly_once() {
        let registry = MessageRegistry::new();
        registry.track(1, "orders", true);
        registry.track(2, "orders", false);

        assert!(registry.complete(1).unwrap());
        assert!(!registry.complete(1).unwrap());
        assert!(matches!(
            registry.complete(99),
            Err(RegistryError::UnknownMessage(99))
        ));

        let aborted = registry.abort_all();
        assert_eq!(aborted, vec![2]);
        assert_eq!(registry.pending_count(), 0);
    }
}
