//! Pure transforms from domain events to the work their subscribers do.
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    aggregator::VariantEvent, ancestor_prefixes, model::ExperimentEventRecord, DomainEvent,
    DomainEventKind, EntityKind,
};

/// An entry of the read-through cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    /// A single document.
    Document(String),
    /// A cached prefix listing.
    Listing(String),
}

/// Cache entries made stale by a domain event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInvalidationEvent {
    pub affected_keys: BTreeSet<CacheKey>,
}

/// Maps a domain event of one entity kind to cache invalidations. Implementations are pure:
/// the same event always yields the same invalidations.
pub trait EventAdapter: Send + Sync {
    fn invalidations(&self, event: &DomainEvent) -> Vec<CacheInvalidationEvent>;
}

/// The document itself and every listing containing it.
fn document_and_listings(key: &str) -> BTreeSet<CacheKey> {
    std::iter::once(CacheKey::Document(key.to_owned()))
        .chain(ancestor_prefixes(key).map(|prefix| CacheKey::Listing(prefix.to_owned())))
        .collect()
}

/// Flags, configs, webhooks, users, api keys and scripts.
struct DocumentAdapter;

impl EventAdapter for DocumentAdapter {
    fn invalidations(&self, event: &DomainEvent) -> Vec<CacheInvalidationEvent> {
        vec![CacheInvalidationEvent {
            affected_keys: document_and_listings(&event.key),
        }]
    }
}

/// Deleting an experiment also drops the cached listing of its events.
struct ExperimentAdapter;

impl EventAdapter for ExperimentAdapter {
    fn invalidations(&self, event: &DomainEvent) -> Vec<CacheInvalidationEvent> {
        let mut affected_keys = document_and_listings(&event.key);
        if event.kind == DomainEventKind::Deleted {
            if let Some(id) = EntityKind::Experiments.id_of(&event.key) {
                affected_keys.insert(CacheKey::Listing(format!(
                    "{}{id}/",
                    EntityKind::ExperimentEvents.prefix()
                )));
            }
        }
        vec![CacheInvalidationEvent { affected_keys }]
    }
}

/// Experiment events are append-only and never cached.
struct ExperimentEventAdapter;

impl EventAdapter for ExperimentEventAdapter {
    fn invalidations(&self, _event: &DomainEvent) -> Vec<CacheInvalidationEvent> {
        Vec::new()
    }
}

/// The adapter of `kind`.
pub fn adapter_for(kind: EntityKind) -> &'static dyn EventAdapter {
    match kind {
        EntityKind::Experiments => &ExperimentAdapter,
        EntityKind::ExperimentEvents => &ExperimentEventAdapter,
        EntityKind::Flags
        | EntityKind::Configs
        | EntityKind::Webhooks
        | EntityKind::Users
        | EntityKind::ApiKeys
        | EntityKind::Scripts => &DocumentAdapter,
    }
}

/// The exposure or conversion recorded by a newly created experiment-event document.
pub fn variant_event(event: &DomainEvent) -> Option<VariantEvent> {
    if event.entity_kind != EntityKind::ExperimentEvents || event.kind != DomainEventKind::Created {
        return None;
    }
    recorded_variant_event(&event.key, event.new_value.as_ref()?)
}

/// The variant event stored as experiment-event document `key`.
pub fn recorded_variant_event(key: &str, value: &Value) -> Option<VariantEvent> {
    let Ok(record) = ExperimentEventRecord::deserialize(value) else {
        log::warn!(target: "featurekit", key; "ignoring malformed experiment event");
        return None;
    };
    Some(VariantEvent {
        id: key.to_owned(),
        experiment_id: record.experiment_id,
        variant_id: record.variant_id,
        kind: record.kind,
        timestamp: record.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::aggregator::VariantEventKind;

    fn event(kind: DomainEventKind, key: &str, new_value: Option<Value>) -> DomainEvent {
        DomainEvent {
            kind,
            key: key.to_owned(),
            entity_kind: EntityKind::of_key(key).unwrap(),
            old_value: None,
            new_value,
            version: 7,
            timestamp: Utc::now(),
        }
    }

    fn keys(events: &[CacheInvalidationEvent]) -> Vec<CacheKey> {
        events
            .iter()
            .flat_map(|event| event.affected_keys.iter().cloned())
            .collect()
    }

    #[test]
    fn invalidation_table() {
        use CacheKey::{Document, Listing};

        let cases = [
            (
                event(DomainEventKind::Updated, "flags/beta", None),
                vec![Document("flags/beta".into()), Listing("flags/".into())],
            ),
            (
                event(DomainEventKind::Created, "configs/team/limits", None),
                vec![
                    Document("configs/team/limits".into()),
                    Listing("configs/".into()),
                    Listing("configs/team/".into()),
                ],
            ),
            (
                event(DomainEventKind::Deleted, "scripts/s", None),
                vec![Document("scripts/s".into()), Listing("scripts/".into())],
            ),
            (
                event(DomainEventKind::Updated, "experiments/e", None),
                vec![Document("experiments/e".into()), Listing("experiments/".into())],
            ),
            (
                event(DomainEventKind::Deleted, "experiments/e", None),
                vec![
                    Document("experiments/e".into()),
                    Listing("experiment-events/e/".into()),
                    Listing("experiments/".into()),
                ],
            ),
            (
                event(DomainEventKind::Created, "experiment-events/e/A/1", None),
                vec![],
            ),
        ];
        for (event, expected) in cases {
            let adapter = adapter_for(event.entity_kind);
            let first = adapter.invalidations(&event);
            assert_eq!(keys(&first), expected, "{}", event.key);
            // Replaying the same event yields the same invalidations.
            assert_eq!(adapter.invalidations(&event), first);
        }
    }

    #[test]
    fn derives_variant_events_from_created_records() {
        let record = json!({
            "experimentId": "e",
            "variantId": "A",
            "clientId": "c",
            "kind": "Won",
            "timestamp": "2024-05-01T10:00:00Z"
        });
        let created = event(
            DomainEventKind::Created,
            "experiment-events/e/A/1",
            Some(record.clone()),
        );
        let variant = variant_event(&created).unwrap();
        assert_eq!(variant.id, "experiment-events/e/A/1");
        assert_eq!(variant.kind, VariantEventKind::Won);

        let updated = event(
            DomainEventKind::Updated,
            "experiment-events/e/A/1",
            Some(record),
        );
        assert_eq!(variant_event(&updated), None);
        assert_eq!(
            variant_event(&event(DomainEventKind::Created, "experiment-events/x", Some(json!(1)))),
            None
        );
        assert_eq!(variant_event(&event(DomainEventKind::Created, "flags/x", None)), None);
    }
}
