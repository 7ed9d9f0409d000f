use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use super::{ExperimentResults, VariantEvent, VariantEventAggregator, VariantEventKind};
use crate::{config::AggregatorEngine, Result};

#[derive(Debug, Default)]
struct Counters {
    displayed: AtomicU64,
    won: AtomicU64,
}

impl Counters {
    fn of(&self, kind: VariantEventKind) -> &AtomicU64 {
        match kind {
            VariantEventKind::Displayed => &self.displayed,
            VariantEventKind::Won => &self.won,
        }
    }
}

/// In-process counters. Increments are atomic adds, never read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryAggregator {
    seen: DashSet<String>,
    /// Experiment id to variant id to counters.
    experiments: DashMap<String, Arc<DashMap<String, Counters>>>,
}

impl MemoryAggregator {
    pub fn new() -> MemoryAggregator {
        MemoryAggregator::default()
    }
}

#[async_trait]
impl VariantEventAggregator for MemoryAggregator {
    fn engine(&self) -> AggregatorEngine {
        AggregatorEngine::InMemory
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        if !self.seen.insert(event.id.clone()) {
            return Ok(());
        }
        let variants = self
            .experiments
            .entry(event.experiment_id.clone())
            .or_default()
            .clone();
        variants
            .entry(event.variant_id.clone())
            .or_default()
            .of(event.kind)
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let mut results = ExperimentResults::new(experiment_id);
        let Some(variants) = self.experiments.get(experiment_id).map(|v| v.clone()) else {
            return Ok(results);
        };
        for entry in variants.iter() {
            for kind in VariantEventKind::ALL {
                results.add(entry.key(), kind, entry.value().of(kind).load(Ordering::Relaxed));
            }
        }
        Ok(results)
    }
}
