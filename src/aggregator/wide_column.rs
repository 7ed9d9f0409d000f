use std::sync::Arc;

use async_trait::async_trait;

use super::{ExperimentResults, VariantEvent, VariantEventAggregator, VariantEventKind};
use crate::{
    config::AggregatorEngine,
    driver::{LightweightCondition, Row, WideColumnSession},
    Engine, Result,
};

/// Cassandra-like counter table `{namespace}_variant_counts`, one partition per experiment and
/// one `{variant}:{kind}` counter column per variant and kind. Events are first claimed with an
/// `IF NOT EXISTS` insert into `{namespace}_variant_events`. The claim is deleted again when the
/// counter update fails, so a retry counts the event.
pub struct WideColumnAggregator {
    session: Arc<dyn WideColumnSession>,
    events_table: String,
    counts_table: String,
    engine: Engine,
}

impl WideColumnAggregator {
    pub fn new(session: Arc<dyn WideColumnSession>, namespace: &str) -> WideColumnAggregator {
        WideColumnAggregator {
            session,
            events_table: format!("{namespace}_variant_events"),
            counts_table: format!("{namespace}_variant_counts"),
            engine: Engine::CassandraLike,
        }
    }

    /// Same layout, reported as another engine.
    pub fn with_engine(mut self, engine: Engine) -> WideColumnAggregator {
        self.engine = engine;
        self
    }
}

#[async_trait]
impl VariantEventAggregator for WideColumnAggregator {
    fn engine(&self) -> AggregatorEngine {
        self.engine.into()
    }

    async fn record(&self, event: &VariantEvent) -> Result<()> {
        let claim = Row {
            partition: event.experiment_id.clone(),
            clustering: event.id.clone(),
            value: event.kind.as_str().to_owned(),
            version: 0,
        };
        if !self
            .session
            .insert_if(&self.events_table, claim, LightweightCondition::NotExists)
            .await?
        {
            return Ok(());
        }
        let column = format!("{}:{}", event.variant_id, event.kind.as_str());
        let counted = self
            .session
            .add_counter(&self.counts_table, &event.experiment_id, &column, 1)
            .await;
        if counted.is_err() {
            let released = self
                .session
                .delete_if(&self.events_table, &event.experiment_id, &event.id, 0)
                .await;
            if let Err(err) = released {
                log::error!(
                    target: "featurekit",
                    event_id = event.id.as_str(),
                    error:% = err;
                    "failed to release variant event claim, the event stays uncounted"
                );
            }
        }
        counted
    }

    async fn aggregate(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let mut results = ExperimentResults::new(experiment_id);
        let counters = self
            .session
            .counters(&self.counts_table, experiment_id)
            .await?;
        for (column, count) in counters {
            // Variant ids may contain `:`, kinds never do.
            let Some((variant, kind)) = column.rsplit_once(':') else {
                continue;
            };
            if let Some(kind) = VariantEventKind::parse(kind) {
                results.add(variant, kind, u64::try_from(count).unwrap_or(0));
            }
        }
        Ok(results)
    }
}
