//! Request-time evaluation of feature flags.
use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde_json::Value;

use crate::{
    model::{ActivationStrategy, FeatureFlag, Script},
    script::ScriptSandbox,
    sharder::{Md5Sharder, Sharder},
    store::VersionedDocumentStore,
    EntityKind, Result,
};

/// Percentages are bucketed with a resolution of 0.01%.
const PERCENTAGE_SHARDS: u64 = 10_000;

/// Decides whether flags are active for a request context.
///
/// Flags and scripts are read through the given stores (usually the read-through caches). Script
/// faults of any kind leave the flag inactive.
pub struct FeatureEvaluator {
    flags: Arc<dyn VersionedDocumentStore>,
    scripts: Arc<dyn VersionedDocumentStore>,
    sandbox: Arc<ScriptSandbox>,
}

impl FeatureEvaluator {
    pub fn new(
        flags: Arc<dyn VersionedDocumentStore>,
        scripts: Arc<dyn VersionedDocumentStore>,
        sandbox: Arc<ScriptSandbox>,
    ) -> FeatureEvaluator {
        FeatureEvaluator {
            flags,
            scripts,
            sandbox,
        }
    }

    /// The flag stored under `flags/<flag_id>`.
    pub async fn flag(&self, flag_id: &str) -> Result<FeatureFlag> {
        let document = self.flags.get(&EntityKind::Flags.key(flag_id)).await?;
        let mut flag: FeatureFlag = document.parse()?;
        if flag.id.is_empty() {
            flag.id = flag_id.to_owned();
        }
        Ok(flag)
    }

    /// Whether `flag_id` is active for `context`. Fails only when the flag cannot be read.
    pub async fn is_active(&self, flag_id: &str, context: &Value) -> Result<bool> {
        let flag = self.flag(flag_id).await?;
        Ok(self.evaluate_at(&flag, context, Utc::now()).await)
    }

    /// Evaluate every flag under `flags/<prefix>`, keyed by flag id. Flags whose document does not
    /// parse are reported inactive.
    pub async fn active_flags(
        &self,
        prefix: &str,
        context: &Value,
    ) -> Result<BTreeMap<String, bool>> {
        let key_prefix = format!("{}{prefix}", EntityKind::Flags.prefix());
        let documents: Vec<_> = self.flags.find_by_prefix(&key_prefix, None).try_collect().await?;
        let now = Utc::now();
        let mut active = BTreeMap::new();
        for document in documents {
            let Some(id) = EntityKind::Flags.id_of(&document.key) else {
                continue;
            };
            let is_active = match document.parse::<FeatureFlag>() {
                Ok(mut flag) => {
                    if flag.id.is_empty() {
                        flag.id = id.to_owned();
                    }
                    self.evaluate_at(&flag, context, now).await
                }
                Err(err) => {
                    log::warn!(
                        target: "featurekit",
                        flag_id = id,
                        error:% = err;
                        "unreadable flag treated as inactive"
                    );
                    false
                }
            };
            active.insert(id.to_owned(), is_active);
        }
        Ok(active)
    }

    /// Whether `flag` is active for `context` at `now`.
    pub async fn evaluate_at(
        &self,
        flag: &FeatureFlag,
        context: &Value,
        now: DateTime<Utc>,
    ) -> bool {
        if !flag.enabled {
            return false;
        }
        match &flag.activation_strategy {
            ActivationStrategy::Always => true,
            ActivationStrategy::Never => false,
            ActivationStrategy::Script { script_id } => {
                self.evaluate_script(&flag.id, script_id, context).await
            }
            ActivationStrategy::Percentage { percentage } => {
                in_percentage(&flag.id, context, *percentage, &Md5Sharder)
            }
            ActivationStrategy::ReleaseDate { date } => now >= *date,
            ActivationStrategy::DateRange { from, to } => *from <= now && now < *to,
            ActivationStrategy::HourRange { start_at, end_at } => {
                let time = now.time();
                if start_at <= end_at {
                    *start_at <= time && time < *end_at
                } else {
                    *start_at <= time || time < *end_at
                }
            }
        }
    }

    async fn evaluate_script(&self, flag_id: &str, script_id: &str, context: &Value) -> bool {
        let script = match self.scripts.get(&EntityKind::Scripts.key(script_id)).await {
            Ok(document) => document.parse::<Script>().map(|mut script| {
                if script.id.is_empty() {
                    script.id = script_id.to_owned();
                }
                script
            }),
            Err(err) => Err(err),
        };
        let script = match script {
            Ok(script) => script,
            Err(err) => {
                log::warn!(
                    target: "featurekit",
                    flag_id,
                    script_id,
                    error:% = err;
                    "script unavailable, flag disabled"
                );
                return false;
            }
        };
        match self.sandbox.run(&script, context).await {
            Ok(decision) => decision.is_enabled(),
            Err(err) => {
                log::warn!(
                    target: "featurekit",
                    flag_id,
                    script_id,
                    error:% = err;
                    "script evaluation failed, flag disabled"
                );
                false
            }
        }
    }
}

/// Subjects are identified by the `id` field of the context. Without one the request is sampled.
fn in_percentage(flag_id: &str, context: &Value, percentage: f64, sharder: &impl Sharder) -> bool {
    let threshold = (percentage.clamp(0.0, 100.0) * 100.0).round() as u64;
    let subject = match context.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return rand::random::<u64>() % PERCENTAGE_SHARDS < threshold,
    };
    sharder.get_shard(format!("{flag_id}-{subject}"), PERCENTAGE_SHARDS) < threshold
}
