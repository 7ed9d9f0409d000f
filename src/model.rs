//! Typed models of the entities stored as documents.
//!
//! Stores are schema-less; these models are used when a component needs to interpret a document
//! and when imported records are validated against their entity kind.
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{aggregator::VariantEventKind, document::EntityKind};

/// A feature flag.
///
/// Flags are created and updated through store writes and are only ever read by evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    /// Defaults to the id segment of the document key.
    #[serde(default)]
    pub id: String,
    pub enabled: bool,
    pub activation_strategy: ActivationStrategy,
}

/// The rule by which a flag's on/off state is derived for a given request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all_fields = "camelCase")]
pub enum ActivationStrategy {
    Always,
    Never,
    /// Delegate the decision to a script stored under `scripts/<script_id>`.
    Script { script_id: String },
    /// Enable for `percentage`% of subjects. Subjects are identified by the `id` field of the
    /// context; requests without one are sampled randomly.
    Percentage { percentage: f64 },
    /// Enable from `date` on.
    ReleaseDate { date: DateTime<Utc> },
    /// Enable between `from` (inclusive) and `to` (exclusive).
    DateRange {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
    /// Enable daily between `start_at` and `end_at` (UTC). Wraps past midnight when
    /// `end_at < start_at`.
    HourRange {
        start_at: NaiveTime,
        end_at: NaiveTime,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    /// Sandboxed JavaScript-flavoured predicate language.
    Js,
    /// A predicate implemented by the host and registered with the sandbox under the name given
    /// by the script source.
    Native,
}

/// An operator-authored predicate script. The store is the source of truth for `source`; the
/// sandbox owns the compiled form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    #[serde(default)]
    pub id: String,
    pub language: ScriptLanguage,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub enabled: bool,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Share of subjects assigned to the variant, in percent.
    pub traffic: f64,
}

/// An exposure or conversion recorded for one subject, stored under
/// `experiment-events/<experiment>/<variant>/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentEventRecord {
    pub experiment_id: String,
    pub variant_id: String,
    pub client_id: String,
    pub kind: VariantEventKind,
    pub timestamp: DateTime<Utc>,
}

/// A dynamic configuration blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub id: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    #[serde(default)]
    pub id: String,
    pub url: String,
    /// Key patterns the hook listens to.
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub headers: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub authorized_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    #[serde(default)]
    pub client_id: String,
    pub name: String,
    #[serde(default)]
    pub authorized_patterns: Vec<String>,
}

/// Check that `value` is a valid document for `kind`.
pub fn validate(kind: EntityKind, value: &serde_json::Value) -> Result<(), String> {
    fn check<T: serde::de::DeserializeOwned>(value: &serde_json::Value) -> Result<(), String> {
        T::deserialize(value).map(drop).map_err(|err| err.to_string())
    }

    match kind {
        EntityKind::Flags => check::<FeatureFlag>(value),
        EntityKind::Configs => check::<Config>(value),
        EntityKind::Experiments => {
            let experiment: Experiment =
                Experiment::deserialize(value).map_err(|err| err.to_string())?;
            let total: f64 = experiment.variants.iter().map(|v| v.traffic).sum();
            if experiment.variants.is_empty() || (total - 100.0).abs() > 1e-6 {
                return Err(format!(
                    "variant traffic must sum to 100 (found {total})"
                ));
            }
            Ok(())
        }
        EntityKind::ExperimentEvents => check::<ExperimentEventRecord>(value),
        EntityKind::Webhooks => check::<Webhook>(value),
        EntityKind::Users => check::<User>(value),
        EntityKind::ApiKeys => check::<ApiKey>(value),
        EntityKind::Scripts => check::<Script>(value),
    }
}
