//! Sandboxed evaluation of operator-authored enable/disable predicates.
//!
//! A script sees only what it is given: the request context (read-only JSON), the `enabled` and
//! `disabled` callbacks (also reachable as `markEnabled` and `markDisabled`) and an `http` object
//! with `get(url)` and `post(url, body)`. Exactly one callback must be called.
//!
//! ```text
//! function check(context, enabled, disabled, http) {
//!     if (context.user.endsWith("@example.com")) enabled() else disabled()
//! }
//! ```
//!
//! Scripts run on tokio's blocking pool under an operation budget, a call depth limit, a value
//! size limit and a wall-clock deadline. A script that overruns its deadline is abandoned: the
//! caller gets [`EvaluationError::Timeout`] immediately and the script thread stops at its next
//! step.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};

use crate::{
    config::SandboxConfig,
    model::{Script, ScriptLanguage},
};

mod http;
mod interpreter;
mod lexer;
mod parser;

pub use http::{DenyHttp, HttpCapability, HttpMethod, HttpRequest, HttpResponse, ScopedHttpClient};

/// Outcome of a successful evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Enabled,
    Disabled,
}

impl Decision {
    pub fn is_enabled(self) -> bool {
        self == Decision::Enabled
    }
}

/// A script that could not be compiled.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at line {line}, column {column}")]
pub struct CompileError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

/// A script that compiled but did not reach a decision.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    #[error("script exceeded its time budget")]
    Timeout,
    #[error("script threw: {0}")]
    Thrown(String),
    #[error("script called neither enabled() nor disabled()")]
    NoDecision,
    #[error("script decided more than once")]
    DoubleDecision,
    #[error("script exceeded a resource limit: {0}")]
    ResourceLimit(String),
}

/// A predicate implemented in Rust, referenced by name from a [`ScriptLanguage::Native`] script.
pub type NativePredicate =
    Arc<dyn Fn(&serde_json::Value) -> Result<Decision, String> + Send + Sync>;

#[derive(Clone)]
enum Body {
    Js(Arc<parser::Program>),
    Native(NativePredicate),
}

/// Compiled form of a [`Script`], cached by the sandbox.
#[derive(Clone)]
pub struct CompiledScript {
    pub id: String,
    /// Hex md5 of the source this was compiled from.
    pub source_hash: String,
    pub language: ScriptLanguage,
    pub compiled_at: DateTime<Utc>,
    body: Body,
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("id", &self.id)
            .field("source_hash", &self.source_hash)
            .field("language", &self.language)
            .field("compiled_at", &self.compiled_at)
            .finish_non_exhaustive()
    }
}

fn source_hash(source: &str) -> String {
    format!("{:x}", md5::compute(source.as_bytes()))
}

/// Compiles, caches and evaluates scripts.
pub struct ScriptSandbox {
    config: SandboxConfig,
    http: Arc<dyn HttpCapability>,
    natives: DashMap<String, NativePredicate>,
    compiled: DashMap<String, Arc<CompiledScript>>,
}

impl ScriptSandbox {
    /// Sandbox whose scripts reach the network through a [`ScopedHttpClient`] built from `config`.
    pub fn new(config: SandboxConfig) -> ScriptSandbox {
        let http = Arc::new(ScopedHttpClient::new(&config));
        ScriptSandbox::with_http(config, http)
    }

    pub fn with_http(config: SandboxConfig, http: Arc<dyn HttpCapability>) -> ScriptSandbox {
        ScriptSandbox {
            config,
            http,
            natives: DashMap::new(),
            compiled: DashMap::new(),
        }
    }

    /// Default timeout for [`ScriptSandbox::evaluate`].
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Register a native predicate under `name`.
    pub fn register_native(
        &self,
        name: impl Into<String>,
        predicate: impl Fn(&serde_json::Value) -> Result<Decision, String> + Send + Sync + 'static,
    ) {
        self.natives.insert(name.into(), Arc::new(predicate));
    }

    /// Compiled form of `script`, from the cache when its source is unchanged.
    ///
    /// Compilations of the same script id are serialized; different ids compile concurrently.
    pub fn compile(&self, script: &Script) -> Result<Arc<CompiledScript>, CompileError> {
        let hash = source_hash(&script.source);
        if let Some(compiled) = self.compiled.get(&script.id) {
            if compiled.source_hash == hash {
                return Ok(compiled.clone());
            }
        }

        let compiled = match self.compiled.entry(script.id.clone()) {
            Entry::Occupied(entry) if entry.get().source_hash == hash => {
                return Ok(entry.get().clone());
            }
            Entry::Occupied(mut entry) => {
                let compiled = self.build(script, hash)?;
                entry.insert(compiled.clone());
                compiled
            }
            Entry::Vacant(entry) => {
                let compiled = self.build(script, hash)?;
                entry.insert(compiled.clone());
                compiled
            }
        };
        self.evict_over_capacity(&script.id);
        Ok(compiled)
    }

    fn build(
        &self,
        script: &Script,
        source_hash: String,
    ) -> Result<Arc<CompiledScript>, CompileError> {
        let body = match script.language {
            ScriptLanguage::Js => Body::Js(Arc::new(parser::parse(&script.source)?)),
            ScriptLanguage::Native => {
                let name = script.source.trim();
                let predicate = self.natives.get(name).ok_or_else(|| CompileError {
                    message: format!("no native predicate named {name:?}"),
                    line: 1,
                    column: 1,
                })?;
                Body::Native(predicate.clone())
            }
        };
        log::debug!(
            target: "featurekit",
            script_id = script.id.as_str(),
            source_hash = source_hash.as_str();
            "compiled script"
        );
        Ok(Arc::new(CompiledScript {
            id: script.id.clone(),
            source_hash,
            language: script.language,
            compiled_at: Utc::now(),
            body,
        }))
    }

    fn evict_over_capacity(&self, keep: &str) {
        while self.compiled.len() > self.config.cache_capacity.max(1) {
            let oldest = self
                .compiled
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.compiled_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(id) => {
                    self.compiled.remove(&id);
                }
                None => return,
            }
        }
    }

    /// Drop the compiled form of `script_id`, if cached.
    pub fn evict(&self, script_id: &str) {
        self.compiled.remove(script_id);
    }

    pub fn cached_scripts(&self) -> usize {
        self.compiled.len()
    }

    /// Evaluate `compiled` against `context`, giving up after `timeout`.
    pub async fn evaluate(
        &self,
        compiled: &CompiledScript,
        context: &serde_json::Value,
        timeout: Duration,
    ) -> Result<Decision, EvaluationError> {
        let program = match &compiled.body {
            Body::Native(predicate) => return predicate(context).map_err(EvaluationError::Thrown),
            Body::Js(program) => program.clone(),
        };

        let limits = interpreter::Limits {
            deadline: Instant::now() + timeout,
            max_operations: self.config.max_operations,
            max_call_depth: self.config.max_call_depth,
            max_value_len: self.config.max_value_len,
            http_timeout: self.config.http_timeout,
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        let task = {
            let context = context.clone();
            let cancelled = cancelled.clone();
            let http = self.http.clone();
            tokio::task::spawn_blocking(move || {
                interpreter::run(&program, &context, &limits, &cancelled, http.as_ref())
            })
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(EvaluationError::Thrown(format!(
                "script evaluation aborted: {err}"
            ))),
            Err(_) => {
                // The task is detached, not awaited. It observes the flag at its next step.
                cancelled.store(true, Ordering::Relaxed);
                log::warn!(
                    target: "featurekit",
                    script_id = compiled.id.as_str(),
                    timeout:? = timeout;
                    "script timed out"
                );
                Err(EvaluationError::Timeout)
            }
        }
    }

    /// Compile `script` and evaluate it with the configured timeout. Compile errors are reported as
    /// [`EvaluationError::Thrown`].
    pub async fn run(
        &self,
        script: &Script,
        context: &serde_json::Value,
    ) -> Result<Decision, EvaluationError> {
        let compiled = self
            .compile(script)
            .map_err(|err| EvaluationError::Thrown(format!("compile error: {err}")))?;
        self.evaluate(&compiled, context, self.timeout()).await
    }
}
