//! Key-value cache interface (Redis-like).
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Result;

/// The subset of a Redis-like key-value server the engines rely on.
#[async_trait]
pub trait KvConnection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically replace the value of `key` if its current value equals `expected` (`None` meaning
    /// absent). A `value` of `None` deletes the key. Returns `false` when the key changed in the
    /// meantime. Maps to a `WATCH`/`MULTI` transaction or a compare-and-set script.
    async fn set_if(&self, key: &str, expected: Option<&str>, value: Option<&str>)
        -> Result<bool>;

    /// Keys matching a glob `pattern` (`SCAN ... MATCH`). Order is unspecified.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    /// Atomic `INCRBY`, returning the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
}

/// Escape glob metacharacters of `literal` so it only matches itself.
pub(crate) fn escape_glob(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Glob matching with `*`, `?` and `\` escapes.
fn glob_match(pattern: &[char], input: &[char]) -> bool {
    match pattern.split_first() {
        None => input.is_empty(),
        Some(('*', rest)) => (0..=input.len()).any(|skip| glob_match(rest, &input[skip..])),
        Some(('?', rest)) => !input.is_empty() && glob_match(rest, &input[1..]),
        Some(('\\', rest)) if !rest.is_empty() => {
            input.first() == Some(&rest[0]) && glob_match(&rest[1..], &input[1..])
        }
        Some((c, rest)) => input.first() == Some(c) && glob_match(rest, &input[1..]),
    }
}

/// Embedded key-value server.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> MemoryKv {
        MemoryKv::default()
    }
}

#[async_trait]
impl KvConnection for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set_if(
        &self,
        key: &str,
        expected: Option<&str>,
        value: Option<&str>,
    ) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match value {
            Some(value) => entries.insert(key.to_owned(), value.to_owned()),
            None => entries.remove(key),
        };
        Ok(true)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        let pattern: Vec<char> = pattern.chars().collect();
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|key| glob_match(&pattern, &key.chars().collect::<Vec<_>>()))
            .cloned()
            .collect())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.lock();
        let current = entries
            .get(key)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        entries.insert(key.to_owned(), next.to_string());
        Ok(next)
    }
}
