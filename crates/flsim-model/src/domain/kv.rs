use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyValueError {
    #[error("expected key=value, got: {0}")]
    MissingSeparator(String),
    #[error("empty key in: {0}")]
    EmptyKey(String),
}

/// A single `key=value` pair, as given through `--set`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    key: String,
    value: String,
}

impl KeyValue {
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Find the last value for `key` in a list of pairs.
    ///
    /// Later entries override earlier ones.
    pub fn lookup<'a>(pairs: &'a [KeyValue], key: &str) -> Option<&'a str> {
        pairs
            .iter()
            .rev()
            .find(|kv| kv.key == key)
            .map(|kv| kv.value.as_str())
    }
}

impl FromStr for KeyValue {
    type Err = KeyValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| KeyValueError::MissingSeparator(s.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(KeyValueError::EmptyKey(s.to_string()));
        }
        Ok(KeyValue::new(key, value.trim()))
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}
