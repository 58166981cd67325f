//! Job launch parameters and instance identity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parameter added at launch so repeated runs with the same caller parameters
/// map to distinct job instances.
pub const RUN_TIME_KEY: &str = "run.time";

/// A single launch parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParameter {
    pub value: String,
    /// Whether the parameter takes part in the job instance identity.
    pub identifying: bool,
}

/// Ordered set of launch parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(BTreeMap<String, JobParameter>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build identifying parameters from a plain string map.
    pub fn from_map<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut out = Self::new();
        for (k, v) in params {
            out.insert(k, v);
        }
        out
    }

    /// Insert an identifying parameter.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(
            key.into(),
            JobParameter {
                value: value.into(),
                identifying: true,
            },
        );
    }

    /// Insert a parameter that does not affect instance identity.
    pub fn insert_non_identifying(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(
            key.into(),
            JobParameter {
                value: value.into(),
                identifying: false,
            },
        );
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|p| p.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JobParameter)> {
        self.0.iter()
    }

    /// Add the uniqueness marker unless the caller pinned one already.
    pub fn with_run_time(mut self, now: DateTime<Utc>) -> Self {
        if !self.contains(RUN_TIME_KEY) {
            self.insert(RUN_TIME_KEY, now.to_rfc3339());
        }
        self
    }

    /// Canonical identity key: identifying parameters in key order.
    pub fn identity_key(&self) -> String {
        self.0
            .iter()
            .filter(|(_, p)| p.identifying)
            .map(|(k, p)| format!("{}={}", escape(k), escape(&p.value)))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Flatten into plain strings (summary view).
    pub fn to_string_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|(k, p)| (k.clone(), p.value.clone()))
            .collect()
    }
}

fn escape(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace('=', "\\=")
}
