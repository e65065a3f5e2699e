//! Query templates.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::{ParamHint, ParamValue, detect_placeholders};

/// A saved, parameterised query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTemplate {
    /// Unique template ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// SQL text with `{{name}}`, `:name` or `$name` placeholders.
    pub sql: String,
    /// Instance or account the executor runs this query against.
    pub target_system_id: String,
    /// Values used when neither the schedule nor the backfill supplies one.
    #[serde(default)]
    pub defaults: BTreeMap<String, ParamValue>,
    /// Per-parameter rendering hints.
    #[serde(default)]
    pub hints: BTreeMap<String, ParamHint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueryTemplate {
    pub fn new(
        name: impl Into<String>,
        sql: impl Into<String>,
        target_system_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            sql: sql.into(),
            target_system_id: target_system_id.into(),
            defaults: BTreeMap::new(),
            hints: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.defaults.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_hint(mut self, name: impl Into<String>, hint: ParamHint) -> Self {
        self.hints.insert(name.into(), hint);
        self
    }

    /// Placeholder names referenced by the SQL text.
    #[must_use]
    pub fn placeholders(&self) -> BTreeSet<String> {
        detect_placeholders(&self.sql)
    }

    /// Merge values in precedence order: template defaults, then each layer.
    #[must_use]
    pub fn merged_values<'a>(
        &self,
        layers: impl IntoIterator<Item = &'a BTreeMap<String, ParamValue>>,
    ) -> BTreeMap<String, ParamValue> {
        let mut values = self.defaults.clone();
        for layer in layers {
            values.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        values
    }
}
