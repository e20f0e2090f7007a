// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Resource snapshots, load requests and their settlement.
//!
//! A source field always holds a [`ResourceSnapshot`]. Convergence decides
//! when a new load is needed and emits a [`LoadRequest`]; the loader runs
//! outside of convergence and comes back with a [`SourceSettlement`], which
//! is applied only if the field still waits for the same key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::draft::Draft;
use crate::path::join_concrete;
use crate::plan::StepId;
use crate::rowid::{RowId, RowLookup};
use crate::rule::SourceConcurrency;

/// Load state of a source field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// No key; nothing to load.
    #[default]
    Idle,
    /// A load for the current key is pending.
    Loading,
    /// Data arrived.
    Success,
    /// The loader failed.
    Error,
}

impl SourceStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// The value stored at a source field.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    /// Load state.
    pub status: SourceStatus,
    /// Hash of the key the snapshot belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_hash: Option<String>,
    /// Loaded data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Loader error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResourceSnapshot {
    /// The idle snapshot.
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }

    /// Waiting for `key_hash`.
    #[must_use]
    pub fn loading(key_hash: impl Into<String>) -> Self {
        Self {
            status: SourceStatus::Loading,
            key_hash: Some(key_hash.into()),
            ..Self::default()
        }
    }

    /// Loaded `data` for `key_hash`.
    #[must_use]
    pub fn success(key_hash: impl Into<String>, data: Value) -> Self {
        Self {
            status: SourceStatus::Success,
            key_hash: Some(key_hash.into()),
            data: Some(data),
            error: None,
        }
    }

    /// Failed to load `key_hash`.
    #[must_use]
    pub fn error(key_hash: impl Into<String>, error: Value) -> Self {
        Self {
            status: SourceStatus::Error,
            key_hash: Some(key_hash.into()),
            data: None,
            error: Some(error),
        }
    }

    /// Encodes the snapshot as a document value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("status".into(), Value::from(self.status.as_str()));
        if let Some(hash) = &self.key_hash {
            map.insert("keyHash".into(), Value::from(hash.as_str()));
        }
        if let Some(data) = &self.data {
            map.insert("data".into(), data.clone());
        }
        if let Some(error) = &self.error {
            map.insert("error".into(), error.clone());
        }
        Value::Object(map)
    }

    /// Decodes a document value; `None` if it is not a snapshot.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        Self::deserialize(value).ok()
    }
}

/// Where a load result goes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceTarget {
    /// A document field.
    Field {
        /// Concrete path.
        path: String,
    },
    /// A field of a list row, followed across reorders.
    Row {
        /// Concrete list path.
        list: String,
        /// Stable row id.
        #[serde(rename = "rowId")]
        row_id: RowId,
        /// Path inside the row.
        field: String,
    },
}

impl SourceTarget {
    /// Resolves the target to a concrete path in the current document.
    ///
    /// Row targets whose row is gone resolve to `None`.
    #[must_use]
    pub fn resolve(&self, rows: &dyn RowLookup) -> Option<String> {
        match self {
            Self::Field { path } => Some(path.clone()),
            Self::Row {
                list,
                row_id,
                field,
            } => {
                let index = rows.index_of(list, row_id)?;
                Some(join_concrete(&join_concrete(list, &index.to_string()), field))
            }
        }
    }

    /// Text key identifying the target across reorders.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::Field { path } => path.clone(),
            Self::Row {
                list,
                row_id,
                field,
            } => format!("{list}#{row_id}#{field}"),
        }
    }
}

/// A load the host should perform.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    /// Plan step that asked.
    pub step: StepId,
    /// Resource id of the loader.
    pub resource: String,
    /// Declared path of the source field.
    pub field_path: String,
    /// Where the result goes.
    pub target: SourceTarget,
    /// Request key.
    pub key: Value,
    /// Hash of `key`.
    pub key_hash: String,
    /// Overlap policy.
    pub concurrency: SourceConcurrency,
}

/// A finished load, ready to be applied.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSettlement {
    /// Where the result goes.
    pub target: SourceTarget,
    /// Resource id of the loader.
    pub resource: String,
    /// Key hash the load was made for.
    pub key_hash: String,
    /// The snapshot to store.
    pub snapshot: ResourceSnapshot,
}

impl SourceSettlement {
    /// Settles `request` with the loader's result.
    #[must_use]
    pub fn from_result(request: &LoadRequest, result: Result<Value, Value>) -> Self {
        let snapshot = match result {
            Ok(data) => ResourceSnapshot::success(request.key_hash.clone(), data),
            Err(error) => ResourceSnapshot::error(request.key_hash.clone(), error),
        };
        Self {
            target: request.target.clone(),
            resource: request.resource.clone(),
            key_hash: request.key_hash.clone(),
            snapshot,
        }
    }

    /// Writes the snapshot if the field still waits for the same key.
    ///
    /// Returns the written concrete path, or `None` for a stale result (the
    /// key moved on, or the row is gone).
    pub fn apply(&self, draft: &mut Draft, rows: &dyn RowLookup) -> Option<String> {
        let path = self.target.resolve(rows)?;
        let current = draft.get(&path).and_then(ResourceSnapshot::from_value)?;
        if current.key_hash.as_deref() != Some(self.key_hash.as_str()) {
            tracing::debug!(
                path = %path,
                expected = %self.key_hash,
                "dropping stale source settlement"
            );
            return None;
        }
        draft.set(&path, self.snapshot.to_value());
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::rowid::RowIdStore;

    fn request(target: SourceTarget, key_hash: &str) -> LoadRequest {
        LoadRequest {
            step: StepId(0),
            resource: "user".into(),
            field_path: "profile".into(),
            target,
            key: json!(1),
            key_hash: key_hash.into(),
            concurrency: SourceConcurrency::Switch,
        }
    }

    #[test]
    fn snapshot_value_shape() {
        let value = ResourceSnapshot::success("k1", json!({ "name": "Ada" })).to_value();
        assert_eq!(
            value,
            json!({ "status": "success", "keyHash": "k1", "data": { "name": "Ada" } })
        );
        assert_eq!(
            ResourceSnapshot::from_value(&value),
            Some(ResourceSnapshot::success("k1", json!({ "name": "Ada" })))
        );
        assert_eq!(ResourceSnapshot::idle().to_value(), json!({ "status": "idle" }));
        assert_eq!(ResourceSnapshot::from_value(&json!(3)), None);
    }

    #[test]
    fn stale_settlements_are_dropped() {
        let rows = RowIdStore::new("doc");
        let mut draft = Draft::new(Arc::new(json!({
            "profile": ResourceSnapshot::loading("k2").to_value()
        })));
        let target = SourceTarget::Field {
            path: "profile".into(),
        };

        let stale = SourceSettlement::from_result(&request(target.clone(), "k1"), Ok(json!(1)));
        assert_eq!(stale.apply(&mut draft, &rows), None);
        assert_eq!(draft.get("profile.status"), Some(&json!("loading")));

        let fresh = SourceSettlement::from_result(&request(target, "k2"), Err(json!("boom")));
        assert_eq!(fresh.apply(&mut draft, &rows), Some("profile".to_owned()));
        assert_eq!(draft.get("profile.status"), Some(&json!("error")));
        assert_eq!(draft.get("profile.error"), Some(&json!("boom")));
    }

    #[test]
    fn row_targets_follow_reorders() {
        let mut rows = RowIdStore::new("doc");
        rows.track("items", Some("id".into()));
        let first = json!([{ "id": "a" }, { "id": "b" }]);
        rows.reconcile("items", first.as_array().unwrap());
        let b = rows.ids("items")[1].clone();

        let swapped = json!([{ "id": "b" }, { "id": "a" }]);
        rows.reconcile("items", swapped.as_array().unwrap());
        let target = SourceTarget::Row {
            list: "items".into(),
            row_id: b,
            field: "profile".into(),
        };
        assert_eq!(target.resolve(&rows), Some("items.0.profile".to_owned()));

        rows.reconcile("items", &[]);
        assert_eq!(target.resolve(&rows), None, "removed rows resolve to nothing");
    }
}
