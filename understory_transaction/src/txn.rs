// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Transactions: proposed changes and their commit metadata.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use understory_converge::{SourceSettlement, ValidateRequest};

/// Scheduling lane.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Served as soon as possible.
    Urgent,
    /// Debounced and possibly coalesced.
    NonUrgent,
}

/// Priority of a transaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive work.
    #[default]
    Normal,
    /// Background work.
    Low,
}

impl Priority {
    /// Lane this priority is scheduled on.
    #[must_use]
    pub fn lane(self) -> Lane {
        match self {
            Self::Normal => Lane::Urgent,
            Self::Low => Lane::NonUrgent,
        }
    }
}

/// What produced a transaction.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnOrigin {
    /// A host action or state write.
    #[default]
    Action,
    /// An explicit validation request.
    Validate,
    /// An explicit source refresh.
    SourceRefresh,
    /// A loader completion.
    SourceSettle,
}

/// A change to the document value.
#[derive(Clone)]
pub enum Mutation {
    /// Replaces the whole value.
    Replace(Value),
    /// Writes one path.
    Set {
        /// Concrete path.
        path: String,
        /// New value.
        value: Value,
    },
    /// Writes several paths.
    Patch(Vec<(String, Value)>),
    /// Removes one path.
    Remove {
        /// Concrete path.
        path: String,
    },
    /// Mutates the value through a closure; the written paths are unknown.
    Update(Arc<dyn Fn(&mut Value) + Send + Sync>),
}

impl core::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Self::Set { path, value } => f
                .debug_struct("Set")
                .field("path", path)
                .field("value", value)
                .finish(),
            Self::Patch(writes) => f.debug_tuple("Patch").field(writes).finish(),
            Self::Remove { path } => f.debug_struct("Remove").field("path", path).finish(),
            Self::Update(_) => f.write_str("Update(..)"),
        }
    }
}

/// One proposal of a transaction.
#[derive(Clone, Debug)]
pub enum Proposal {
    /// Changes the value.
    Mutate(Mutation),
    /// Runs validation after convergence.
    Validate {
        /// Targets and modes.
        requests: Vec<ValidateRequest>,
    },
    /// Re-evaluates the key of a source and reloads it.
    RefreshSource {
        /// Declared or concrete source path.
        path: String,
        /// Reload even if the key and snapshot are current.
        force: bool,
    },
    /// Writes a loader result.
    Settle(SourceSettlement),
}

/// A batch of proposals committed atomically.
///
/// # Example
///
/// ```
/// use serde_json::json;
/// use understory_transaction::{Lane, Priority, Txn};
///
/// let txn = Txn::new()
///     .set("name", json!("Ada"))
///     .set("age", json!(36))
///     .with_priority(Priority::Low);
/// assert_eq!(txn.proposals().len(), 2);
/// assert_eq!(txn.lane(), Lane::NonUrgent);
/// ```
#[derive(Clone, Debug, Default)]
pub struct Txn {
    priority: Priority,
    origin: TxnOrigin,
    label: Option<String>,
    proposals: Vec<Proposal>,
}

impl Txn {
    /// Starts an empty action transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transaction delivering a loader result.
    #[must_use]
    pub fn settle(settlement: SourceSettlement) -> Self {
        Self {
            origin: TxnOrigin::SourceSettle,
            proposals: vec![Proposal::Settle(settlement)],
            ..Self::default()
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the origin.
    #[must_use]
    pub fn with_origin(mut self, origin: TxnOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Sets a label for logs and devtools.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Appends a proposal.
    #[must_use]
    pub fn propose(mut self, proposal: Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    /// Replaces the whole value.
    #[must_use]
    pub fn replace(self, value: Value) -> Self {
        self.propose(Proposal::Mutate(Mutation::Replace(value)))
    }

    /// Writes one path.
    #[must_use]
    pub fn set(self, path: impl Into<String>, value: Value) -> Self {
        self.propose(Proposal::Mutate(Mutation::Set {
            path: path.into(),
            value,
        }))
    }

    /// Writes several paths.
    #[must_use]
    pub fn patch<P: Into<String>>(self, writes: impl IntoIterator<Item = (P, Value)>) -> Self {
        let writes = writes.into_iter().map(|(p, v)| (p.into(), v)).collect();
        self.propose(Proposal::Mutate(Mutation::Patch(writes)))
    }

    /// Removes one path.
    #[must_use]
    pub fn remove(self, path: impl Into<String>) -> Self {
        self.propose(Proposal::Mutate(Mutation::Remove { path: path.into() }))
    }

    /// Mutates the value through a closure.
    #[must_use]
    pub fn update(self, f: impl Fn(&mut Value) + Send + Sync + 'static) -> Self {
        self.propose(Proposal::Mutate(Mutation::Update(Arc::new(f))))
    }

    /// Requests validation.
    #[must_use]
    pub fn validate(self, requests: impl IntoIterator<Item = ValidateRequest>) -> Self {
        let mut txn = self.propose(Proposal::Validate {
            requests: requests.into_iter().collect(),
        });
        if txn.proposals.len() == 1 {
            txn.origin = TxnOrigin::Validate;
        }
        txn
    }

    /// Requests a source refresh.
    #[must_use]
    pub fn refresh_source(self, path: impl Into<String>, force: bool) -> Self {
        let mut txn = self.propose(Proposal::RefreshSource {
            path: path.into(),
            force,
        });
        if txn.proposals.len() == 1 {
            txn.origin = TxnOrigin::SourceRefresh;
        }
        txn
    }

    /// Priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Lane derived from the priority.
    #[must_use]
    pub fn lane(&self) -> Lane {
        self.priority.lane()
    }

    /// Origin.
    #[must_use]
    pub fn origin(&self) -> TxnOrigin {
        self.origin
    }

    /// Label.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Proposals in order.
    #[must_use]
    pub fn proposals(&self) -> &[Proposal] {
        &self.proposals
    }

    pub(crate) fn into_parts(self) -> (TxnOrigin, Priority, Option<String>, Vec<Proposal>) {
        (self.origin, self.priority, self.label, self.proposals)
    }
}

/// A transaction admitted into a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxnDescriptor {
    /// Commit sequence number it was applied in.
    pub seq: u64,
    /// `<instance>::t<n>`.
    pub id: String,
    /// Origin.
    pub origin: TxnOrigin,
    /// Label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Priority.
    pub priority: Priority,
    /// Lane.
    pub lane: Lane,
}

/// Whether a commit carried one transaction or several.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitMode {
    /// One transaction.
    Single,
    /// Several queued transactions merged into one commit.
    Coalesced {
        /// Number of transactions.
        count: usize,
    },
}

/// What observers receive with each committed state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitMeta {
    /// Strictly increasing commit number.
    pub seq: u64,
    /// Id of the last transaction of the commit.
    pub txn_id: String,
    /// Single or coalesced.
    pub commit_mode: CommitMode,
    /// Highest priority in the commit.
    pub priority: Priority,
    /// Origin of the last transaction.
    pub origin: TxnOrigin,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use understory_converge::{ValidateMode, ValidateTarget};

    use super::*;

    #[test]
    fn origin_follows_first_proposal() {
        let txn = Txn::new().validate([ValidateRequest::new(
            ValidateMode::Submit,
            ValidateTarget::Root,
        )]);
        assert_eq!(txn.origin(), TxnOrigin::Validate);

        let txn = Txn::new().set("a", json!(1)).refresh_source("profile", true);
        assert_eq!(txn.origin(), TxnOrigin::Action);
        assert_eq!(txn.lane(), Lane::Urgent);
    }

    #[test]
    fn commit_meta_shape() {
        let meta = CommitMeta {
            seq: 3,
            txn_id: "doc::t7".into(),
            commit_mode: CommitMode::Coalesced { count: 2 },
            priority: Priority::Low,
            origin: TxnOrigin::Action,
        };
        assert_eq!(
            serde_json::to_value(&meta).unwrap(),
            json!({
                "seq": 3,
                "txnId": "doc::t7",
                "commitMode": { "kind": "coalesced", "count": 2 },
                "priority": "low",
                "origin": "action"
            })
        );
    }

    #[test]
    fn update_debug_hides_closure() {
        let txn = Txn::new().update(|v| v["a"] = json!(1));
        assert_eq!(format!("{:?}", txn.proposals()[0]), "Mutate(Update(..))");
    }
}
