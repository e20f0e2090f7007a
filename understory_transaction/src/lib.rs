// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Understory Transaction: serialized commits over a converging document.
//!
//! A [`Document`] owns a compiled [`Program`](understory_converge::Program)
//! and the state it keeps derived. Every change arrives as a [`Txn`]; a
//! commit applies one or more transactions, converges, validates, and
//! publishes the result under the next sequence number.
//!
//! - **Configuration** ([`ConfigLayers`], [`ResolvedConfig`]): builtin,
//!   runtime and provider layers, resolved per module id.
//! - **Transactions** ([`Txn`], [`Proposal`], [`CommitMeta`]): what a commit
//!   carries and what observers receive.
//! - **Lanes** ([`TxnQueue`]): urgent work first, debounced and coalesced
//!   background work, and a max-lag watchdog.
//! - **Replay** ([`ReplayLog`]): record external reads and play them back
//!   without loaders.
//! - **Runtime** ([`DocumentHandle`]): a tokio actor that owns the queue,
//!   its timers and in-flight resource loads.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde_json::json;
//! use understory_converge::{Program, RuleDecl, Source};
//! use understory_transaction::{Document, SourceSettlement, Txn};
//!
//! let program = Program::builder("account")
//!     .rule(RuleDecl::new(
//!         "profile",
//!         Source::new("user", ["userId"], |s| Ok(s.read("userId").cloned())),
//!     ))
//!     .build()
//!     .unwrap();
//!
//! let mut doc = Document::builder(Arc::new(program)).build(json!({})).unwrap();
//! doc.commit(vec![Txn::new().set("userId", json!(1))]).unwrap();
//!
//! // The host performs the load and commits the result.
//! let effects = doc.take_effects();
//! let result = SourceSettlement::from_result(&effects.loads[0], Ok(json!({ "name": "Ada" })));
//! doc.commit(vec![Txn::settle(result)]).unwrap();
//! assert_eq!(doc.state()["profile"]["status"], json!("success"));
//! assert_eq!(doc.seq(), 2);
//! ```

mod config;
mod document;
mod queue;
mod replay;
mod runtime;
mod txn;

pub use config::{
    ConfigError, ConfigLayers, ConfigPatch, ConfigScope, ConvergePatch, ConvergePolicy,
    DiagnosticsPolicy, LanePolicy, LanesPatch, OverrideMode, PlanCachePatch, PlanCachePolicy,
    QueueMode, ResolvedConfig,
};
pub use document::{Commit, Document, DocumentBuilder, Effects, TxnError};
pub use queue::{Batch, FlushReason, QueuePolicy, TxnQueue};
pub use replay::{ReplayError, ReplayLog, ReplayLogEvent, ReplayMode, ReplayPhase, ReplayTag};
pub use runtime::{DocumentHandle, FnLoader, Loaders, Published, ResourceLoader};
pub use txn::{
    CommitMeta, CommitMode, Lane, Mutation, Priority, Proposal, Txn, TxnDescriptor, TxnOrigin,
};

pub use understory_converge::SourceSettlement;
