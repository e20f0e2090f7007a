// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recording a session and replaying it against a fresh document.

use std::sync::Arc;

use serde_json::{Value, json};
use understory_converge::{Program, RuleDecl, Source};
use understory_transaction::{
    Document, ReplayError, ReplayLog, ReplayPhase, SourceSettlement, Txn, TxnError,
};

fn program() -> Arc<Program> {
    Arc::new(
        Program::builder("account")
            .rule(RuleDecl::new(
                "profile",
                Source::new("user", ["userId"], |s| Ok(s.read("userId").cloned())),
            ))
            .build()
            .unwrap(),
    )
}

fn fake_loader(key: &Value, calls: &mut usize) -> Result<Value, Value> {
    *calls += 1;
    Ok(json!({ "id": key, "name": "Ada" }))
}

/// Runs the session and returns the serialized `profile` after each commit.
fn record(log: &ReplayLog, calls: &mut usize) -> Vec<String> {
    let mut doc = Document::builder(program())
        .record(log.clone())
        .build(json!({}))
        .unwrap();
    let mut snapshots = Vec::new();
    doc.commit(vec![Txn::new().set("userId", json!(1))]).unwrap();
    snapshots.push(doc.state()["profile"].to_string());

    for load in doc.take_effects().loads {
        let result = fake_loader(&load.key, calls);
        let settlement = SourceSettlement::from_result(&load, result);
        doc.commit(vec![Txn::settle(settlement)]).unwrap();
        snapshots.push(doc.state()["profile"].to_string());
    }
    snapshots
}

#[test]
fn replay_reproduces_snapshots_without_loaders() {
    let log = ReplayLog::new();
    let mut calls = 0;
    let recorded = record(&log, &mut calls);
    assert_eq!(calls, 1);
    let phases: Vec<ReplayPhase> = log.events().iter().map(|e| e.phase).collect();
    assert_eq!(phases, vec![ReplayPhase::Loading, ReplayPhase::Success]);

    let replay = ReplayLog::from_events(log.events());
    let mut doc = Document::builder(program())
        .replay(replay.clone())
        .build(json!({}))
        .unwrap();
    let mut replayed = Vec::new();
    doc.commit(vec![Txn::new().set("userId", json!(1))]).unwrap();
    replayed.push(doc.state()["profile"].to_string());

    let effects = doc.take_effects();
    assert!(effects.loads.is_empty(), "replay never asks for a load");
    for settlement in effects.settlements {
        doc.commit(vec![Txn::settle(settlement)]).unwrap();
        replayed.push(doc.state()["profile"].to_string());
    }

    assert_eq!(replayed, recorded);
    assert!(replay.is_exhausted());
    assert_eq!(doc.state()["profile"]["status"], json!("success"));
}

#[test]
fn drift_aborts_the_transaction() {
    let log = ReplayLog::new();
    let mut calls = 0;
    record(&log, &mut calls);

    let replay = ReplayLog::from_events(log.events());
    let mut doc = Document::builder(program())
        .replay(replay.clone())
        .build(json!({}))
        .unwrap();
    let err = doc
        .commit(vec![Txn::new().set("userId", json!(2))])
        .unwrap_err();
    assert!(matches!(err, TxnError::Replay(ReplayError::Mismatch { cursor: 0, .. })));
    assert_eq!(doc.seq(), 0, "nothing committed");
    assert_eq!(doc.state()["profile"], json!({ "status": "idle" }));
    assert_eq!(replay.cursor(), 0);

    // The log is still usable once the program does what was recorded.
    doc.commit(vec![Txn::new().set("userId", json!(1))]).unwrap();
    assert_eq!(doc.take_effects().settlements.len(), 1);
}

#[test]
fn exhausted_log_is_an_error() {
    let replay = ReplayLog::new();
    let mut doc = Document::builder(program())
        .replay(replay)
        .build(json!({}))
        .unwrap();
    let err = doc
        .commit(vec![Txn::new().set("userId", json!(1))])
        .unwrap_err();
    assert!(matches!(err, TxnError::Replay(ReplayError::Exhausted { .. })));
}

#[test]
fn events_round_trip_through_json() {
    let log = ReplayLog::new();
    let mut calls = 0;
    record(&log, &mut calls);
    let text = serde_json::to_string(&log.events()).unwrap();
    let events = serde_json::from_str(&text).unwrap();
    assert_eq!(ReplayLog::from_events(events).events(), log.events());
}
