// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Structured diagnostic records and where they go.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::budget::DegradeReason;
use crate::converge::ConvergeSummary;
use crate::deps_trace::DepsMismatch;
use crate::plan_cache::CacheDisableReason;
use crate::validate::ValidationReport;

/// How much a document reports.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticsLevel {
    /// Nothing.
    #[default]
    Off,
    /// Convergence summaries, degradations and cache changes.
    Light,
    /// Everything, including deps tracing, validation and step timings.
    Full,
}

/// One diagnostic record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Diagnostic {
    /// Summary of a committed convergence pass.
    Converge {
        /// Module of the document.
        module_id: String,
        /// Commit sequence number.
        seq: u64,
        /// The pass.
        summary: ConvergeSummary,
    },
    /// A pass was cut short.
    Degraded {
        /// Module of the document.
        module_id: String,
        /// Commit sequence number.
        seq: u64,
        /// Why.
        reason: DegradeReason,
        /// Step that failed or was about to run.
        step: String,
        /// Whether the fallback converged.
        recovered: bool,
    },
    /// Declared deps disagree with observed reads.
    DepsMismatch {
        /// Module of the document.
        module_id: String,
        /// The disagreement.
        mismatch: DepsMismatch,
    },
    /// The plan cache turned itself off.
    CacheDisabled {
        /// Module of the document.
        module_id: String,
        /// Why.
        reason: CacheDisableReason,
    },
    /// Validation ran.
    Validation {
        /// Module of the document.
        module_id: String,
        /// Commit sequence number.
        seq: u64,
        /// What ran.
        report: ValidationReport,
    },
}

impl Diagnostic {
    /// Lowest level at which this record is emitted.
    #[must_use]
    pub fn level(&self) -> DiagnosticsLevel {
        match self {
            Self::Converge { .. } | Self::Degraded { .. } | Self::CacheDisabled { .. } => {
                DiagnosticsLevel::Light
            }
            Self::DepsMismatch { .. } | Self::Validation { .. } => DiagnosticsLevel::Full,
        }
    }
}

/// Receives diagnostic records.
pub trait DiagnosticsSink: Send + Sync {
    /// Handles one record.
    fn record(&self, diagnostic: &Diagnostic);
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies the records out.
    #[must_use]
    pub fn records(&self) -> Vec<Diagnostic> {
        self.records.lock().clone()
    }

    /// Takes the records, leaving the sink empty.
    pub fn take(&self) -> Vec<Diagnostic> {
        core::mem::take(&mut *self.records.lock())
    }
}

impl DiagnosticsSink for MemorySink {
    fn record(&self, diagnostic: &Diagnostic) {
        self.records.lock().push(diagnostic.clone());
    }
}

/// Forwards records to `tracing` as JSON.
#[derive(Copy, Clone, Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn record(&self, diagnostic: &Diagnostic) {
        let json = serde_json::to_string(diagnostic).unwrap_or_default();
        match diagnostic.level() {
            DiagnosticsLevel::Light => tracing::warn!(target: "understory_converge::diagnostics", %json, "diagnostic"),
            _ => tracing::debug!(target: "understory_converge::diagnostics", %json, "diagnostic"),
        }
    }
}
