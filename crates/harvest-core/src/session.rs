//! Read-only view of the externally owned session lifecycle and the gates
//! that decide whether a phase may run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Session lifecycle as published by the orchestrator. Never mutated here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Created,
    Collecting,
    CollectDone,
    Parsing,
    Completed,
    Failed,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStatus::Created => "created",
            LifecycleStatus::Collecting => "collecting",
            LifecycleStatus::CollectDone => "collect_done",
            LifecycleStatus::Parsing => "parsing",
            LifecycleStatus::Completed => "completed",
            LifecycleStatus::Failed => "failed",
            LifecycleStatus::Stopped => "stopped",
            LifecycleStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleStatus::Completed | LifecycleStatus::Failed | LifecycleStatus::Stopped
        )
    }
}

impl fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn unknown_status() -> LifecycleStatus {
    LifecycleStatus::Unknown
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default = "unknown_status")]
    pub lifecycle_status: LifecycleStatus,
    #[serde(default)]
    pub can_collect: bool,
    #[serde(default)]
    pub has_collect_executed: bool,
    #[serde(default)]
    pub has_parsing_started: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    #[serde(default)]
    pub pending: u64,
}

/// Response of a full-scan reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    #[serde(default)]
    pub after: QueueCounts,
}

impl ResetOutcome {
    pub fn pending(&self) -> u64 {
        self.after.pending
    }
}

/// Whether a phase may run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseDecision {
    Proceed,
    /// Nothing to do; exit successfully without side effects.
    Skip(String),
    /// Precondition violated; exit with failure without side effects.
    Abort(String),
}

/// Collect runs at most once per session.
pub fn collect_gate(state: &SessionState) -> PhaseDecision {
    if state.has_collect_executed {
        return PhaseDecision::Skip(format!(
            "collect already executed (lifecycle_status={})",
            state.lifecycle_status
        ));
    }
    if !state.can_collect {
        return PhaseDecision::Abort(format!(
            "collect not allowed (lifecycle_status={})",
            state.lifecycle_status
        ));
    }
    PhaseDecision::Proceed
}

/// Reset runs once, after collect finished and before parsing starts.
pub fn reset_gate(state: &SessionState) -> PhaseDecision {
    if state.has_parsing_started {
        return PhaseDecision::Skip(format!(
            "parsing already started (lifecycle_status={})",
            state.lifecycle_status
        ));
    }
    if state.lifecycle_status != LifecycleStatus::CollectDone {
        return PhaseDecision::Abort(format!(
            "reset requires collect_done (lifecycle_status={})",
            state.lifecycle_status
        ));
    }
    PhaseDecision::Proceed
}
