//! Sub-step recording contract for the path-query engine
//!
//! The orchestrating reasoning-state recorder lives outside this crate;
//! the engine only needs a sink it can hand structured step records to.
//! Recording is strictly best-effort: a failing recorder must never fail
//! the query it was observing.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Outcome of a recorded sub-step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success,
    Failure,
}

/// One recorded sub-step of a path query (LCA computation, decomposition).
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// Session the steps belong to, assigned by the engine at construction.
    pub session_id: String,
    /// Monotonically increasing step number within the session.
    pub step_number: u64,
    /// Unix milliseconds UTC.
    pub timestamp_millis: i64,
    /// Always "system"; sub-steps are never user-authored.
    pub actor: &'static str,
    /// Tool that produced the step, e.g. "hld.lca".
    pub tool: String,
    /// Primary subject of the step (the `u` endpoint).
    pub target: String,
    /// Secondary subject (the `v` endpoint).
    pub query: String,
    pub outcome: StepOutcome,
    /// Stable error category label when `outcome` is a failure.
    pub error_category: Option<String>,
    pub duration_micros: i64,
    /// Short human-readable result, e.g. `LCA(u,v)=w [cached]`.
    pub summary: String,
}

impl StepRecord {
    /// Start a record stamped now; the engine fills in outcome and timing.
    pub fn begin(
        session_id: impl Into<String>,
        step_number: u64,
        tool: impl Into<String>,
        target: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            step_number,
            timestamp_millis: Utc::now().timestamp_millis(),
            actor: "system",
            tool: tool.into(),
            target: target.into(),
            query: query.into(),
            outcome: StepOutcome::Success,
            error_category: None,
            duration_micros: 0,
            summary: String::new(),
        }
    }
}

/// Sink for sub-step records. Implementations must be thread-safe; the
/// engine may record from concurrent queries.
pub trait StepRecorder: Send + Sync {
    fn record(&self, record: StepRecord) -> anyhow::Result<()>;
}

/// In-memory recorder, mainly for tests and local debugging.
#[derive(Default)]
pub struct VecRecorder {
    records: Mutex<Vec<StepRecord>>,
}

impl VecRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<StepRecord> {
        self.records.lock().clone()
    }
}

impl StepRecorder for VecRecorder {
    fn record(&self, record: StepRecord) -> anyhow::Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}
