//! Logging setup and operation-scoped log correlation
//!
//! Two small pieces: a one-shot `tracing` subscriber installer with three
//! verbosity tiers, and an [`OpTimer`] that stamps multi-step operations
//! (builds, traversals, path queries) with a short trace token so their
//! completion lines can be grepped back together. Numeric metrics for the
//! path-query subsystem live in [`crate::metrics`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

static COMPLETED_OPS: AtomicU64 = AtomicU64::new(0);
static FAILED_OPS: AtomicU64 = AtomicU64::new(0);

/// Filter directives per verbosity tier.
const QUIET_DIRECTIVES: &str = "error";
const VERBOSE_DIRECTIVES: &str = "relgraph=debug,info";
const DEFAULT_DIRECTIVES: &str = "relgraph=warn,error";

/// Install the subscriber with default verbosity. Call once at startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Install the subscriber. Precedence, strongest first: `quiet`, then a
/// `RUST_LOG` override, then `verbose`, then the default tier.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let directives = if quiet {
        QUIET_DIRECTIVES.to_string()
    } else if let Ok(env) = std::env::var("RUST_LOG") {
        env
    } else if verbose {
        VERBOSE_DIRECTIVES.to_string()
    } else {
        DEFAULT_DIRECTIVES.to_string()
    };
    let filter =
        EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    // try_init fails when a subscriber is already installed, which is the
    // normal situation under `cargo test`; the first installation wins.
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init()
        .is_ok();
    if installed && !quiet {
        info!(directives = %directives, "relgraph logging installed");
    }
    Ok(())
}

/// Operation kinds for structured completion logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    GraphBuild {
        files: usize,
        nodes: usize,
        edges: usize,
    },
    GraphFreeze {
        nodes: usize,
        edges: usize,
    },
    PathQuery {
        from: String,
        to: String,
        aggregation: String,
    },
    Traversal {
        root: String,
        visited: usize,
    },
    Analytics {
        kind: String,
        result_count: usize,
    },
    QueryServe {
        operation: String,
        result_count: usize,
    },
}

/// Running timer for one named operation. Created at the start of the work,
/// consumed by [`OpTimer::finish`], which writes a single completion line
/// carrying the trace token, elapsed time, and any attached fields.
#[derive(Debug)]
pub struct OpTimer {
    name: &'static str,
    /// First eight hex chars of a v4 UUID; unique enough to grep a log.
    trace: String,
    started: Instant,
    fields: Vec<(&'static str, String)>,
}

impl OpTimer {
    pub fn start(name: &'static str) -> Self {
        let mut trace = Uuid::new_v4().simple().to_string();
        trace.truncate(8);
        Self {
            name,
            trace,
            started: Instant::now(),
            fields: Vec::new(),
        }
    }

    /// Attach a key/value pair to the completion line.
    pub fn field(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    /// The trace token, for correlating nested log lines by hand.
    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Write the completion line and bump the process-wide counters.
    pub fn finish(self, operation: &Operation, outcome: &Result<()>) {
        let fields = self
            .fields
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => {
                COMPLETED_OPS.fetch_add(1, Ordering::Relaxed);
                info!(
                    trace = %self.trace,
                    op = self.name,
                    elapsed_ms,
                    %fields,
                    "completed {operation:?}"
                );
            }
            Err(err) => {
                FAILED_OPS.fetch_add(1, Ordering::Relaxed);
                error!(
                    trace = %self.trace,
                    op = self.name,
                    elapsed_ms,
                    %fields,
                    error = %err,
                    "failed {operation:?}"
                );
            }
        }
    }
}

/// Run a future under a fresh trace token, logging its start and outcome.
pub async fn with_trace_id<F, T>(name: &'static str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let timer = OpTimer::start(name);
    debug!(trace = %timer.trace(), op = name, "starting");

    let result = f.await;
    let elapsed_ms = timer.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => {
            COMPLETED_OPS.fetch_add(1, Ordering::Relaxed);
            debug!(trace = %timer.trace(), op = name, elapsed_ms, "done");
        }
        Err(err) => {
            FAILED_OPS.fetch_add(1, Ordering::Relaxed);
            error!(trace = %timer.trace(), op = name, elapsed_ms, error = %err, "failed");
        }
    }
    result
}

/// (operations completed, operations failed) since process start.
pub fn operation_counters() -> (u64, u64) {
    (
        COMPLETED_OPS.load(Ordering::Relaxed),
        FAILED_OPS.load(Ordering::Relaxed),
    )
}
