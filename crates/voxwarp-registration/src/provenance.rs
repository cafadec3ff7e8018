//! Run identifiers and invocation provenance attached to every output.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Short unique identifier for one pipeline run.
///
/// Derived from the wall clock, the process id and a process-local counter;
/// unique enough to name scratch files and tag outputs.
pub fn new_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed) as u64;
    let mixed = nanos ^ (pid << 32) ^ (count << 56);
    format!("vw{mixed:016x}")
}

/// Provenance record written next to every persisted output.
#[derive(Debug, Clone, Serialize)]
pub struct Provenance {
    pub run_id: String,
    pub program: String,
    pub version: String,
    /// The full invocation, argv-style.
    pub invocation: Vec<String>,
    /// Seconds since the Unix epoch at run start.
    pub started_at: u64,
}

impl Provenance {
    pub fn new(invocation: Vec<String>) -> Self {
        Self {
            run_id: new_run_id(),
            program: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            invocation,
            started_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Capture the current process invocation.
    pub fn from_current_invocation() -> Self {
        Self::new(std::env::args().collect())
    }
}
